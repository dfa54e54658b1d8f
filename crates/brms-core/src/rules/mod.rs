pub mod append;
pub mod dictionary;
pub mod executor;
pub mod expression;
pub mod matcher;
pub mod repositories;
pub mod types;

pub use append::{AppendError, append_rules, assign_rule_ids};
pub use dictionary::ConditionDictionary;
pub use executor::{ExecutorError, RuleExecutor};
pub use expression::{EvaluationContext, EvaluationError, ExpressionEvaluator, Operator, evaluate};
pub use matcher::{MatchError, MatchMode, MatchOutcome, MatchReason, RuleMatcher};
pub use repositories::{RuleSetError, RuleSetLookup, RuleSetRepository};
pub use types::{
    ActionSchema, BodyField, ConditionDef, InputRecord, NewRule, NewRuleSet, Rule, RuleConditions,
    RuleSet, RuleSetDescription, RuleSetValidationError,
};
