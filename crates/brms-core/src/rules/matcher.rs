//! First-match-wins evaluation of a rule set against an input record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::dictionary::ConditionDictionary;
use super::expression::{EvaluationContext, EvaluationError, ExpressionEvaluator};
use super::types::{ConditionDef, InputRecord, Rule, RuleSet};

/// How a rule's condition labels are reconciled with the dictionary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Walk the dictionary and skip labels a rule does not use. Rules whose
    /// labels are all undefined match vacuously, and with an empty dictionary
    /// the first rule always matches.
    #[default]
    Compatible,
    /// Walk the rule's own labels. Rules without conditions always match and
    /// an undefined label is an error.
    Strict,
}

impl MatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::Compatible => "compatible",
            MatchMode::Strict => "strict",
        }
    }
}

impl fmt::Display for MatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compatible" => Ok(Self::Compatible),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown match mode '{other}'")),
        }
    }
}

/// Why a rule was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    /// The rule has no conditions.
    Unconditional,
    /// Every applicable condition evaluated to true.
    ConditionsHeld,
    /// No condition of the rule was evaluated.
    Vacuous,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        rule_id: i64,
        action: Value,
        reason: MatchReason,
    },
    NoMatch,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, MatchOutcome::Matched { .. })
    }

    pub fn action(&self) -> Option<&Value> {
        match self {
            MatchOutcome::Matched { action, .. } => Some(action),
            MatchOutcome::NoMatch => None,
        }
    }

    pub fn rule_id(&self) -> Option<i64> {
        match self {
            MatchOutcome::Matched { rule_id, .. } => Some(*rule_id),
            MatchOutcome::NoMatch => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("rule {rule_id}: {source}")]
    Evaluation {
        rule_id: i64,
        #[source]
        source: EvaluationError,
    },
    #[error("rule {rule_id} references undefined condition label '{label}'")]
    UnknownConditionLabel { rule_id: i64, label: String },
}

impl MatchError {
    pub fn rule_id(&self) -> i64 {
        match self {
            MatchError::Evaluation { rule_id, .. }
            | MatchError::UnknownConditionLabel { rule_id, .. } => *rule_id,
        }
    }
}

pub struct RuleMatcher<'a> {
    dictionary: ConditionDictionary<'a>,
    rules: &'a [Rule],
    mode: MatchMode,
}

impl<'a> RuleMatcher<'a> {
    pub fn new(conditions: &'a [ConditionDef], rules: &'a [Rule]) -> Self {
        Self {
            dictionary: ConditionDictionary::new(conditions),
            rules,
            mode: MatchMode::default(),
        }
    }

    pub fn for_rule_set(rule_set: &'a RuleSet) -> Self {
        Self::new(&rule_set.conditions, &rule_set.rules)
    }

    pub fn with_mode(mut self, mode: MatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn evaluate(&self, input: &InputRecord) -> Result<MatchOutcome, MatchError> {
        self.evaluate_with(input, &mut EvaluationContext::new())
    }

    /// Evaluate rules in order and return the first match. Any evaluation
    /// error aborts the whole attempt.
    pub fn evaluate_with<E: ExpressionEvaluator>(
        &self,
        input: &InputRecord,
        evaluator: &mut E,
    ) -> Result<MatchOutcome, MatchError> {
        for rule in self.rules {
            let reason = match self.mode {
                MatchMode::Compatible => self.check_compatible(rule, input, evaluator)?,
                MatchMode::Strict => self.check_strict(rule, input, evaluator)?,
            };
            if let Some(reason) = reason {
                return Ok(MatchOutcome::Matched {
                    rule_id: rule.id,
                    action: rule.action.clone(),
                    reason,
                });
            }
        }
        Ok(MatchOutcome::NoMatch)
    }

    fn check_compatible<E: ExpressionEvaluator>(
        &self,
        rule: &Rule,
        input: &InputRecord,
        evaluator: &mut E,
    ) -> Result<Option<MatchReason>, MatchError> {
        // With an empty dictionary every rule falls through to `Vacuous`.
        if rule.conditions.is_empty() && !self.dictionary.is_empty() {
            return Ok(Some(MatchReason::Unconditional));
        }

        let mut results = Vec::new();
        for def in self.dictionary.entries() {
            let Some(expected) = rule.conditions.get(&def.label) else {
                continue;
            };
            results.push(evaluate_condition(
                rule,
                input,
                &def.attribute,
                &def.operator,
                expected,
                evaluator,
            )?);
        }

        Ok(verdict(&results))
    }

    fn check_strict<E: ExpressionEvaluator>(
        &self,
        rule: &Rule,
        input: &InputRecord,
        evaluator: &mut E,
    ) -> Result<Option<MatchReason>, MatchError> {
        if rule.conditions.is_empty() {
            return Ok(Some(MatchReason::Unconditional));
        }
        if let Some(label) = rule
            .conditions
            .keys()
            .find(|label| self.dictionary.resolve(label).is_none())
        {
            return Err(MatchError::UnknownConditionLabel {
                rule_id: rule.id,
                label: label.clone(),
            });
        }

        let mut results = Vec::with_capacity(rule.conditions.len());
        for def in self.dictionary.entries() {
            if let Some(expected) = rule.conditions.get(&def.label) {
                results.push(evaluate_condition(
                    rule,
                    input,
                    &def.attribute,
                    &def.operator,
                    expected,
                    evaluator,
                )?);
            }
        }

        Ok(verdict(&results))
    }
}

/// Missing and null attributes count as a failed condition, not an error.
fn evaluate_condition<E: ExpressionEvaluator>(
    rule: &Rule,
    input: &InputRecord,
    attribute: &str,
    operator: &str,
    expected: &Value,
    evaluator: &mut E,
) -> Result<bool, MatchError> {
    match input.get(attribute) {
        None | Some(Value::Null) => Ok(false),
        Some(value) => evaluator
            .evaluate(value, operator, expected)
            .map_err(|source| MatchError::Evaluation {
                rule_id: rule.id,
                source,
            }),
    }
}

fn verdict(results: &[bool]) -> Option<MatchReason> {
    if results.is_empty() {
        Some(MatchReason::Vacuous)
    } else if results.iter().all(|held| *held) {
        Some(MatchReason::ConditionsHeld)
    } else {
        None
    }
}
