pub mod config;
pub mod db;
pub mod migrations;
pub mod rules;
pub mod telemetry;

pub use config::Config;
pub use db::Database;
pub use rules::{
    ExecutorError, MatchMode, MatchOutcome, NewRule, NewRuleSet, Rule, RuleExecutor, RuleSet,
    RuleSetError, RuleSetRepository,
};
pub use telemetry::{TelemetryError, TelemetryGuard, init_telemetry};
