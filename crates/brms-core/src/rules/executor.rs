use thiserror::Error;

use super::matcher::{MatchError, MatchMode, MatchOutcome, RuleMatcher};
use super::repositories::{RuleSetError, RuleSetLookup, RuleSetRepository};
use super::types::InputRecord;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("rule set lookup failed: {0}")]
    Lookup(#[from] RuleSetError),
    #[error("rule evaluation failed: {0}")]
    Match(#[from] MatchError),
}

/// Loads a rule set by name and runs the matcher over an input record.
#[derive(Clone)]
pub struct RuleExecutor<L = RuleSetRepository> {
    lookup: L,
    mode: MatchMode,
}

impl<L: RuleSetLookup> RuleExecutor<L> {
    pub fn new(lookup: L, mode: MatchMode) -> Self {
        Self { lookup, mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    #[tracing::instrument(skip(self, input), fields(mode = %self.mode))]
    pub async fn execute(
        &self,
        rule_set_name: &str,
        input: &InputRecord,
    ) -> Result<MatchOutcome, ExecutorError> {
        let rule_set = self.lookup.find_by_name(rule_set_name).await?;
        let outcome = RuleMatcher::for_rule_set(&rule_set)
            .with_mode(self.mode)
            .evaluate(input)
            .inspect_err(|err| {
                tracing::warn!(rule_id = err.rule_id(), error = %err, "rule evaluation failed")
            })?;

        match &outcome {
            MatchOutcome::Matched {
                rule_id, reason, ..
            } => tracing::debug!(rule_id, ?reason, "rule matched"),
            MatchOutcome::NoMatch => {
                tracing::debug!(rules = rule_set.rules.len(), "no rule matched")
            }
        }
        Ok(outcome)
    }
}
