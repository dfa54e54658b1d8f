use std::collections::HashSet;

use thiserror::Error;

use super::types::{NewRule, Rule};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AppendError {
    #[error("rule id {id} already exists in this rule set")]
    IdentityConflict { id: i64 },
}

/// Number `new_rules` in input order, continuing after `existing_count`.
pub fn assign_rule_ids(existing_count: usize, new_rules: Vec<NewRule>) -> Vec<Rule> {
    new_rules
        .into_iter()
        .enumerate()
        .map(|(position, rule)| rule.with_id((existing_count + position + 1) as i64))
        .collect()
}

/// Assign ids to a batch destined for a rule set that already holds `existing`.
///
/// Ids continue from the number of stored rules. If the stored ids are not a
/// contiguous `1..=n` run (data written before ids were unique), the batch is
/// refused instead of producing a duplicate.
pub fn append_rules(existing: &[Rule], new_rules: Vec<NewRule>) -> Result<Vec<Rule>, AppendError> {
    let taken: HashSet<i64> = existing.iter().map(|rule| rule.id).collect();
    let assigned = assign_rule_ids(existing.len(), new_rules);
    if let Some(conflict) = assigned.iter().find(|rule| taken.contains(&rule.id)) {
        return Err(AppendError::IdentityConflict { id: conflict.id });
    }
    Ok(assigned)
}
