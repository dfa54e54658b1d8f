use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::expression::Operator;

/// Attribute name to value, usually decoded straight from a JSON request body.
pub type InputRecord = Map<String, Value>;

/// Condition label to the value the input attribute is compared against.
pub type RuleConditions = Map<String, Value>;

/// One entry of a rule set's condition vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionDef {
    pub label: String,
    pub attribute: String,
    pub operator: String,
}

/// Declared input attribute. Advisory only; the engine does not enforce it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyField {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Declared shape of the action values produced by a rule set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSchema {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub attribute: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSetDescription {
    #[serde(default)]
    pub condition: String,
    #[serde(default)]
    pub action: String,
}

/// A stored rule. `id` is assigned by the append service and never by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub action: Value,
}

/// A rule as submitted by a caller. Any `id` field in the payload is ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub action: Value,
}

impl NewRule {
    pub fn new(conditions: RuleConditions, action: impl Into<Value>) -> Self {
        Self {
            conditions,
            action: action.into(),
        }
    }

    pub(crate) fn with_id(self, id: i64) -> Rule {
        Rule {
            id,
            conditions: self.conditions,
            action: self.action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub description: RuleSetDescription,
    pub bodies: Vec<BodyField>,
    pub conditions: Vec<ConditionDef>,
    pub action: ActionSchema,
    pub rules: Vec<Rule>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating or fully replacing a rule set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRuleSet {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub description: RuleSetDescription,
    #[serde(default)]
    pub bodies: Vec<BodyField>,
    #[serde(default)]
    pub conditions: Vec<ConditionDef>,
    #[serde(default)]
    pub action: ActionSchema,
    #[serde(default)]
    pub rules: Vec<NewRule>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleSetValidationError {
    #[error("rule set name is required")]
    MissingName,
    #[error("rule set endpoint is required")]
    MissingEndpoint,
    #[error("condition #{index} is missing a label")]
    MissingConditionLabel { index: usize },
    #[error("condition '{label}' is missing an attribute")]
    MissingConditionAttribute { label: String },
    #[error("condition label '{0}' is defined more than once")]
    DuplicateConditionLabel(String),
    #[error("condition '{label}' uses unsupported operator '{operator}'")]
    UnsupportedOperator { label: String, operator: String },
}

impl NewRuleSet {
    /// Check the fields the engine relies on. An empty condition dictionary is allowed.
    pub fn validate(&self) -> Result<(), RuleSetValidationError> {
        if self.name.trim().is_empty() {
            return Err(RuleSetValidationError::MissingName);
        }
        if self.endpoint.trim().is_empty() {
            return Err(RuleSetValidationError::MissingEndpoint);
        }

        let mut seen = HashSet::new();
        for (index, def) in self.conditions.iter().enumerate() {
            if def.label.trim().is_empty() {
                return Err(RuleSetValidationError::MissingConditionLabel { index });
            }
            if def.attribute.trim().is_empty() {
                return Err(RuleSetValidationError::MissingConditionAttribute {
                    label: def.label.clone(),
                });
            }
            if !seen.insert(def.label.as_str()) {
                return Err(RuleSetValidationError::DuplicateConditionLabel(
                    def.label.clone(),
                ));
            }
            if def.operator.parse::<Operator>().is_err() {
                return Err(RuleSetValidationError::UnsupportedOperator {
                    label: def.label.clone(),
                    operator: def.operator.clone(),
                });
            }
        }
        Ok(())
    }
}
