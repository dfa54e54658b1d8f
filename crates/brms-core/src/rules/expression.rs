//! Binary comparison of an input value against a rule's expected value.
//!
//! Operands are compared as typed JSON values. When both sides look numeric
//! (numbers, or strings holding a finite number) they are compared as `f64`,
//! so `"5" == 5` holds. Two JSON integers are compared exactly. Otherwise equality is decided on a canonical textual
//! rendering and ordering is only defined between two strings.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `=~`: textual input matches the expected regex.
    Matches,
    /// `!~`: textual input does not match the expected regex.
    NotMatches,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Matches => "=~",
            Operator::NotMatches => "!~",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Ne => ordering != Ordering::Equal,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Ge => ordering != Ordering::Less,
            Operator::Matches | Operator::NotMatches => false,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = EvaluationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "=~" => Ok(Self::Matches),
            "!~" => Ok(Self::NotMatches),
            _ => Err(EvaluationError::UnsupportedOperator(value.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),
    #[error("operator '{operator}' cannot compare {left} with {right}")]
    Incomparable {
        operator: Operator,
        left: &'static str,
        right: &'static str,
    },
    #[error("invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

/// Seam between the rule matcher and the comparison logic.
pub trait ExpressionEvaluator {
    fn evaluate(
        &mut self,
        input: &Value,
        operator: &str,
        expected: &Value,
    ) -> Result<bool, EvaluationError>;
}

/// Default evaluator. Holds compiled regexes for the duration of one match.
#[derive(Debug, Default)]
pub struct EvaluationContext {
    regex_cache: HashMap<String, Regex>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_compile_regex(&mut self, pattern: &str) -> Result<&Regex, EvaluationError> {
        if !self.regex_cache.contains_key(pattern) {
            let compiled = Regex::new(pattern).map_err(|source| EvaluationError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;
            self.regex_cache.insert(pattern.to_string(), compiled);
        }

        Ok(self
            .regex_cache
            .get(pattern)
            .expect("regex should be present after insertion"))
    }
}

impl ExpressionEvaluator for EvaluationContext {
    fn evaluate(
        &mut self,
        input: &Value,
        operator: &str,
        expected: &Value,
    ) -> Result<bool, EvaluationError> {
        let operator: Operator = operator.parse()?;
        match operator {
            Operator::Matches | Operator::NotMatches => {
                let pattern = canonical_text(expected);
                let matched = self
                    .get_or_compile_regex(&pattern)?
                    .is_match(&canonical_text(input));
                Ok(matched == (operator == Operator::Matches))
            }
            _ => compare(input, operator, expected),
        }
    }
}

/// Evaluate a single comparison without keeping any state around.
pub fn evaluate(input: &Value, operator: &str, expected: &Value) -> Result<bool, EvaluationError> {
    EvaluationContext::new().evaluate(input, operator, expected)
}

fn compare(input: &Value, operator: Operator, expected: &Value) -> Result<bool, EvaluationError> {
    if let Some(ordering) = integer_ordering(input, expected) {
        return Ok(operator.accepts(ordering));
    }
    if let (Some(left), Some(right)) = (as_number(input), as_number(expected)) {
        let ordering = left.partial_cmp(&right).ok_or(EvaluationError::Incomparable {
            operator,
            left: kind(input),
            right: kind(expected),
        })?;
        return Ok(operator.accepts(ordering));
    }

    match (operator, input, expected) {
        (Operator::Eq | Operator::Ne, _, _) => {
            let ordering = if canonical_text(input) == canonical_text(expected) {
                Ordering::Equal
            } else {
                Ordering::Less
            };
            Ok(operator.accepts(ordering))
        }
        (_, Value::String(left), Value::String(right)) => Ok(operator.accepts(left.cmp(right))),
        _ => Err(EvaluationError::Incomparable {
            operator,
            left: kind(input),
            right: kind(expected),
        }),
    }
}

/// Exact ordering when both operands are JSON integers, so values beyond
/// 2^53 do not collapse together in `f64`.
fn integer_ordering(input: &Value, expected: &Value) -> Option<Ordering> {
    let (Value::Number(left), Value::Number(right)) = (input, expected) else {
        return None;
    };
    let as_wide = |number: &serde_json::Number| {
        number
            .as_i64()
            .map(i128::from)
            .or_else(|| number.as_u64().map(i128::from))
    };
    Some(as_wide(left)?.cmp(&as_wide(right)?))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Textual form used for equality and regex matching.
pub fn canonical_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(text) => Cow::Borrowed(text.as_str()),
        Value::Null => Cow::Borrowed("null"),
        Value::Bool(true) => Cow::Borrowed("true"),
        Value::Bool(false) => Cow::Borrowed("false"),
        other => Cow::Owned(other.to_string()),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
