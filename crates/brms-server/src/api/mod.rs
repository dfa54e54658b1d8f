//! HTTP API for rule set management and execution.
//!
//! Routes keep the flat, query-addressed layout existing clients call:
//! - POST /insertRuleTemplate
//! - PATCH /insertRuletoRuleSet?ruleSetName=
//! - PUT /updateRuleSet?ruleSetName=
//! - POST /execInput?ruleSetName=
//! - GET /fetchRules
//! - GET /fetchRuleSet?ruleSetName=
//! - DELETE /deleteRuleSet?ruleSetName=

pub mod rule_sets;

use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use brms_core::{ExecutorError, RuleSetError, rules::AppendError};

pub use rule_sets::router;

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "conflict", message)
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "unprocessable_entity", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self)).into_response()
    }
}

impl From<RuleSetError> for ApiError {
    fn from(err: RuleSetError) -> Self {
        match err {
            RuleSetError::NotFound(name) => Self::not_found(format!("rule set '{name}' not found")),
            RuleSetError::Conflict(name) => {
                Self::conflict(format!("rule set '{name}' already exists"))
            }
            RuleSetError::Append(AppendError::IdentityConflict { id }) => {
                Self::conflict(format!("rule id {id} already exists in this rule set"))
            }
            err @ (RuleSetError::Invalid(_) | RuleSetError::RenameNotSupported { .. }) => {
                Self::bad_request(err.to_string())
            }
            err => {
                tracing::error!(error = %err, "rule set storage failed");
                Self::internal("rule set storage failed")
            }
        }
    }
}

impl From<ExecutorError> for ApiError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Lookup(err) => err.into(),
            ExecutorError::Match(err) => Self::unprocessable(err.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        tracing::debug!(error = %rejection.body_text(), "rejected request body");
        Self::unprocessable("The request entity contains invalid or missing data")
    }
}

/// `?ruleSetName=` query shared by the single-rule-set endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct RuleSetQuery {
    #[serde(rename = "ruleSetName")]
    pub rule_set_name: Option<String>,
}

impl RuleSetQuery {
    #[cfg(test)]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            rule_set_name: Some(name.into()),
        }
    }

    /// The requested name, or a 400 when it is absent or blank.
    pub fn require(self) -> Result<String, ApiError> {
        match self.rule_set_name {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(ApiError::bad_request(
                "query parameter 'ruleSetName' is required",
            )),
        }
    }
}

/// Form-encode a value for use in a query string.
pub(crate) fn encode_query_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
