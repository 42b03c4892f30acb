//! Error types shared across the control plane

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single rejected field inside a `validation` error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        FieldViolation {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum ControlError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        fields: Vec<FieldViolation>,
    },

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("multi-factor code required")]
    MfaRequired,

    #[error("account locked")]
    Locked,

    #[error("token expired")]
    TokenExpired,

    #[error("token revoked")]
    TokenRevoked,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stale write, current version is {current_version}")]
    StaleWrite { current_version: u64 },

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("no certificate authority for cluster")]
    CaAbsent,

    #[error("certificate authority expired")]
    CaExpired,

    #[error("requested validity exceeds CA window: {0}")]
    ValidityWindow(String),

    #[error("secret sink failure: {0}")]
    KeyStore(String),

    #[error("license verdict degraded: {0}")]
    Degraded(String),

    #[error("downstream unavailable: {0}")]
    Unavailable(String),

    #[error("overloaded: {0}")]
    Overload(String),

    #[error("store failure: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Convenience constructor for a single-field validation error.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        ControlError::Validation {
            message: message.clone(),
            fields: vec![FieldViolation::new(field, message)],
        }
    }

    /// Convenience constructor for a validation error with no field detail.
    pub fn validation(message: impl Into<String>) -> Self {
        ControlError::Validation {
            message: message.into(),
            fields: Vec::new(),
        }
    }

    /// The error kind as surfaced in the REST envelope.
    pub fn kind(&self) -> &'static str {
        use ControlError::*;
        match self {
            Validation { .. } => "validation",
            InvalidCredentials | MfaRequired | Locked | TokenExpired | TokenRevoked => {
                "authentication"
            }
            Forbidden(_) => "authorization",
            NotFound(_) => "not_found",
            Conflict(_) | StaleWrite { .. } => "conflict",
            Quota(_) => "quota",
            CaAbsent | CaExpired | ValidityWindow(_) | Degraded(_) => "precondition",
            KeyStore(_) | Unavailable(_) | Store(_) => "unavailable",
            Overload(_) => "overload",
            Internal(_) => "internal",
        }
    }

    /// HTTP status code the REST surface maps this error to.
    pub fn status(&self) -> u16 {
        use ControlError::*;
        match self {
            Validation { .. } => 400,
            InvalidCredentials | TokenExpired | TokenRevoked => 401,
            MfaRequired => 428,
            Locked => 423,
            Forbidden(_) => 403,
            NotFound(_) => 404,
            Conflict(_) => 409,
            StaleWrite { .. } => 412,
            Quota(_) => 402,
            CaAbsent | CaExpired | ValidityWindow(_) | Degraded(_) => 412,
            KeyStore(_) | Unavailable(_) | Store(_) => 503,
            Overload(_) => 429,
            Internal(_) => 500,
        }
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, ControlError::NotFound(_))
    }

    /// Check if this is any authentication failure
    pub fn is_authentication(&self) -> bool {
        self.kind() == "authentication"
    }

    /// Check if this is an authorization denial
    pub fn is_forbidden(&self) -> bool {
        matches!(self, ControlError::Forbidden(_))
    }

    /// Check if this is a uniqueness or version conflict
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ControlError::Conflict(_) | ControlError::StaleWrite { .. }
        )
    }

    /// Check if this is a license or resource quota denial
    pub fn is_quota(&self) -> bool {
        matches!(self, ControlError::Quota(_))
    }

    /// Only `unavailable` and `overload` are advertised as retry-safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), "unavailable" | "overload")
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ControlError::Unavailable(err.to_string())
        } else {
            ControlError::Internal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ControlError {
    fn from(err: serde_json::Error) -> Self {
        ControlError::Internal(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Unavailable(err.to_string())
    }
}

/// Wire shape of the REST error envelope: `{"error": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<FieldViolation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ErrorEnvelope {
    pub fn from_error(err: &ControlError, correlation_id: Option<String>) -> Self {
        let details = match err {
            ControlError::Validation { fields, .. } => fields.clone(),
            ControlError::StaleWrite { current_version } => vec![FieldViolation::new(
                "version",
                format!("current version is {current_version}"),
            )],
            _ => Vec::new(),
        };
        // Internal details never cross the API boundary.
        let message = match err {
            ControlError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        ErrorEnvelope {
            error: ErrorBody {
                kind: err.kind().to_string(),
                message,
                details,
                correlation_id,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_status_codes_line_up() {
        assert_eq!(ControlError::validation("x").kind(), "validation");
        assert_eq!(ControlError::validation("x").status(), 400);
        assert_eq!(ControlError::MfaRequired.status(), 428);
        assert_eq!(ControlError::Locked.status(), 423);
        assert_eq!(ControlError::Quota("p".into()).status(), 402);
        assert_eq!(ControlError::StaleWrite { current_version: 4 }.status(), 412);
        assert_eq!(ControlError::Overload("q".into()).status(), 429);
    }

    #[test]
    fn only_unavailable_and_overload_are_retryable() {
        assert!(ControlError::Unavailable("s".into()).is_retryable());
        assert!(ControlError::Overload("s".into()).is_retryable());
        assert!(!ControlError::Conflict("s".into()).is_retryable());
        assert!(!ControlError::validation("s").is_retryable());
    }

    #[test]
    fn internal_message_is_masked_in_envelope() {
        let env = ErrorEnvelope::from_error(
            &ControlError::Internal("secret stack".into()),
            Some("cid-1".into()),
        );
        assert_eq!(env.error.message, "internal error");
        assert_eq!(env.error.correlation_id.as_deref(), Some("cid-1"));
    }
}
