use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// No initial certificate could be issued; the process must not serve.
    #[error("Initialization failed: {0}")]
    Initialization(#[source] Box<RotationError>),

    #[error("Certificate issuance failed: {0}")]
    Issuance(String),

    /// The authority answered, but the bundle cannot become the current identity.
    #[error("Issued certificate rejected at install: {0}")]
    InstallInvariantViolation(String),

    #[error("Revocation of serial {serial} failed: {reason}")]
    Revocation { serial: Serial, reason: String },

    #[error("Tidy failed: {0}")]
    Tidy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl RotationError {
    /// Whether a refresh cycle that hit this error left the current certificate in place.
    pub fn is_refresh_failure(&self) -> bool {
        matches!(
            self,
            RotationError::Issuance(_) | RotationError::InstallInvariantViolation(_)
        )
    }
}

/// Authority-assigned identifier of an issued certificate, used only for revocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Serial(pub String);

impl Serial {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Serial {
    fn from(s: String) -> Self {
        Serial(s)
    }
}

impl From<&str> for Serial {
    fn from(s: &str) -> Self {
        Serial(s.to_string())
    }
}

/// Outcome notifications published by the rotation engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RotationEvent {
    Refreshed {
        serial: Serial,
        previous: Option<Serial>,
        not_after: DateTime<Utc>,
    },
    RefreshFailed {
        reason: String,
    },
    Revoked {
        serial: Serial,
        revoked_at: DateTime<Utc>,
    },
    RevocationFailed {
        serial: Serial,
        reason: String,
    },
    TidyFailed {
        reason: String,
    },
}

impl fmt::Display for RotationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationEvent::Refreshed { .. } => write!(f, "REFRESHED"),
            RotationEvent::RefreshFailed { .. } => write!(f, "REFRESH_FAILED"),
            RotationEvent::Revoked { .. } => write!(f, "REVOKED"),
            RotationEvent::RevocationFailed { .. } => write!(f, "REVOCATION_FAILED"),
            RotationEvent::TidyFailed { .. } => write!(f, "TIDY_FAILED"),
        }
    }
}

pub type Result<T> = std::result::Result<T, RotationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialization_keeps_cause_as_source() {
        let err = RotationError::Initialization(Box::new(RotationError::Issuance(
            "vault sealed".to_string(),
        )));

        assert_eq!(
            err.to_string(),
            "Initialization failed: Certificate issuance failed: vault sealed"
        );
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "Certificate issuance failed: vault sealed");
        assert!(!err.is_refresh_failure());
    }

    #[test]
    fn test_refresh_failure_classification() {
        assert!(RotationError::Issuance("timeout".into()).is_refresh_failure());
        assert!(RotationError::InstallInvariantViolation("bad chain".into()).is_refresh_failure());
        assert!(!RotationError::Revocation {
            serial: Serial::from("S1"),
            reason: "denied".into(),
        }
        .is_refresh_failure());
        assert!(!RotationError::Tidy("busy".into()).is_refresh_failure());
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = RotationEvent::RevocationFailed {
            serial: Serial::from("S1"),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"revocation_failed\""));
        assert!(json.contains("\"serial\":\"S1\""));
        assert_eq!(event.to_string(), "REVOCATION_FAILED");
    }

    #[test]
    fn test_revocation_error_message_names_serial() {
        let err = RotationError::Revocation {
            serial: Serial::from("17:67:16"),
            reason: "unknown serial".into(),
        };
        assert_eq!(
            err.to_string(),
            "Revocation of serial 17:67:16 failed: unknown serial"
        );
    }
}
