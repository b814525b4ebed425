//! Signer errors.
//!
//! These travel inside per-item failures, so they are `Clone` and
//! serializable rather than wrapping opaque sources.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for signer operations.
pub type SignerResult<T> = Result<T, SignerError>;

/// Failures reported by a `Signer` or by the machinery around it.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SignerError {
    /// The backend could not serve the request right now. Worth retrying.
    #[error("signer unavailable: {0}")]
    Unavailable(String),
    /// The rate-limited operation was entered by more than one caller.
    #[error("signer overheated: {concurrent} concurrent md5 calls")]
    Overheat { concurrent: usize },
    /// The signer or the gate in front of it has been shut down.
    #[error("signer closed")]
    Closed,
    /// A hashing sub-task died before producing a digest.
    #[error("hash task failed: {0}")]
    TaskFailed(String),
    /// Transient failures outlasted the retry policy.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<SignerError>,
    },
}

impl SignerError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(self, SignerError::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(SignerError::Unavailable("busy".into()).is_transient());
        assert!(!SignerError::Overheat { concurrent: 2 }.is_transient());
        assert!(!SignerError::Closed.is_transient());
        assert!(!SignerError::TaskFailed("boom".into()).is_transient());
    }

    #[test]
    fn test_exhausted_display_includes_last_error() {
        let err = SignerError::Exhausted {
            attempts: 3,
            last: Box::new(SignerError::Unavailable("busy".into())),
        };
        assert_eq!(
            err.to_string(),
            "gave up after 3 attempts: signer unavailable: busy"
        );
    }

    #[test]
    fn test_serde_tagged() {
        let err = SignerError::Overheat { concurrent: 2 };
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"kind":"overheat","detail":{"concurrent":2}}"#);
        let back: SignerError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
