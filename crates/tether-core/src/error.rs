//! Error type shared by every layer of the client.

use thiserror::Error;

use crate::cancel::CancelReason;

/// Errors surfaced by the client engine.
///
/// The type is `Clone` so a single partition failure can be broadcast to
/// every request of the flush it belongs to.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// A call was described or invoked incorrectly.
    #[error("invalid call description for {method}: {reason}")]
    Configuration {
        /// Method being called.
        method: String,
        /// What was wrong.
        reason: String,
    },

    /// The exchange did not reach the server or broke off.
    #[error("transport failure: {reason}")]
    Transport {
        /// Underlying failure.
        reason: String,
    },

    /// Non-success HTTP status.
    #[error("server answered HTTP {status}: {message}")]
    HttpStatus {
        /// Status code.
        status: u16,
        /// Reason phrase or body excerpt.
        message: String,
    },

    /// No answer within the method timeout.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that expired.
        timeout_ms: u64,
    },

    /// The response did not parse or did not correlate.
    #[error("malformed response: {reason}")]
    Protocol {
        /// What could not be decoded.
        reason: String,
    },

    /// A required result came back `null`.
    #[error("{method}: empty result")]
    EmptyResult {
        /// Method that returned nothing.
        method: String,
    },

    /// Error object returned by the remote method.
    #[error("{method}: remote error {code}: {message}")]
    Application {
        /// Method that failed.
        method: String,
        /// Error code from the response.
        code: i64,
        /// Error message from the response.
        message: String,
        /// Optional `data` member.
        data: Option<serde_json::Value>,
    },

    /// The call was cancelled before it completed.
    #[error("operation cancelled: {reason}")]
    Cancelled {
        /// Why the call was cancelled.
        reason: CancelReason,
    },

    /// Credentials were rejected or could not be obtained.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Why authentication failed.
        reason: String,
    },
}

/// Result type of the client engine.
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    pub(crate) fn configuration(method: &str, reason: impl Into<String>) -> Self {
        RpcError::Configuration {
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        RpcError::Protocol {
            reason: reason.into(),
        }
    }

    /// Returns true for errors produced below the application layer, i.e.
    /// anything that fails a whole partition rather than a single item.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. }
                | RpcError::HttpStatus { .. }
                | RpcError::Timeout { .. }
                | RpcError::Cancelled { .. }
                | RpcError::Auth { .. }
        )
    }

    /// Returns true if the error came from an explicit cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RpcError::Cancelled { .. })
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_level_classification() {
        assert!(RpcError::Transport {
            reason: "reset".to_string()
        }
        .is_transport_level());
        assert!(RpcError::Timeout { timeout_ms: 10 }.is_transport_level());
        assert!(RpcError::Auth {
            reason: "second challenge".to_string()
        }
        .is_transport_level());
        assert!(!RpcError::protocol("bad json").is_transport_level());
        assert!(!RpcError::EmptyResult {
            method: "ping".to_string()
        }
        .is_transport_level());
        assert!(!RpcError::Application {
            method: "ping".to_string(),
            code: -32601,
            message: "Method not found".to_string(),
            data: None,
        }
        .is_transport_level());
    }

    #[test]
    fn test_cancelled_is_distinct_from_timeout() {
        let cancelled = RpcError::Cancelled {
            reason: CancelReason::UserRequested,
        };
        assert!(cancelled.is_cancelled());
        assert!(!RpcError::Timeout { timeout_ms: 5 }.is_cancelled());
    }

    #[test]
    fn test_display_includes_peer_message() {
        let err = RpcError::Application {
            method: "getUser".to_string(),
            code: 42,
            message: "no such user".to_string(),
            data: None,
        };
        assert_eq!(err.to_string(), "getUser: remote error 42: no such user");
    }

    #[test]
    fn test_from_serde_error_is_protocol() {
        let err: RpcError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }
}
