//! Provider error classification
//!
//! Every per-session task translates failures into one of these kinds before
//! publishing telemetry. The kind drives the retry policy: transient errors
//! back off and retry, rate limits enter a cooldown, auth errors are fatal
//! for that provider, and tool errors let the call close politely.

use thiserror::Error;

/// Classified failure from an external provider or an internal task
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Recoverable network/IO failure — reconnect or retry with backoff
    #[error("transient: {0}")]
    Transient(String),

    /// Provider returned 429 — enter a cooldown window, do not retry inside it
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 401/403 or missing credentials — fatal for this provider, never retried
    #[error("auth: {0}")]
    Auth(String),

    /// Unparseable provider payload or user input caught at a dialog node
    #[error("parse: {0}")]
    Parse(String),

    /// Invalid configuration the provider rejected (e.g. unknown voice id)
    #[error("policy: {0}")]
    Policy(String),

    /// Calendar/SMS failure inside a workflow tool — logged, flow continues
    #[error("tool: {0}")]
    Tool(String),

    /// Unexpected internal failure — logged with the stream id, turn apologizes
    #[error("internal: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Classify an HTTP-style status code carried on a close frame or response
    pub fn from_status(status: u16, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match status {
            401 | 403 => ProviderError::Auth(detail),
            429 => ProviderError::RateLimited(detail),
            400 | 422 => ProviderError::Parse(detail),
            _ => ProviderError::Transient(detail),
        }
    }

    /// Whether the policy allows another attempt at all
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// Whether the failure puts the provider into a cooldown window
    pub fn is_cooldown(&self) -> bool {
        matches!(self, ProviderError::RateLimited(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProviderError::from_status(401, "bad key"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(403, "forbidden"),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(429, "slow down"),
            ProviderError::RateLimited(_)
        ));
        assert!(matches!(
            ProviderError::from_status(500, "boom"),
            ProviderError::Transient(_)
        ));
    }

    #[test]
    fn test_retry_policy() {
        assert!(ProviderError::Transient("x".into()).is_retryable());
        assert!(!ProviderError::Auth("x".into()).is_retryable());
        assert!(ProviderError::RateLimited("x".into()).is_cooldown());
        assert!(!ProviderError::Tool("x".into()).is_retryable());
    }
}
