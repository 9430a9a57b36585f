use std::time::Duration;
use thiserror::Error;

/// Errors produced by the scheduler, the provider stream driver, and the
/// LMTP client/session.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Low-level HTTP transport failure (connection refused, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O failure on a pipe or socket transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// The provider's token stream reported an error or ended prematurely.
    #[error("provider stream error: {0}")]
    Stream(String),

    /// The provider signalled a rate limit ("rate limit" in the message).
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// A hard provider limitation that no retry can fix (e.g. the logit-bias
    /// entry cap, or echo-scoring on a model that rejects echo).
    #[error("provider limitation: {0}")]
    ApiLimitation(String),

    /// Invalid endpoint, credential, or scheduler configuration.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A chunk stall, connect timeout, or reply timeout expired.
    #[error("timed out: {0}")]
    Timeout(String),

    /// All recovery attempts for a stream were consumed.
    #[error("maximum retries exceeded ({retries}): {cause}")]
    MaximumRetriesExceeded {
        /// Number of attempts made before giving up.
        retries: u32,
        /// The error observed on the final attempt.
        cause: Box<StreamError>,
    },

    /// The scheduler was disposed while requests were outstanding.
    #[error("scheduler is shut down")]
    Shutdown,

    /// An LMTP stream reported an error frame or the transport failed.
    #[error("lmtp stream error: {0}")]
    Lmtp(String),

    /// The operation was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        StreamError::Stream(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Provider error messages that identify a misconfiguration rather than a
/// transient failure. Retrying these wastes the whole budget.
const DEFINITIVE_MARKERS: &[&str] = &[
    "Incorrect API key provided",
    "No such organization",
    "can provide at most",
];

impl StreamError {
    /// Classify an in-stream provider error message.
    ///
    /// Messages containing "rate limit" (case-insensitive) become
    /// [`StreamError::RateLimit`]; known misconfiguration markers become
    /// definitive errors; everything else is a plain stream error.
    pub fn from_provider_message(message: impl Into<String>) -> StreamError {
        let message = message.into();
        if message.to_lowercase().contains("rate limit") {
            return StreamError::RateLimit(message);
        }
        if message.contains("can provide at most") {
            return StreamError::ApiLimitation(message);
        }
        if DEFINITIVE_MARKERS.iter().any(|m| message.contains(m)) {
            return StreamError::Configuration(message);
        }
        StreamError::Stream(message)
    }

    /// Whether retrying this error can possibly succeed.
    pub fn is_definitive(&self) -> bool {
        match self {
            StreamError::Configuration(_)
            | StreamError::ApiLimitation(_)
            | StreamError::MaximumRetriesExceeded { .. }
            | StreamError::Shutdown
            | StreamError::Cancelled => true,
            StreamError::Stream(msg) | StreamError::Lmtp(msg) => {
                DEFINITIVE_MARKERS.iter().any(|m| msg.contains(m))
            }
            StreamError::Http { body, .. } => DEFINITIVE_MARKERS.iter().any(|m| body.contains(m)),
            _ => false,
        }
    }

    /// Whether the error warrants the longer rate-limit/stall backoff.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, StreamError::RateLimit(_) | StreamError::Timeout(_))
    }

    /// A cloneable rendition of this error, for fanning one failure out to
    /// every slice of a batch. Non-cloneable sources are flattened to their
    /// display form; classification-relevant variants are preserved.
    pub(crate) fn clone_shallow(&self) -> StreamError {
        match self {
            StreamError::Request(e) => StreamError::Stream(format!("HTTP request failed: {e}")),
            StreamError::Json(e) => StreamError::Stream(format!("JSON parsing failed: {e}")),
            StreamError::Io(e) => StreamError::Stream(format!("I/O error: {e}")),
            StreamError::Http {
                status,
                body,
                retry_after,
            } => StreamError::Http {
                status: *status,
                body: body.clone(),
                retry_after: *retry_after,
            },
            StreamError::Stream(s) => StreamError::Stream(s.clone()),
            StreamError::RateLimit(s) => StreamError::RateLimit(s.clone()),
            StreamError::ApiLimitation(s) => StreamError::ApiLimitation(s.clone()),
            StreamError::Configuration(s) => StreamError::Configuration(s.clone()),
            StreamError::Timeout(s) => StreamError::Timeout(s.clone()),
            StreamError::MaximumRetriesExceeded { retries, cause } => {
                StreamError::MaximumRetriesExceeded {
                    retries: *retries,
                    cause: Box::new(cause.clone_shallow()),
                }
            }
            StreamError::Shutdown => StreamError::Shutdown,
            StreamError::Lmtp(s) => StreamError::Lmtp(s.clone()),
            StreamError::Cancelled => StreamError::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_classified_case_insensitive() {
        let err = StreamError::from_provider_message("You hit a Rate Limit, slow down");
        assert!(matches!(err, StreamError::RateLimit(_)));
        assert!(!err.is_definitive());
        assert!(err.is_backpressure());
    }

    #[test]
    fn test_logit_bias_cap_is_definitive() {
        let err = StreamError::from_provider_message(
            "you supplied 500 logit biases, but can provide at most 300",
        );
        assert!(matches!(err, StreamError::ApiLimitation(_)));
        assert!(err.is_definitive());
    }

    #[test]
    fn test_bad_key_is_definitive() {
        let err = StreamError::from_provider_message("Incorrect API key provided: sk-...");
        assert!(matches!(err, StreamError::Configuration(_)));
        assert!(err.is_definitive());
    }

    #[test]
    fn test_plain_message_is_retriable_stream_error() {
        let err = StreamError::from_provider_message("upstream hiccup");
        assert!(matches!(err, StreamError::Stream(_)));
        assert!(!err.is_definitive());
    }

    #[test]
    fn test_clone_shallow_preserves_classification() {
        let err = StreamError::RateLimit("rate limit".into());
        assert!(matches!(err.clone_shallow(), StreamError::RateLimit(_)));

        let err = StreamError::MaximumRetriesExceeded {
            retries: 21,
            cause: Box::new(StreamError::Timeout("stall".into())),
        };
        match err.clone_shallow() {
            StreamError::MaximumRetriesExceeded { retries, cause } => {
                assert_eq!(retries, 21);
                assert!(matches!(*cause, StreamError::Timeout(_)));
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }
}
