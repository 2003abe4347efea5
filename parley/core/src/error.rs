//! Error Types
//!
//! Error taxonomy shared by the transport, the streaming session and the
//! conversation store.
//!
//! # Surfacing Rules
//!
//! Most failures fail closed: the placeholder is removed and the user's input
//! is handed back without an alert. Only [`StreamError::RateLimited`] and
//! [`StoreError::Validation`] are meant to be shown to the user. A user
//! cancellation is not an error at all and never produces one of these.

use thiserror::Error;

/// Errors from the HTTP chat API
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The request never reached the server (DNS, refused, reset, ...)
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The server answered with a non-success status
    #[error("Server returned {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// The response body could not be decoded
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// The request timed out
    #[error("Request timed out")]
    Timeout,
}

impl TransportError {
    /// HTTP status code, if the server answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the server refused the request because of rate limiting
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() || err.is_body() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            Self::Connection(err.to_string())
        }
    }
}

/// Which timer expired
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// No byte arrived after the request was sent
    FirstByte,
    /// The stream went silent after it had started
    Inactivity,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstByte => write!(f, "first byte"),
            Self::Inactivity => write!(f, "next byte"),
        }
    }
}

/// Terminal failure of a streaming session
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// Connectivity loss. Expected on mobile networks, surfaced silently.
    #[error("Connection lost: {0}")]
    Connection(String),

    /// A session timer expired
    #[error("Stream timed out waiting for {phase}")]
    Timeout {
        /// Which timer expired
        phase: TimeoutPhase,
    },

    /// The server asked us to slow down
    #[error("Rate limited: {message}")]
    RateLimited {
        /// Human-readable wait message
        message: String,
        /// Seconds to wait, if the server said
        retry_after_secs: Option<u64>,
    },

    /// Malformed frame. Logged and skipped; never terminates a session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Non-success completion
    #[error("Server error: {message}")]
    Server {
        /// HTTP status, if the failure came from the response status
        status: Option<u16>,
        /// Error description
        message: String,
    },
}

impl StreamError {
    /// Whether this error warrants an explicit alert
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Classify a failure to open the stream
    #[must_use]
    pub fn from_transport(err: &TransportError) -> Self {
        match err {
            TransportError::Http { status: 429, body } => Self::RateLimited {
                message: if body.is_empty() {
                    "Too many requests, please wait a moment".to_string()
                } else {
                    body.clone()
                },
                retry_after_secs: None,
            },
            TransportError::Http { status, body } => Self::Server {
                status: Some(*status),
                message: body.clone(),
            },
            TransportError::Timeout => Self::Timeout {
                phase: TimeoutPhase::FirstByte,
            },
            TransportError::Connection(msg) | TransportError::Decode(msg) => {
                Self::Connection(msg.clone())
            }
        }
    }
}

/// Errors from the persisted key-value store
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PersistError {
    /// Reading or writing the backing file failed
    #[error("Storage I/O failed: {0}")]
    Io(String),

    /// The stored value could not be (de)serialized
    #[error("Storage value is malformed: {0}")]
    Serialization(String),
}

/// Errors from conversation store operations
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The conversation is soft-deleted and rejects mutation
    #[error("Conversation {0} has been deleted")]
    ConversationDeleted(String),

    /// The conversation is not known to the store
    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    /// The user's input was rejected before any request was made
    #[error("{0}")]
    Validation(String),

    /// The remote call failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The local key-value store failed
    #[error(transparent)]
    Persistence(#[from] PersistError),
}

impl StoreError {
    /// Whether this error warrants an explicit alert
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        match self {
            Self::Validation(_) => true,
            Self::Transport(err) => err.is_rate_limited(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_classification() {
        let err = TransportError::Http {
            status: 429,
            body: String::new(),
        };
        assert!(err.is_rate_limited());

        let stream_err = StreamError::from_transport(&err);
        assert!(matches!(stream_err, StreamError::RateLimited { .. }));
        assert!(stream_err.is_user_visible());
    }

    #[test]
    fn test_server_error_is_silent() {
        let err = TransportError::Http {
            status: 502,
            body: "bad gateway".to_string(),
        };
        let stream_err = StreamError::from_transport(&err);
        assert_eq!(
            stream_err,
            StreamError::Server {
                status: Some(502),
                message: "bad gateway".to_string()
            }
        );
        assert!(!stream_err.is_user_visible());
    }

    #[test]
    fn test_connection_error_is_silent() {
        let err = StreamError::from_transport(&TransportError::Connection("reset".into()));
        assert!(matches!(err, StreamError::Connection(_)));
        assert!(!err.is_user_visible());
    }

    #[test]
    fn test_store_error_visibility() {
        assert!(StoreError::Validation("empty".into()).is_user_visible());
        assert!(!StoreError::ConversationDeleted("c1".into()).is_user_visible());
        assert!(StoreError::Transport(TransportError::Http {
            status: 429,
            body: String::new()
        })
        .is_user_visible());
    }

    #[test]
    fn test_timeout_display() {
        let err = StreamError::Timeout {
            phase: TimeoutPhase::Inactivity,
        };
        assert_eq!(err.to_string(), "Stream timed out waiting for next byte");
    }
}
