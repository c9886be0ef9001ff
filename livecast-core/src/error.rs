use livecast_sfu::{EngineError, TransportError};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// Unknown id or an object owned by someone else; the two are never told apart
    #[error("Not found or unauthorized")]
    NotFoundOrUnauthorized,

    #[error("Connection already owns a stream")]
    AlreadyStreaming,

    #[error("Stream is not active")]
    StreamNotActive,

    #[error("None of the stream's producers can be consumed")]
    NoCompatibleProducers,

    #[error("Already in chat")]
    AlreadyInChat,

    #[error("Not in chat")]
    NotInChat,

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Too many messages, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Timed out from chat for another {remaining_seconds}s")]
    TimedOut { remaining_seconds: u64 },

    #[error("Media engine error: {0}")]
    MediaEngine(#[from] EngineError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Authorization,
    State,
    RateLimit,
    Infrastructure,
}

impl Error {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFoundOrUnauthorized => ErrorKind::Authorization,
            Self::AlreadyStreaming
            | Self::StreamNotActive
            | Self::NoCompatibleProducers
            | Self::AlreadyInChat
            | Self::NotInChat
            | Self::CapacityExceeded(_) => ErrorKind::State,
            Self::RateLimited { .. } | Self::TimedOut { .. } => ErrorKind::RateLimit,
            Self::MediaEngine(_) | Self::Internal(_) => ErrorKind::Infrastructure,
        }
    }

    /// Stable machine-readable code sent to clients
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::NotFoundOrUnauthorized => "NOT_FOUND_OR_UNAUTHORIZED",
            Self::AlreadyStreaming => "ALREADY_STREAMING",
            Self::StreamNotActive => "STREAM_NOT_ACTIVE",
            Self::NoCompatibleProducers => "NO_COMPATIBLE_PRODUCERS",
            Self::AlreadyInChat => "ALREADY_IN_CHAT",
            Self::NotInChat => "NOT_IN_CHAT",
            Self::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::TimedOut { .. } => "TIMED_OUT",
            Self::MediaEngine(_) | Self::Internal(_) => "OPERATION_FAILED",
        }
    }

    /// Seconds the client should wait before trying again
    #[must_use]
    pub const fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_seconds,
            } => Some(*retry_after_seconds),
            Self::TimedOut { remaining_seconds } => Some(*remaining_seconds),
            _ => None,
        }
    }

    /// Client-facing body. Infrastructure failures are logged in full and
    /// replaced by a generic message.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        let message = match self.kind() {
            ErrorKind::Infrastructure => {
                tracing::error!("Operation failed: {self}");
                "Operation failed, restart from the last successful step".to_string()
            }
            _ => self.to_string(),
        };
        ErrorPayload {
            code: self.code(),
            message,
            retry_after: self.retry_after(),
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotFound => Self::NotFoundOrUnauthorized,
            TransportError::NoCompatibleProducers => Self::NoCompatibleProducers,
            TransportError::LimitReached { limit } => {
                Self::CapacityExceeded(format!("at most {limit} transports per connection"))
            }
            TransportError::Engine(e) => Self::MediaEngine(e),
        }
    }
}

/// Error body of a negative acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            Error::from(TransportError::NotFound),
            Error::NotFoundOrUnauthorized
        );
        assert_eq!(
            Error::from(TransportError::NoCompatibleProducers),
            Error::NoCompatibleProducers
        );
        assert!(matches!(
            Error::from(TransportError::LimitReached { limit: 4 }),
            Error::CapacityExceeded(_)
        ));
    }

    #[test]
    fn test_infrastructure_errors_are_masked() {
        let err = Error::from(EngineError::Failure("worker 3 crashed at 0xdeadbeef".into()));
        let payload = err.to_payload();
        assert_eq!(payload.code, "OPERATION_FAILED");
        assert!(!payload.message.contains("worker"));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }

    #[test]
    fn test_payload_wire_format() {
        let payload = Error::RateLimited {
            retry_after_seconds: 7,
        }
        .to_payload();
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["retryAfter"], 7);

        let json = serde_json::to_value(Error::validation("title", "too long").to_payload()).unwrap();
        assert_eq!(json["message"], "Invalid title: too long");
        assert!(json.get("retryAfter").is_none());
    }
}
