use crate::engine::EngineError;
use thiserror::Error;

/// Transport registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Unknown id, wrong role, or a transport owned by another connection
    #[error("transport not found")]
    NotFound,

    #[error("none of the requested producers can be consumed")]
    NoCompatibleProducers,

    #[error("transport limit reached ({limit} per connection)")]
    LimitReached { limit: usize },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, TransportError>;
