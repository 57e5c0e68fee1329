use crate::protocol;
use thiserror::Error;

pub type Iec104ServerResult<T> = Result<T, Iec104ServerError>;

#[derive(Debug, Error)]
pub enum Iec104ServerError {
    /// Invalid or unusable configuration document
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Frame level encode/decode failure
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::Error),

    #[error("Not found: {entity}")]
    NotFound { entity: String },

    /// South-side forwarding failed or no forwarder is registered
    #[error("Forwarding '{operation}' failed: {reason}")]
    Forwarding { operation: String, reason: String },

    #[error("Transport error: {reason}")]
    Transport { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for Iec104ServerError {
    fn from(e: anyhow::Error) -> Self {
        Iec104ServerError::Protocol(protocol::Error::ErrAnyHow(e))
    }
}
