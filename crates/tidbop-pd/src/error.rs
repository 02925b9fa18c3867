//! Error types for placement-service calls.

use thiserror::Error;

pub type PdResult<T> = Result<T, PdError>;

#[derive(Debug, Error)]
pub enum PdError {
    /// The service answered 404; the object is unknown to it.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("connection to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error("request to {uri} timed out")]
    Timeout { uri: String },

    #[error("{uri} returned {status}: {body}")]
    Status {
        uri: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {uri}: {message}")]
    Decode { uri: String, message: String },

    #[error("no placement endpoint recorded for cluster {0}")]
    NoEndpoint(String),
}

impl PdError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PdError::NotFound(_))
    }
}
