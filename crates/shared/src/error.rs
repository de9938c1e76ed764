use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Envelope the REST backend wraps failure responses in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiFailure {
    pub success: bool,
    pub message: String,
}

/// A non-2xx REST response, with the backend's message when one was present.
#[derive(Debug, Clone, Error)]
#[error("request rejected with status {status}: {message}")]
pub struct ApiRejection {
    pub status: u16,
    pub message: String,
}

impl ApiRejection {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}
