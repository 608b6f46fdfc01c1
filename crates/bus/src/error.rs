//! Typed error type for the bus crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish to '{topic}' failed: {message}")]
    PublishFailed { topic: String, message: String },

    #[error("subscribe to '{pattern}' failed: {message}")]
    SubscribeFailed { pattern: String, message: String },

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
