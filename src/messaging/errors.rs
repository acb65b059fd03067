//! # Messaging Error Types
//!
//! Structured error handling for the transport and envelope codec using
//! thiserror instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Transport-level errors.
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Queue closed: {queue_name}")]
    QueueClosed { queue_name: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::MessageSerialization {
            message: err.to_string(),
        }
    }
}

/// Envelope codec errors. Decoding has no side effects; both variants are
/// surfaced to the caller untouched.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The type tag has no registered decoder.
    #[error("Unknown command type tag: {tag}")]
    UnknownCommandType { tag: String },

    /// The payload does not deserialize as the registered command type.
    #[error("Malformed payload for command type {tag}: {message}")]
    MalformedPayload { tag: String, message: String },

    /// A second decoder was registered for an already claimed tag.
    #[error("Command type tag already registered: {tag}")]
    DuplicateTag { tag: String },

    /// The command could not be serialized into an envelope payload.
    #[error("Failed to encode command {tag}: {message}")]
    EncodeFailed { tag: String, message: String },
}
