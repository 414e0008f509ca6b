//! Queue errors.

use thiserror::Error;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Caller supplied an unusable value. Never retried.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Queue directories could not be read or written.
    #[error("Queue unavailable ({context}): {source}")]
    Unavailable {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A record failed to parse or carries an unknown schema version.
    #[error("Corrupt entry {name}: {message}")]
    Corrupt { name: String, message: String },

    /// The entry was moved away by another process.
    #[error("Entry not found: {0}")]
    NotFound(String),
}

impl QueueError {
    pub(crate) fn unavailable(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Unavailable {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn corrupt(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Map an IO error, turning `ENOENT` into [`QueueError::NotFound`].
    pub(crate) fn from_io(context: impl Into<String>, source: std::io::Error) -> Self {
        let context = context.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(context)
        } else {
            Self::unavailable(context, source)
        }
    }
}
