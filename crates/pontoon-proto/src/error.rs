//! Parse errors for IRC messages.

use thiserror::Error;

/// Errors raised while parsing a raw IRC line into a [`Message`].
///
/// [`Message`]: crate::Message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageParseError {
    #[error("empty message")]
    EmptyMessage,

    #[error("message has no command")]
    MissingCommand,

    #[error("invalid command {0:?}")]
    InvalidCommand(String),

    #[error("invalid prefix {0:?}")]
    InvalidPrefix(String),
}
