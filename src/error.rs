//! Unified error handling for pontoon.
//!
//! Error kinds follow the failure surfaces of the bouncer core:
//! network-record validation, upstream registration (with a
//! temporary/permanent split that decides whether the reconnect loop keeps
//! retrying), and downstream command handling (where a structured IRC reply
//! keeps the connection alive and anything else tears it down).

use pontoon_proto::{Message, Prefix};
use thiserror::Error;

use crate::db::DbError;
use crate::store::StoreError;

// ============================================================================
// Network record validation
// ============================================================================

/// Rejections produced while validating a network record before it is
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkCheckError {
    #[error("invalid network address: {0}")]
    InvalidUrl(String),

    #[error("{0}:// address must not have username and password information")]
    UrlUserinfo(String),

    #[error("{0}:// address must not have query values")]
    UrlQuery(String),

    #[error("{0}:// address must not have a fragment")]
    UrlFragment(String),

    #[error("{0}:// address must have a host")]
    UrlMissingHost(String),

    #[error("{0}:// address must not have a path")]
    UrlUnexpectedPath(String),

    #[error("{0}:// address must not have a host")]
    UrlUnexpectedHost(String),

    #[error("{0}:// address must have a path")]
    UrlMissingPath(String),

    #[error("unknown address scheme {0:?}")]
    UnknownScheme(String),

    #[error("network name cannot be empty")]
    EmptyName,

    #[error("network name cannot start with a dash character")]
    DashName,

    #[error("a network with the name {0:?} already exists")]
    DuplicateName(String),

    #[error("maximum number of networks reached")]
    TooManyNetworks,
}

// ============================================================================
// Upstream registration
// ============================================================================

/// A failed IRC registration against an upstream server.
///
/// Temporary failures are retried with backoff; permanent ones stop the
/// network's reconnect loop for good.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct RegistrationError {
    pub reason: String,
    pub temporary: bool,
}

impl RegistrationError {
    pub fn temporary(reason: impl Into<String>) -> Self {
        RegistrationError {
            reason: reason.into(),
            temporary: true,
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        RegistrationError {
            reason: reason.into(),
            temporary: false,
        }
    }
}

// ============================================================================
// Downstream command handling
// ============================================================================

/// Errors surfaced by downstream message handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A structured IRC error reply. The dispatcher rewrites its prefix to
    /// the server's and sends it; the connection stays open.
    #[error("irc error: {0}")]
    Irc(Message),

    /// Anything else. Logged, and the downstream connection is closed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// `ERR_UNKNOWNCOMMAND` for a command we do not implement.
    pub fn unknown_command(nick: &str, command: &str) -> Self {
        HandlerError::Irc(Message::new("421", [nick, command, "Unknown command"]))
    }

    /// `ERR_NEEDMOREPARAMS`.
    pub fn need_more_params(nick: &str, command: &str) -> Self {
        HandlerError::Irc(Message::new(
            "461",
            [nick, command, "Not enough parameters"],
        ))
    }

    /// `ERR_NOSUCHCHANNEL`.
    pub fn no_such_channel(nick: &str, channel: &str) -> Self {
        HandlerError::Irc(Message::new("403", [nick, channel, "No such channel"]))
    }

    /// Rewrite the reply's prefix to the server's, if this is a structured
    /// error.
    pub fn with_server_prefix(self, hostname: &str) -> Self {
        match self {
            HandlerError::Irc(mut msg) => {
                msg.prefix = Some(Prefix::ServerName(hostname.to_owned()));
                HandlerError::Irc(msg)
            }
            other => other,
        }
    }
}

impl From<DbError> for HandlerError {
    fn from(err: DbError) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Internal(err.to_string())
    }
}

// ============================================================================
// Administrative write paths
// ============================================================================

/// Failure of an administrative mutation (network create/update/delete,
/// user update), reported back to the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    InvalidNetwork(#[from] NetworkCheckError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no such network {0:?}")]
    NoSuchNetwork(String),

    #[error("{0}")]
    Internal(String),
}
