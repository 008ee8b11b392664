//! # pontoon-proto
//!
//! IRC wire message types for the pontoon bouncer.
//!
//! This crate deliberately stays close to the wire: a [`Message`] is a
//! command string plus positional parameters, with optional IRCv3 tags and
//! a prefix. A bouncer has to relay commands it does not understand, so the
//! representation is lossless rather than typed per-command.
//!
//! It also provides the IRC casemapping functions and [`CaseMap`], a keyed
//! map that folds its keys under a switchable casemapping while remembering
//! the original spelling of each key.

pub mod casemap;
pub mod error;
pub mod message;
pub mod prefix;

pub use self::casemap::{CaseMap, Casemapping};
pub use self::error::MessageParseError;
pub use self::message::{escape_tag_value, unescape_tag_value, Message, Tag};
pub use self::prefix::Prefix;

/// Maximum length of a single IRC line on the wire, excluding CRLF, when
/// message tags are present (IRCv3 allows 8191 bytes of tag data).
pub const MAX_LINE_LEN: usize = 8191;
