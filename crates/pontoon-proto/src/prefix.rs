//! IRC message prefix types.
//!
//! A prefix identifies the origin of a message: either a server name or a
//! user's `nick!user@host` mask.

use std::fmt;
use std::str::FromStr;

use crate::error::MessageParseError;

/// The origin of an IRC message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Prefix {
    /// A server name (e.g. `irc.example.org`).
    ServerName(String),
    /// A user prefix: (nickname, username, hostname). The username and
    /// hostname parts may be empty.
    Nickname(String, String, String),
}

impl Prefix {
    /// Shorthand for a full `nick!user@host` prefix.
    pub fn new(
        nick: impl Into<String>,
        user: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Prefix::Nickname(nick.into(), user.into(), host.into())
    }

    /// Parse a prefix leniently. A name containing a dot with no `!`/`@`
    /// separators is taken to be a server name.
    pub fn parse(s: &str) -> Self {
        let (name, rest) = match s.split_once('!') {
            Some((name, rest)) => (name, Some(rest)),
            None => match s.split_once('@') {
                // nick@host without a username part
                Some((name, host)) => {
                    return Prefix::Nickname(name.to_owned(), String::new(), host.to_owned());
                }
                None => (s, None),
            },
        };

        match rest {
            Some(rest) => {
                let (user, host) = rest.split_once('@').unwrap_or((rest, ""));
                Prefix::Nickname(name.to_owned(), user.to_owned(), host.to_owned())
            }
            None if name.contains('.') => Prefix::ServerName(name.to_owned()),
            None => Prefix::Nickname(name.to_owned(), String::new(), String::new()),
        }
    }

    /// The leading name: the server name, or the nickname of a user prefix.
    pub fn name(&self) -> &str {
        match self {
            Prefix::ServerName(name) => name,
            Prefix::Nickname(nick, _, _) => nick,
        }
    }

    /// The nickname, if this is a user prefix.
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(nick, _, _) if !nick.is_empty() => Some(nick),
            _ => None,
        }
    }
}

impl FromStr for Prefix {
    type Err = MessageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(' ') {
            return Err(MessageParseError::InvalidPrefix(s.to_owned()));
        }
        Ok(Prefix::parse(s))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(name) => f.write_str(name),
            Prefix::Nickname(nick, user, host) => {
                f.write_str(nick)?;
                if !user.is_empty() {
                    write!(f, "!{user}")?;
                }
                if !host.is_empty() {
                    write!(f, "@{host}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_name() {
        assert_eq!(
            Prefix::parse("irc.example.org"),
            Prefix::ServerName("irc.example.org".to_owned())
        );
    }

    #[test]
    fn parse_full_user_mask() {
        assert_eq!(
            Prefix::parse("nick!user@host.example.org"),
            Prefix::new("nick", "user", "host.example.org")
        );
    }

    #[test]
    fn parse_bare_nick() {
        assert_eq!(
            Prefix::parse("nick"),
            Prefix::Nickname("nick".to_owned(), String::new(), String::new())
        );
    }

    #[test]
    fn parse_nick_with_host_only() {
        assert_eq!(
            Prefix::parse("nick@host"),
            Prefix::Nickname("nick".to_owned(), String::new(), "host".to_owned())
        );
    }

    #[test]
    fn display_round_trip() {
        for raw in ["irc.example.org", "nick!user@host", "nick"] {
            assert_eq!(Prefix::parse(raw).to_string(), raw);
        }
    }
}
