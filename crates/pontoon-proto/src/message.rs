//! Owned IRC message type, parsing and serialization.
//!
//! ```
//! use pontoon_proto::Message;
//!
//! let msg: Message = "@time=2023-01-01T12:00:00Z :nick!u@h PRIVMSG #chan :Hello!"
//!     .parse()
//!     .unwrap();
//! assert_eq!(msg.command, "PRIVMSG");
//! assert_eq!(msg.param(0), Some("#chan"));
//! assert_eq!(msg.tag_value("time"), Some("2023-01-01T12:00:00Z"));
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::MessageParseError;
use crate::prefix::Prefix;

/// A single IRCv3 message tag: key and optional value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// An owned IRC message.
///
/// The command is stored as an uppercased string and the parameters as
/// positional strings, so unknown commands survive a round trip unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags (e.g. `time`, `msgid`). Empty when absent.
    pub tags: Vec<Tag>,
    /// Message origin, when present.
    pub prefix: Option<Prefix>,
    /// The command or numeric, uppercased.
    pub command: String,
    /// Positional parameters, with any trailing parameter unescaped.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message from a command and its parameters.
    pub fn new<C, P, I>(command: C, params: I) -> Self
    where
        C: Into<String>,
        P: Into<String>,
        I: IntoIterator<Item = P>,
    {
        Message {
            tags: Vec::new(),
            prefix: None,
            command: command.into().to_ascii_uppercase(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Attach a prefix.
    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Attach a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.tags.push(Tag(key.into(), value.map(str::to_owned)));
        self
    }

    /// Positional parameter accessor.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Look up a tag value by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }

    /// The nickname from the prefix, if this message came from a user.
    pub fn source_nickname(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }
}

/// Escape a tag value per the IRCv3 message-tags spec.
pub fn escape_tag_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

/// Reverse of [`escape_tag_value`]. A lone trailing backslash is dropped.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match iter.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(c) => out.push(c),
            None => break,
        }
    }
    out
}

fn parse_tags(raw: &str) -> Vec<Tag> {
    raw.split(';')
        .filter(|s| !s.is_empty())
        .map(|item| match item.split_once('=') {
            Some((key, value)) => Tag(key.to_owned(), Some(unescape_tag_value(value))),
            None => Tag(item.to_owned(), None),
        })
        .collect()
}

fn valid_command(s: &str) -> bool {
    !s.is_empty()
        && (s.chars().all(|c| c.is_ascii_alphabetic())
            || (s.len() == 3 && s.chars().all(|c| c.is_ascii_digit())))
}

impl FromStr for Message {
    type Err = MessageParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut rest = s.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(MessageParseError::EmptyMessage);
        }

        let mut tags = Vec::new();
        if let Some(tail) = rest.strip_prefix('@') {
            let (raw_tags, tail) = tail
                .split_once(' ')
                .ok_or(MessageParseError::MissingCommand)?;
            tags = parse_tags(raw_tags);
            rest = tail.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(tail) = rest.strip_prefix(':') {
            let (raw_prefix, tail) = tail
                .split_once(' ')
                .ok_or(MessageParseError::MissingCommand)?;
            prefix = Some(raw_prefix.parse()?);
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if !valid_command(command) {
            return Err(MessageParseError::InvalidCommand(command.to_owned()));
        }

        let mut params = Vec::new();
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_owned());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut buf = String::new();
            for (i, Tag(key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    buf.push(';');
                }
                buf.push_str(key);
                if let Some(value) = value {
                    buf.push('=');
                    escape_tag_value(&mut buf, value);
                }
            }
            write!(f, "@{buf} ")?;
        }

        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }

        f.write_str(&self.command)?;

        if let Some((last, init)) = self.params.split_last() {
            for param in init {
                write!(f, " {param}")?;
            }
            if last.is_empty() || last.starts_with(':') || last.contains(' ') {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let msg: Message = "PING :token".parse().unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["token"]);
        assert!(msg.prefix.is_none());
    }

    #[test]
    fn parse_full() {
        let msg: Message = "@msgid=abc;time=2023-01-01T00:00:00Z :nick!u@h PRIVMSG #chan :hello world"
            .parse()
            .unwrap();
        assert_eq!(msg.tag_value("msgid"), Some("abc"));
        assert_eq!(msg.source_nickname(), Some("nick"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "hello world"]);
    }

    #[test]
    fn parse_lowercase_command() {
        let msg: Message = "privmsg #chan :hi".parse().unwrap();
        assert_eq!(msg.command, "PRIVMSG");
    }

    #[test]
    fn parse_numeric() {
        let msg: Message = ":irc.example.org 001 nick :Welcome".parse().unwrap();
        assert_eq!(msg.command, "001");
        assert_eq!(msg.param(1), Some("Welcome"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Message>().is_err());
        assert!(":prefix-only".parse::<Message>().is_err());
        assert!("12 abc".parse::<Message>().is_err());
    }

    #[test]
    fn display_adds_colon_when_needed() {
        let msg = Message::new("PRIVMSG", ["#chan", "two words"]);
        assert_eq!(msg.to_string(), "PRIVMSG #chan :two words");

        let msg = Message::new("JOIN", ["#chan"]);
        assert_eq!(msg.to_string(), "JOIN #chan");

        let msg = Message::new("AWAY", [""; 0]);
        assert_eq!(msg.to_string(), "AWAY");
    }

    #[test]
    fn tag_value_escaping_round_trip() {
        let msg = Message::new("TAGMSG", ["#chan"]).with_tag("+note", Some("a; b\\c"));
        let encoded = msg.to_string();
        assert_eq!(encoded, "@+note=a\\:\\sb\\\\c TAGMSG #chan");
        let parsed: Message = encoded.parse().unwrap();
        assert_eq!(parsed.tag_value("+note"), Some("a; b\\c"));
    }

    #[test]
    fn round_trip_preserves_unknown_commands() {
        let raw = ":serv.example.org BOUNCER NETWORK 42 state=connected";
        let msg: Message = raw.parse().unwrap();
        assert_eq!(msg.to_string(), raw);
    }
}
