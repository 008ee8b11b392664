//! Persistent record types.

use std::time::Duration;

use url::Url;

/// A bouncer account.
#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    /// Argon2 PHC hash. Empty disables password authentication.
    pub password: String,
    pub admin: bool,
    /// Default realname applied to networks without an override.
    pub realname: String,
}

/// SASL credentials for one network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaslConfig {
    /// Mechanism name (`PLAIN`, `EXTERNAL`, ...). Empty means none
    /// configured.
    pub mechanism: String,
    pub plain_username: String,
    pub plain_password: String,
    /// Opaque client certificate blob for EXTERNAL.
    pub external_cert: Option<Vec<u8>>,
}

/// One configured remote IRC network for one user.
#[derive(Debug, Clone)]
pub struct NetworkRecord {
    pub id: i64,
    /// Human name. May be empty, in which case the address stands in.
    pub name: String,
    /// Network URL: `ircs://`, `irc+insecure://`, `irc+unix://` or
    /// `unix://`.
    pub addr: String,
    pub nick: String,
    /// Username sent upstream; defaults to the nick when empty.
    pub username: String,
    /// Per-network realname override; empty inherits the user default.
    pub realname: String,
    /// Server password (`PASS`).
    pub pass: String,
    /// Whether the bouncer should keep this network connected.
    pub enabled: bool,
    pub sasl: SaslConfig,
}

impl Default for NetworkRecord {
    fn default() -> Self {
        NetworkRecord {
            id: 0,
            name: String::new(),
            addr: String::new(),
            nick: String::new(),
            username: String::new(),
            realname: String::new(),
            pass: String::new(),
            enabled: true,
            sasl: SaslConfig::default(),
        }
    }
}

impl NetworkRecord {
    /// Display name: the configured name, or the address when unnamed.
    pub fn get_name(&self) -> &str {
        if self.name.is_empty() {
            &self.addr
        } else {
            &self.name
        }
    }

    /// Parse the address. A bare `host[:port]` is read as `ircs://`.
    pub fn url(&self) -> Result<Url, url::ParseError> {
        if self.addr.contains("://") {
            Url::parse(&self.addr)
        } else {
            Url::parse(&format!("ircs://{}", self.addr))
        }
    }
}

/// How much of a detached channel is still relayed to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelayPolicy {
    /// Follow the built-in default (currently: highlights only).
    #[default]
    Default,
    /// Relay every message.
    Message,
    /// Relay highlights only.
    Highlight,
    /// Relay nothing.
    None,
}

impl RelayPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayPolicy::Default => "default",
            RelayPolicy::Message => "message",
            RelayPolicy::Highlight => "highlight",
            RelayPolicy::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "default" => Some(RelayPolicy::Default),
            "message" => Some(RelayPolicy::Message),
            "highlight" => Some(RelayPolicy::Highlight),
            "none" => Some(RelayPolicy::None),
            _ => None,
        }
    }
}

/// A channel the bouncer stays joined to on one network.
#[derive(Debug, Clone, Default)]
pub struct ChannelRecord {
    pub id: i64,
    pub name: String,
    pub key: String,
    /// Hidden from attached clients while the bouncer stays joined
    /// upstream.
    pub detached: bool,
    /// Last internal message ID seen when the channel was detached; drives
    /// replay on re-attach.
    pub detached_internal_msg_id: Option<String>,
    pub relay_detached: RelayPolicy,
    /// Inactivity period after which the channel detaches itself.
    /// Zero disables the timer.
    pub detach_after: Duration,
}

/// "Client X last saw up to message M on target T."
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub target: String,
    pub client: String,
    pub internal_msg_id: String,
}

/// A Web Push endpoint registered for one network.
#[derive(Debug, Clone)]
pub struct WebPushSubscription {
    pub id: i64,
    pub endpoint: String,
    pub key_auth: String,
    pub key_p256dh: String,
    pub key_vapid: String,
}
