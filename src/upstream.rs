//! Upstream connection handling.
//!
//! Each live upstream goes through three phases:
//!
//! ```text
//! Phase 1: Dial + Registration (owned Framed, sequential)
//!    ↓
//! Phase 2: Split & hand off state to the user dispatcher
//!    ↓
//! Phase 3: Streaming (reader pump posts events, writer task drains a queue)
//! ```
//!
//! After the hand-off, all session state ([`Upstream`]) is owned and
//! mutated exclusively by the user dispatcher; the reader task only turns
//! wire lines into events.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use pontoon_proto::{CaseMap, Casemapping, Message, MAX_LINE_LEN};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, warn};

use crate::db::NetworkRecord;
use crate::error::RegistrationError;
use crate::server::{CONNECT_TIMEOUT, WRITE_TIMEOUT};
use crate::user::{Event, EventSender, User};

/// Monotonic generation counter for upstream connections; events carry the
/// generation so the dispatcher can recognize stale ones.
static NEXT_CONN_SEQ: AtomicU64 = AtomicU64::new(1);

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub(crate) type IrcFramed = Framed<Box<dyn AsyncStream>, LinesCodec>;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid address: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported address scheme {0:?}")]
    Scheme(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TLS server name {0:?}")]
    ServerName(String),
    #[error("no usable address for {0:?}")]
    NoAddress(String),
    #[error("connect timed out")]
    Timeout,
}

/// A dialed (but not yet registered) upstream stream.
pub(crate) struct Dialed {
    pub stream: Box<dyn AsyncStream>,
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
}

/// Dial the network's address, optionally binding the given local source
/// address for TCP schemes.
pub(crate) async fn connect_to_upstream(
    record: &NetworkRecord,
    local_addr: Option<IpAddr>,
) -> Result<Dialed, ConnectError> {
    let url = record.url()?;
    match url.scheme() {
        "ircs" | "irc+insecure" => {
            let host = url
                .host_str()
                .ok_or_else(|| ConnectError::NoAddress(record.addr.clone()))?
                .to_owned();
            let default_port = if url.scheme() == "ircs" { 6697 } else { 6667 };
            let port = url.port().unwrap_or(default_port);

            let stream = tcp_connect(&host, port, local_addr).await?;
            let local = stream.local_addr().ok().map(|a| a.to_string());
            let remote = stream.peer_addr().ok().map(|a| a.to_string());

            let stream: Box<dyn AsyncStream> = if url.scheme() == "ircs" {
                let connector = tls_connector();
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|_| ConnectError::ServerName(host.clone()))?;
                let tls = timeout(CONNECT_TIMEOUT, connector.connect(server_name, stream))
                    .await
                    .map_err(|_| ConnectError::Timeout)??;
                Box::new(tls)
            } else {
                Box::new(stream)
            };

            Ok(Dialed {
                stream,
                local_addr: local,
                remote_addr: remote,
            })
        }
        "irc+unix" | "unix" => {
            let path = url.path().to_owned();
            let stream = timeout(CONNECT_TIMEOUT, UnixStream::connect(&path))
                .await
                .map_err(|_| ConnectError::Timeout)??;
            Ok(Dialed {
                stream: Box::new(stream),
                local_addr: None,
                remote_addr: Some(path),
            })
        }
        scheme => Err(ConnectError::Scheme(scheme.to_owned())),
    }
}

async fn tcp_connect(
    host: &str,
    port: u16,
    local_addr: Option<IpAddr>,
) -> Result<tokio::net::TcpStream, ConnectError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();

    let mut last_err = None;
    for addr in addrs {
        if let Some(local) = local_addr {
            if local.is_ipv4() != addr.is_ipv4() {
                continue;
            }
        }
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(local) = local_addr {
            socket.bind(SocketAddr::new(local, 0))?;
        }
        match timeout(CONNECT_TIMEOUT, socket.connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(err)) => last_err = Some(err.into()),
            Err(_) => last_err = Some(ConnectError::Timeout),
        }
    }

    Err(last_err.unwrap_or_else(|| ConnectError::NoAddress(host.to_owned())))
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(std::sync::Arc::new(config))
}

// ============================================================================
// Session state
// ============================================================================

/// One joined channel as seen from upstream.
pub struct UpstreamChannel {
    pub name: String,
    pub topic: Option<String>,
    /// nick -> membership prefix characters.
    pub members: CaseMap<String>,
    /// Whether the initial NAMES burst has completed.
    pub complete: bool,
    detach_timer: Option<tokio::task::JoinHandle<()>>,
}

impl UpstreamChannel {
    pub fn new(name: impl Into<String>, casemapping: Casemapping) -> Self {
        UpstreamChannel {
            name: name.into(),
            topic: None,
            members: CaseMap::new(casemapping),
            complete: false,
            detach_timer: None,
        }
    }

    /// (Re)arm or cancel the inactivity auto-detach timer.
    pub fn update_auto_detach(
        &mut self,
        period: Duration,
        events: &EventSender,
        net_id: i64,
        seq: u64,
    ) {
        if let Some(timer) = self.detach_timer.take() {
            timer.abort();
        }
        if period.is_zero() {
            return;
        }
        let events = events.clone();
        let name = self.name.clone();
        self.detach_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = events
                .send(Event::ChannelDetach { net_id, seq, name })
                .await;
        }));
    }
}

impl Drop for UpstreamChannel {
    fn drop(&mut self) {
        if let Some(timer) = self.detach_timer.take() {
            timer.abort();
        }
    }
}

/// A command forwarded upstream on behalf of a downstream, whose replies
/// must be routed back to it.
struct PendingCommand {
    downstream_id: u64,
    msg: Message,
}

/// A registered upstream connection. Owned by the user dispatcher.
pub struct Upstream {
    pub net_id: i64,
    pub seq: u64,
    pub nick: String,
    pub username: String,
    pub account: Option<String>,
    /// Capabilities acknowledged by the server.
    pub caps: HashSet<String>,
    pub channels: CaseMap<UpstreamChannel>,
    pub monitored: CaseMap<()>,
    pub monitor_supported: bool,
    /// Whether we currently present as away upstream.
    pub away: bool,
    pub local_addr: Option<String>,
    pub remote_addr: Option<String>,
    pending_lists: Vec<PendingCommand>,
    out: mpsc::UnboundedSender<Message>,
    stop: watch::Sender<bool>,
}

impl Upstream {
    pub fn send(&self, msg: Message) {
        // The writer task may already be gone; the reader will surface the
        // disconnect.
        let _ = self.out.send(msg);
    }

    /// Ask the reader and writer tasks to terminate. Idempotent.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sync the upstream auto-away state with the number of attached
    /// clients.
    pub fn update_away(&mut self, want_away: bool) {
        if want_away == self.away {
            return;
        }
        self.away = want_away;
        if want_away {
            self.send(Message::new("AWAY", ["Auto away"]));
        } else {
            self.send(Message::new("AWAY", [""; 0]));
        }
    }

    /// Sync the upstream MONITOR list with the union of the given desired
    /// targets.
    pub fn update_monitor<'a>(&mut self, desired: impl Iterator<Item = &'a str>) {
        if !self.monitor_supported {
            return;
        }

        let mut want: CaseMap<()> = CaseMap::new(self.monitored.casemapping());
        for nick in desired {
            want.insert(nick, ());
        }

        let added: Vec<String> = want
            .keys()
            .filter(|n| !self.monitored.contains_key(n))
            .map(str::to_owned)
            .collect();
        let removed: Vec<String> = self
            .monitored
            .keys()
            .filter(|n| !want.contains_key(n))
            .map(str::to_owned)
            .collect();

        if !added.is_empty() {
            let added = added.join(",");
            self.send(Message::new("MONITOR", ["+", added.as_str()]));
        }
        if !removed.is_empty() {
            let removed = removed.join(",");
            self.send(Message::new("MONITOR", ["-", removed.as_str()]));
        }
        self.monitored = want;
    }

    /// Queue a LIST forwarded for a downstream; only one is in flight at a
    /// time.
    pub fn enqueue_list(&mut self, downstream_id: u64, msg: Message) {
        let idle = self.pending_lists.is_empty();
        if idle {
            self.send(msg.clone());
        }
        self.pending_lists.push(PendingCommand {
            downstream_id,
            msg,
        });
    }

    /// The downstream whose LIST is currently in flight.
    pub fn current_list_downstream(&self) -> Option<u64> {
        self.pending_lists.first().map(|p| p.downstream_id)
    }

    /// Complete the in-flight LIST and kick off the next queued one.
    pub fn finish_list(&mut self) {
        if !self.pending_lists.is_empty() {
            self.pending_lists.remove(0);
        }
        if let Some(next) = self.pending_lists.first() {
            self.send(next.msg.clone());
        }
    }

    /// Drop queued commands for a disconnecting downstream.
    pub fn cancel_pending_commands_by_downstream_id(&mut self, downstream_id: u64) {
        self.pending_lists
            .retain(|p| p.downstream_id != downstream_id);
    }

    /// Abort all pending commands, sending each requester its end-of-reply
    /// numeric. Used when the connection goes down.
    pub fn abort_pending_commands(&mut self) -> Vec<(u64, Message)> {
        self.pending_lists
            .drain(..)
            .map(|p| {
                (
                    p.downstream_id,
                    Message::new("323", ["*", "End of /LIST"]),
                )
            })
            .collect()
    }
}

impl Drop for Upstream {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Bare session state for unit tests; its channels lead nowhere. The
/// returned receiver observes the close signal.
#[cfg(test)]
pub(crate) fn test_upstream(net_id: i64, seq: u64) -> (Upstream, watch::Receiver<bool>) {
    let (out, _) = mpsc::unbounded_channel();
    let (stop, stop_rx) = watch::channel(false);
    let upstream = Upstream {
        net_id,
        seq,
        nick: "tester".to_owned(),
        username: "tester".to_owned(),
        account: None,
        caps: HashSet::new(),
        channels: CaseMap::default(),
        monitored: CaseMap::default(),
        monitor_supported: false,
        away: false,
        local_addr: None,
        remote_addr: None,
        pending_lists: Vec::new(),
        out,
        stop,
    };
    (upstream, stop_rx)
}

// ============================================================================
// Registration
// ============================================================================

/// Everything learned during registration, handed to the dispatcher
/// together with the connection.
pub(crate) struct Registered {
    pub upstream: Upstream,
    pub read_half: SplitStream<IrcFramed>,
    /// Observes the session's close signal; handed to the reader pump.
    pub closed: watch::Receiver<bool>,
    /// PLAIN credentials the server accepted, for auto-save.
    pub sasl_plain: Option<(String, String)>,
}

/// Run the IRC registration handshake until the welcome numeric.
///
/// The caller wraps this in the registration deadline; on success the
/// framed stream is split, the writer task is spawned and the dispatcher
/// takes ownership of the session state.
pub(crate) async fn register(
    mut framed: IrcFramed,
    record: &NetworkRecord,
    net_id: i64,
    default_nick: &str,
    default_realname: &str,
    ident: &str,
    local_addr: Option<String>,
    remote_addr: Option<String>,
) -> Result<Registered, RegistrationError> {
    let mut nick = if record.nick.is_empty() {
        default_nick.to_owned()
    } else {
        record.nick.clone()
    };
    let username = if record.username.is_empty() {
        ident.to_owned()
    } else {
        record.username.clone()
    };
    let realname = if record.realname.is_empty() {
        default_realname.to_owned()
    } else {
        record.realname.clone()
    };

    let want_sasl = record.sasl.mechanism == "PLAIN"
        || (record.sasl.mechanism.is_empty() && !record.sasl.plain_username.is_empty());

    send_line(&mut framed, Message::new("CAP", ["LS", "302"])).await?;
    if !record.pass.is_empty() {
        send_line(&mut framed, Message::new("PASS", [record.pass.as_str()])).await?;
    }
    send_line(&mut framed, Message::new("NICK", [nick.as_str()])).await?;
    send_line(
        &mut framed,
        Message::new("USER", [username.as_str(), "0", "*", realname.as_str()]),
    )
    .await?;

    let mut caps: HashSet<String> = HashSet::new();
    let mut available: HashSet<String> = HashSet::new();
    let mut sasl_plain = None;
    let mut account = None;
    let mut nick_attempts = 0;

    loop {
        let msg = read_line(&mut framed).await?;
        match msg.command.as_str() {
            "PING" => {
                let token = msg.param(0).unwrap_or_default().to_owned();
                send_line(&mut framed, Message::new("PONG", [token.as_str()])).await?;
            }
            "CAP" => match msg.param(1) {
                Some("LS") => {
                    let more = msg.param(2) == Some("*");
                    let list = msg.params.last().map(String::as_str).unwrap_or_default();
                    for cap in list.split_whitespace() {
                        let name = cap.split('=').next().unwrap_or(cap);
                        available.insert(name.to_owned());
                    }
                    if !more {
                        if want_sasl && available.contains("sasl") {
                            send_line(&mut framed, Message::new("CAP", ["REQ", "sasl"])).await?;
                        } else {
                            send_line(&mut framed, Message::new("CAP", ["END"])).await?;
                        }
                    }
                }
                Some("ACK") => {
                    let list = msg.params.last().map(String::as_str).unwrap_or_default();
                    for cap in list.split_whitespace() {
                        caps.insert(cap.to_owned());
                    }
                    if caps.contains("sasl") && want_sasl {
                        send_line(&mut framed, Message::new("AUTHENTICATE", ["PLAIN"])).await?;
                    } else {
                        send_line(&mut framed, Message::new("CAP", ["END"])).await?;
                    }
                }
                Some("NAK") => {
                    send_line(&mut framed, Message::new("CAP", ["END"])).await?;
                }
                _ => {}
            },
            "AUTHENTICATE" if msg.param(0) == Some("+") => {
                let payload = format!(
                    "\0{}\0{}",
                    record.sasl.plain_username, record.sasl.plain_password
                );
                send_line(
                    &mut framed,
                    Message::new("AUTHENTICATE", [BASE64.encode(payload).as_str()]),
                )
                .await?;
            }
            // RPL_LOGGEDIN
            "900" => {
                account = msg.param(2).map(str::to_owned);
            }
            // RPL_SASLSUCCESS
            "903" => {
                sasl_plain = Some((
                    record.sasl.plain_username.clone(),
                    record.sasl.plain_password.clone(),
                ));
                send_line(&mut framed, Message::new("CAP", ["END"])).await?;
            }
            // SASL failures are not worth retrying with the same credentials.
            "902" | "904" | "905" | "906" => {
                return Err(RegistrationError::permanent(format!(
                    "SASL authentication failed: {}",
                    msg.params.last().map(String::as_str).unwrap_or_default()
                )));
            }
            // ERR_ERRONEUSNICKNAME, ERR_NICKNAMEINUSE, ERR_NICKCOLLISION,
            // ERR_UNAVAILRESOURCE
            "432" | "433" | "436" | "437" => {
                nick_attempts += 1;
                if nick_attempts > 3 {
                    return Err(RegistrationError::temporary(format!(
                        "nickname {nick:?} unavailable"
                    )));
                }
                nick.push('_');
                send_line(&mut framed, Message::new("NICK", [nick.as_str()])).await?;
            }
            // ERR_PASSWDMISMATCH
            "464" => {
                return Err(RegistrationError::permanent("password mismatch"));
            }
            // ERR_YOUREBANNEDCREEP
            "465" => {
                return Err(RegistrationError::permanent(format!(
                    "banned: {}",
                    msg.params.last().map(String::as_str).unwrap_or_default()
                )));
            }
            "ERROR" => {
                return Err(RegistrationError::permanent(format!(
                    "server error: {}",
                    msg.param(0).unwrap_or_default()
                )));
            }
            // RPL_WELCOME
            "001" => {
                if let Some(confirmed) = msg.param(0) {
                    nick = confirmed.to_owned();
                }

                let (sink, read_half) = framed.split();
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (stop_tx, stop_rx) = watch::channel(false);
                tokio::spawn(write_loop(sink, out_rx));

                let seq = NEXT_CONN_SEQ.fetch_add(1, Ordering::Relaxed);
                let casemapping = Casemapping::default();
                let upstream = Upstream {
                    net_id,
                    seq,
                    nick,
                    username,
                    account,
                    caps,
                    channels: CaseMap::new(casemapping),
                    monitored: CaseMap::new(casemapping),
                    monitor_supported: false,
                    away: false,
                    local_addr,
                    remote_addr,
                    pending_lists: Vec::new(),
                    out: out_tx,
                    stop: stop_tx,
                };
                return Ok(Registered {
                    upstream,
                    read_half,
                    closed: stop_rx,
                    sasl_plain,
                });
            }
            _ => {}
        }
    }
}

async fn send_line(framed: &mut IrcFramed, msg: Message) -> Result<(), RegistrationError> {
    framed
        .send(msg.to_string())
        .await
        .map_err(|err| RegistrationError::temporary(format!("write failed: {err}")))
}

async fn read_line(framed: &mut IrcFramed) -> Result<Message, RegistrationError> {
    loop {
        match framed.next().await {
            Some(Ok(line)) => match line.parse::<Message>() {
                Ok(msg) => return Ok(msg),
                Err(err) => {
                    debug!(error = %err, "ignoring unparsable line during registration");
                }
            },
            Some(Err(err)) => {
                return Err(RegistrationError::temporary(format!("read failed: {err}")))
            }
            None => return Err(RegistrationError::temporary("connection closed")),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<IrcFramed, String>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        match timeout(WRITE_TIMEOUT, sink.send(msg.to_string())).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "upstream write failed");
                return;
            }
            Err(_) => {
                debug!("upstream write timed out");
                return;
            }
        }
    }
}

/// Pump wire lines into the user's event queue until the connection drops
/// or the session is closed. Returns the read error, if any.
pub(crate) async fn read_messages(
    mut read_half: SplitStream<IrcFramed>,
    events: &EventSender,
    mut closed: watch::Receiver<bool>,
    net_id: i64,
    seq: u64,
) -> Result<(), String> {
    loop {
        tokio::select! {
            changed = closed.changed() => {
                // Either an explicit close or the session state was dropped.
                if changed.is_err() || *closed.borrow() {
                    return Ok(());
                }
            }
            line = read_half.next() => match line {
                Some(Ok(line)) => {
                    match line.parse::<Message>() {
                        Ok(msg) => {
                            if events
                                .send(Event::UpstreamMessage { net_id, seq, msg })
                                .await
                                .is_err()
                            {
                                return Ok(());
                            }
                        }
                        Err(err) => debug!(error = %err, "ignoring unparsable upstream line"),
                    }
                }
                Some(Err(err)) => return Err(err.to_string()),
                None => return Ok(()),
            },
        }
    }
}

pub(crate) fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LEN)
}

// ============================================================================
// Post-registration message handling
// ============================================================================

/// Handle one message from a live upstream, on the user dispatcher.
pub(crate) async fn handle_message(
    user: &mut User,
    net_idx: usize,
    msg: Message,
) -> anyhow::Result<()> {
    let net_id = user.networks[net_idx].record.id;
    let command = msg.command.clone();

    match command.as_str() {
        "PING" => {
            let token = msg.param(0).unwrap_or_default().to_owned();
            if let Some(uc) = &user.networks[net_idx].conn {
                uc.send(Message::new("PONG", [token.as_str()]));
            }
        }
        "PONG" => {}
        // RPL_ISUPPORT
        "005" => {
            let mut new_casemap = None;
            let mut monitor = false;
            let tokens = msg
                .params
                .get(1..msg.params.len().saturating_sub(1))
                .unwrap_or_default();
            for token in tokens {
                let (key, value) = token.split_once('=').unwrap_or((token.as_str(), ""));
                match key {
                    "CASEMAPPING" => new_casemap = Casemapping::from_isupport(value),
                    "MONITOR" => monitor = true,
                    _ => {}
                }
            }
            if monitor {
                if let Some(uc) = &mut user.networks[net_idx].conn {
                    uc.monitor_supported = true;
                }
                refresh_monitor(user, net_idx);
            }
            if let Some(cm) = new_casemap {
                let (net, downstreams) = user.network_and_downstreams(net_idx);
                net.update_casemapping(cm, downstreams);
            }
        }
        "JOIN" => {
            let channel = msg.param(0).unwrap_or_default().to_owned();
            let who = msg.source_nickname().unwrap_or_default().to_owned();
            handle_join(user, net_idx, &channel, &who, &msg).await?;
        }
        "PART" => {
            let channel = msg.param(0).unwrap_or_default().to_owned();
            let who = msg.source_nickname().unwrap_or_default().to_owned();
            let net = &mut user.networks[net_idx];
            let self_part = net
                .conn
                .as_ref()
                .is_some_and(|uc| net.casemap.eq(&who, &uc.nick));
            if let Some(uc) = &mut net.conn {
                if self_part {
                    uc.channels.remove(&channel);
                } else if let Some(uch) = uc.channels.get_mut(&channel) {
                    uch.members.remove(&who);
                }
            }
            forward_to_attached(user, net_idx, &channel, &msg);
        }
        "KICK" => {
            let channel = msg.param(0).unwrap_or_default().to_owned();
            let victim = msg.param(1).unwrap_or_default().to_owned();
            let net = &mut user.networks[net_idx];
            let self_kick = net
                .conn
                .as_ref()
                .is_some_and(|uc| net.casemap.eq(&victim, &uc.nick));
            if let Some(uc) = &mut net.conn {
                if self_kick {
                    uc.channels.remove(&channel);
                } else if let Some(uch) = uc.channels.get_mut(&channel) {
                    uch.members.remove(&victim);
                }
            }
            forward_to_attached(user, net_idx, &channel, &msg);
        }
        "QUIT" => {
            let who = msg.source_nickname().unwrap_or_default().to_owned();
            let mut shared_channel = false;
            {
                let net = &mut user.networks[net_idx];
                if let Some(uc) = &mut net.conn {
                    for (_, uch) in uc.channels.iter_mut() {
                        if uch.members.remove(&who).is_some() {
                            shared_channel = true;
                        }
                    }
                }
            }
            if shared_channel {
                forward_to_applicable(user, net_idx, &msg);
            }
        }
        "NICK" => {
            let who = msg.source_nickname().unwrap_or_default().to_owned();
            let new_nick = msg.param(0).unwrap_or_default().to_owned();
            let net = &mut user.networks[net_idx];
            let self_nick = net
                .conn
                .as_ref()
                .is_some_and(|uc| net.casemap.eq(&who, &uc.nick));
            if let Some(uc) = &mut net.conn {
                if self_nick {
                    uc.nick = new_nick.clone();
                }
                for (_, uch) in uc.channels.iter_mut() {
                    if let Some(prefix) = uch.members.remove(&who) {
                        uch.members.insert(new_nick.clone(), prefix);
                    }
                }
            }
            forward_to_applicable(user, net_idx, &msg);
        }
        "TOPIC" => {
            let channel = msg.param(0).unwrap_or_default().to_owned();
            let topic = msg.param(1).unwrap_or_default().to_owned();
            if let Some(uc) = &mut user.networks[net_idx].conn {
                if let Some(uch) = uc.channels.get_mut(&channel) {
                    uch.topic = if topic.is_empty() { None } else { Some(topic) };
                }
            }
            forward_to_attached(user, net_idx, &channel, &msg);
        }
        // RPL_TOPIC
        "332" => {
            let channel = msg.param(1).unwrap_or_default().to_owned();
            let topic = msg.param(2).unwrap_or_default().to_owned();
            let mut in_burst = false;
            if let Some(uc) = &mut user.networks[net_idx].conn {
                if let Some(uch) = uc.channels.get_mut(&channel) {
                    uch.topic = Some(topic);
                    in_burst = !uch.complete;
                }
            }
            if in_burst {
                forward_numeric_to_attached(user, net_idx, &channel, &msg);
            }
        }
        // RPL_NAMREPLY
        "353" => {
            let channel = msg.param(2).unwrap_or_default().to_owned();
            let names = msg.param(3).unwrap_or_default().to_owned();
            let mut in_burst = false;
            if let Some(uc) = &mut user.networks[net_idx].conn {
                if let Some(uch) = uc.channels.get_mut(&channel) {
                    for raw in names.split_whitespace() {
                        let nick = raw.trim_start_matches(['~', '&', '@', '%', '+']);
                        let prefix = &raw[..raw.len() - nick.len()];
                        uch.members.insert(nick, prefix.to_owned());
                    }
                    in_burst = !uch.complete;
                }
            }
            if in_burst {
                forward_numeric_to_attached(user, net_idx, &channel, &msg);
            }
        }
        // RPL_ENDOFNAMES
        "366" => {
            let channel = msg.param(1).unwrap_or_default().to_owned();
            let mut in_burst = false;
            if let Some(uc) = &mut user.networks[net_idx].conn {
                if let Some(uch) = uc.channels.get_mut(&channel) {
                    in_burst = !uch.complete;
                    uch.complete = true;
                }
            }
            if in_burst {
                forward_numeric_to_attached(user, net_idx, &channel, &msg);
            }
        }
        "PRIVMSG" | "NOTICE" => {
            handle_chat_message(user, net_idx, msg).await?;
        }
        "AWAY" => {
            let msg = msg.clone();
            for dc in user.networks[net_idx].applicable_downstreams(&user.downstreams) {
                if dc.has_cap("away-notify") {
                    dc.send(msg.clone());
                }
            }
        }
        // RPL_MONONLINE / RPL_MONOFFLINE
        "730" | "731" => {
            let targets = msg.param(1).unwrap_or_default().to_owned();
            let net = &user.networks[net_idx];
            for dc in net.applicable_downstreams(&user.downstreams) {
                let interested = targets.split(',').any(|mask| {
                    let nick = mask.split('!').next().unwrap_or(mask);
                    dc.monitored.contains_key(nick)
                });
                if interested {
                    dc.send(msg.clone());
                }
            }
        }
        // RPL_LIST / RPL_LISTEND routed to the requesting downstream.
        "322" | "323" => {
            let requester = user.networks[net_idx]
                .conn
                .as_ref()
                .and_then(|uc| uc.current_list_downstream());
            if let Some(dc_id) = requester {
                if let Some(dc) = user.downstreams.iter().find(|dc| dc.id == dc_id) {
                    dc.send(msg.clone());
                }
            }
            if msg.command == "323" {
                if let Some(uc) = &mut user.networks[net_idx].conn {
                    uc.finish_list();
                }
            }
        }
        "ERROR" => {
            warn!(network = %user.networks[net_idx].record.get_name(),
                  reason = %msg.param(0).unwrap_or_default(),
                  "upstream sent ERROR");
        }
        _ => {
            debug!(network_id = net_id, command = %msg.command, "unhandled upstream message");
        }
    }

    Ok(())
}

async fn handle_join(
    user: &mut User,
    net_idx: usize,
    channel: &str,
    who: &str,
    msg: &Message,
) -> anyhow::Result<()> {
    let events = user.events();
    let net = &mut user.networks[net_idx];
    let net_id = net.record.id;
    let casemap = net.casemap;

    let self_join = net
        .conn
        .as_ref()
        .is_some_and(|uc| casemap.eq(who, &uc.nick));

    let detach_after = net
        .channels
        .get(channel)
        .map(|ch| ch.detach_after)
        .unwrap_or(Duration::ZERO);

    if let Some(uc) = &mut net.conn {
        let seq = uc.seq;
        if self_join {
            let mut uch = UpstreamChannel::new(channel, casemap);
            uch.update_auto_detach(detach_after, &events, net_id, seq);
            uc.channels.insert(channel, uch);
        } else if let Some(uch) = uc.channels.get_mut(channel) {
            uch.members.insert(who, String::new());
        }
    }

    forward_to_attached(user, net_idx, channel, msg);
    Ok(())
}

/// Relay PRIVMSG/NOTICE from upstream: store, apply detach policy, fan out
/// to clients and push subscriptions, advance delivery checkpoints.
async fn handle_chat_message(user: &mut User, net_idx: usize, msg: Message) -> anyhow::Result<()> {
    let events = user.events();
    let (is_channel, target_key) = {
        let net = &user.networks[net_idx];
        let raw_target = msg.param(0).unwrap_or_default().to_owned();
        let our_nick = net
            .conn
            .as_ref()
            .map(|uc| uc.nick.clone())
            .unwrap_or_else(|| net.record.nick.clone());
        if net.casemap.eq(&raw_target, &our_nick) {
            // Direct message: keyed under the sender.
            let sender = msg.source_nickname().unwrap_or("*").to_owned();
            (false, sender)
        } else {
            (true, raw_target)
        }
    };

    let highlight = user.networks[net_idx].is_highlight(&msg);

    // Record first so the delivery checkpoint can point at the new entry.
    let folded = user.networks[net_idx].casemap.fold(&target_key);
    let msg_id = user
        .msg_store
        .append(&user.networks[net_idx].record, &folded, &msg)
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "failed to record message");
            None
        });

    let relay = if is_channel {
        match user.networks[net_idx].channels.get(&target_key) {
            Some(ch) if ch.detached => {
                let net = &user.networks[net_idx];
                net.detached_message_needs_relay(ch, &msg)
            }
            _ => true,
        }
    } else {
        true
    };

    if relay {
        let delivered: Vec<(u64, String)> = {
            let net = &user.networks[net_idx];
            net.applicable_downstreams(&user.downstreams)
                .map(|dc| {
                    let mut out = msg.clone();
                    if let Some(target) = out.params.get_mut(0) {
                        if is_channel {
                            *target = dc.marshal_entity(net, target);
                        } else {
                            *target = dc.nick.clone();
                        }
                    }
                    if let Some(prefix) = out.prefix.take() {
                        out.prefix = Some(dc.marshal_prefix(net, &prefix));
                    }
                    dc.send(out);
                    (dc.id, dc.client_name.clone())
                })
                .collect()
        };
        if let Some(id) = &msg_id {
            let net = &mut user.networks[net_idx];
            for (_, client) in delivered {
                net.delivered.store_id(&target_key, client, id.clone());
            }
        }
    }

    // Channel activity rearms the auto-detach countdown.
    if is_channel {
        let net = &mut user.networks[net_idx];
        let net_id = net.record.id;
        let detach_after = net
            .channels
            .get(&target_key)
            .map(|ch| ch.detach_after)
            .unwrap_or(Duration::ZERO);
        if let Some(uc) = &mut net.conn {
            let seq = uc.seq;
            if let Some(uch) = uc.channels.get_mut(&target_key) {
                uch.update_auto_detach(detach_after, &events, net_id, seq);
            }
        }
    }

    if highlight || !is_channel {
        let net = &user.networks[net_idx];
        net.broadcast_web_push(&user.db, user.push.as_ref(), &msg)
            .await;
    }

    Ok(())
}

/// Forward a channel-scoped message to downstreams that see the channel as
/// attached.
fn forward_to_attached(user: &mut User, net_idx: usize, channel: &str, msg: &Message) {
    let net = &user.networks[net_idx];
    if net.channels.get(channel).is_some_and(|ch| ch.detached) {
        return;
    }
    for dc in net.applicable_downstreams(&user.downstreams) {
        let mut out = msg.clone();
        if let Some(target) = out.params.get_mut(0) {
            *target = dc.marshal_entity(net, target);
        }
        dc.send(out);
    }
}

/// Forward a numeric whose channel parameter is not the first one.
fn forward_numeric_to_attached(user: &mut User, net_idx: usize, channel: &str, msg: &Message) {
    let net = &user.networks[net_idx];
    if net.channels.get(channel).is_some_and(|ch| ch.detached) {
        return;
    }
    for dc in net.applicable_downstreams(&user.downstreams) {
        let mut out = msg.clone();
        for param in out.params.iter_mut() {
            if net.casemap.eq(param, channel) {
                *param = dc.marshal_entity(net, channel);
            }
        }
        if let Some(first) = out.params.first_mut() {
            *first = dc.nick.clone();
        }
        dc.send(out);
    }
}

fn forward_to_applicable(user: &mut User, net_idx: usize, msg: &Message) {
    let net = &user.networks[net_idx];
    for dc in net.applicable_downstreams(&user.downstreams) {
        dc.send(msg.clone());
    }
}

/// Recompute the upstream MONITOR list from all applicable downstreams.
pub(crate) fn refresh_monitor(user: &mut User, net_idx: usize) {
    let desired: Vec<String> = {
        let net = &user.networks[net_idx];
        net.applicable_downstreams(&user.downstreams)
            .flat_map(|dc| dc.monitored.keys().map(str::to_owned).collect::<Vec<_>>())
            .collect()
    };
    if let Some(uc) = &mut user.networks[net_idx].conn {
        uc.update_monitor(desired.iter().map(String::as_str));
    }
}

/// Recompute the upstream auto-away state from attached clients.
pub(crate) fn refresh_away(user: &mut User, net_idx: usize) {
    let attached = {
        let net = &user.networks[net_idx];
        net.applicable_downstreams(&user.downstreams).count()
    };
    if let Some(uc) = &mut user.networks[net_idx].conn {
        uc.update_away(attached == 0);
    }
}
