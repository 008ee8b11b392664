//! Downstream (client) connection handling.
//!
//! Same three-phase lifecycle as upstream connections: a sequential
//! registration handshake on the owned framed stream, then a split into a
//! reader pump (posting events to the owning user) and a writer task, with
//! the session state handed to the user dispatcher.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use pontoon_proto::{CaseMap, Message, Prefix};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::db;
use crate::error::HandlerError;
use crate::network::Network;
use crate::server::{Server, BACKLOG_LIMIT, BACKLOG_TIMEOUT, DOWNSTREAM_REGISTER_TIMEOUT};
use crate::store::MessageStore;
use crate::upstream::{line_codec, UpstreamChannel};
use crate::user::{Event, User};

static NEXT_DOWNSTREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Capabilities the bouncer itself understands.
const SUPPORTED_CAPS: &[&str] = &[
    "account-notify",
    "away-notify",
    "message-tags",
    "server-time",
    "soju.im/bouncer-networks",
    "soju.im/bouncer-networks-notify",
];

/// Caps whose real behavior depends on the bound upstream supporting them.
const PASSTHROUGH_CAPS: &[&str] = &["account-notify", "away-notify", "message-tags"];

/// A registered downstream session. Owned by the user dispatcher.
pub struct Downstream {
    pub id: u64,
    pub nick: String,
    pub username: String,
    pub realname: String,
    /// Distinguishes devices of the same user for delivery receipts.
    pub client_name: String,
    /// Network name requested at registration (`user/network`).
    pub network_name: Option<String>,
    /// Bound network id, resolved during welcome.
    pub network_id: Option<i64>,
    pub is_multi_upstream: bool,
    pub caps: HashSet<String>,
    /// Negotiated CAP protocol version (302 enables CAP NEW/DEL).
    pub cap_version: u32,
    pub monitored: CaseMap<()>,
    pub away: Option<String>,
    out: mpsc::UnboundedSender<Message>,
    stop: watch::Sender<bool>,
}

impl Downstream {
    pub fn send(&self, msg: Message) {
        let _ = self.out.send(msg);
    }

    /// Ask the session's reader and writer tasks to terminate. The actual
    /// removal happens when the reader posts its disconnect event.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn has_cap(&self, cap: &str) -> bool {
        self.caps.contains(cap)
    }

    /// The prefix representing this user on the bouncer.
    pub fn prefix(&self, hostname: &str) -> Prefix {
        Prefix::new(self.nick.clone(), self.username.clone(), hostname)
    }

    /// Entity name as seen by this client: multi-upstream sessions get a
    /// `/network` suffix.
    pub fn marshal_entity(&self, net: &Network, name: &str) -> String {
        if self.is_multi_upstream {
            format!("{name}/{}", net.get_name())
        } else {
            name.to_owned()
        }
    }

    /// Sender prefix as seen by this client; multi-upstream sessions get
    /// the nick suffixed so replies route back to the right network.
    pub fn marshal_prefix(&self, net: &Network, prefix: &Prefix) -> Prefix {
        if !self.is_multi_upstream {
            return prefix.clone();
        }
        match prefix {
            Prefix::Nickname(nick, user, host) => Prefix::Nickname(
                format!("{nick}/{}", net.get_name()),
                user.clone(),
                host.clone(),
            ),
            other => other.clone(),
        }
    }
}

/// `user[/network][@client]`.
fn split_username(raw: &str) -> (String, Option<String>, String) {
    let (rest, client) = match raw.split_once('@') {
        Some((rest, client)) if !client.is_empty() => (rest, client.to_owned()),
        _ => (raw, "default".to_owned()),
    };
    match rest.split_once('/') {
        Some((account, network)) if !network.is_empty() => {
            (account.to_owned(), Some(network.to_owned()), client)
        }
        _ => (rest.to_owned(), None, client),
    }
}

#[derive(Default)]
struct Handshake {
    nick: Option<String>,
    username: Option<String>,
    realname: String,
    pass: Option<String>,
    caps: HashSet<String>,
    cap_version: u32,
    negotiating: bool,
}

type DownstreamFramed = Framed<TcpStream, tokio_util::codec::LinesCodec>;

/// Serve one accepted client socket: registration, authentication, then
/// the streaming phase.
pub(crate) async fn serve(server: Server, stream: TcpStream, remote: SocketAddr) {
    let id = NEXT_DOWNSTREAM_ID.fetch_add(1, Ordering::Relaxed);
    let mut framed = Framed::new(stream, line_codec());

    debug!(downstream_id = id, remote = %remote, "downstream connected");

    let handshake = match timeout(DOWNSTREAM_REGISTER_TIMEOUT, handshake(&mut framed)).await {
        Ok(Ok(Some(handshake))) => handshake,
        Ok(Ok(None)) => return,
        Ok(Err(err)) => {
            debug!(downstream_id = id, error = %err, "handshake failed");
            return;
        }
        Err(_) => {
            let _ = framed
                .send(Message::new("ERROR", ["Registration timed out"]).to_string())
                .await;
            return;
        }
    };

    let nick = handshake.nick.clone().unwrap_or_default();
    let (account, network_name, client_name) =
        split_username(handshake.username.as_deref().unwrap_or_default());

    // Authenticate against storage.
    let user_rec = match server.db().get_user(&account).await {
        Ok(Some(rec)) => rec,
        Ok(None) => {
            reject(&mut framed, &nick).await;
            return;
        }
        Err(err) => {
            warn!(error = %err, "failed to look up user");
            reject(&mut framed, &nick).await;
            return;
        }
    };
    if !user_rec.password.is_empty() {
        let ok = handshake
            .pass
            .as_deref()
            .is_some_and(|pass| db::verify_password(pass, &user_rec.password).is_ok());
        if !ok {
            reject(&mut framed, &nick).await;
            return;
        }
    }

    let Some(handle) = server.user_handle(&account) else {
        warn!(user = %account, "no running dispatcher for user");
        reject(&mut framed, &nick).await;
        return;
    };

    let config = server.config();
    let is_multi_upstream = network_name.is_none() && config.multi_upstream;

    let (sink, mut read_half) = framed.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (stop_tx, writer_stop) = watch::channel(false);
    let mut reader_stop = stop_tx.subscribe();
    tokio::spawn(write_loop(sink, out_rx, writer_stop));

    let downstream = Downstream {
        id,
        nick,
        username: account,
        realname: handshake.realname.clone(),
        client_name,
        network_name,
        network_id: None,
        is_multi_upstream,
        caps: handshake.caps,
        cap_version: handshake.cap_version,
        monitored: CaseMap::default(),
        away: None,
        out: out_tx,
        stop: stop_tx,
    };

    server.metrics().downstreams_inc();

    if handle
        .events
        .send(Event::DownstreamConnected {
            downstream: Box::new(downstream),
        })
        .await
        .is_err()
    {
        server.metrics().downstreams_dec();
        return;
    }

    loop {
        tokio::select! {
            changed = reader_stop.changed() => {
                if changed.is_err() || *reader_stop.borrow() {
                    break;
                }
            }
            line = read_half.next() => match line {
                Some(Ok(line)) => match line.parse::<Message>() {
                    Ok(msg) => {
                        if handle
                            .events
                            .send(Event::DownstreamMessage { id, msg })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => debug!(downstream_id = id, error = %err,
                                       "ignoring unparsable line"),
                },
                Some(Err(err)) => {
                    debug!(downstream_id = id, error = %err, "downstream read failed");
                    break;
                }
                None => break,
            },
        }
    }

    let _ = handle
        .events
        .send(Event::DownstreamDisconnected { id })
        .await;
    server.metrics().downstreams_dec();
    debug!(downstream_id = id, remote = %remote, "downstream disconnected");
}

async fn reject(framed: &mut DownstreamFramed, nick: &str) {
    let nick = if nick.is_empty() { "*" } else { nick };
    let _ = framed
        .send(Message::new("464", [nick, "Password incorrect"]).to_string())
        .await;
    let _ = framed
        .send(Message::new("ERROR", ["Authentication failed"]).to_string())
        .await;
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<DownstreamFramed, String>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    // The close signal can win the race against a message
                    // queued just before it (a rejection or error line).
                    // Whatever is already in the queue still gets written.
                    while let Ok(msg) = rx.try_recv() {
                        if sink.send(msg.to_string()).await.is_err() {
                            return;
                        }
                    }
                    let _ = sink.flush().await;
                    return;
                }
            }
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if sink.send(msg.to_string()).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = sink.flush().await;
                    return;
                }
            },
        }
    }
}

/// Sequential registration phase: CAP negotiation, PASS/NICK/USER.
/// Returns `None` on a clean QUIT.
async fn handshake(framed: &mut DownstreamFramed) -> anyhow::Result<Option<Handshake>> {
    let mut hs = Handshake::default();

    loop {
        let line = match framed.next().await {
            Some(line) => line?,
            None => return Ok(None),
        };
        let msg: Message = match line.parse() {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "ignoring unparsable line during registration");
                continue;
            }
        };

        match msg.command.as_str() {
            "CAP" => match msg.param(0) {
                Some("LS") => {
                    hs.negotiating = true;
                    hs.cap_version = msg
                        .param(1)
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(301)
                        .max(hs.cap_version);
                    let caps = SUPPORTED_CAPS.join(" ");
                    framed
                        .send(Message::new("CAP", ["*", "LS", caps.as_str()]).to_string())
                        .await?;
                }
                Some("REQ") => {
                    hs.negotiating = true;
                    let req = msg.params.last().map(String::as_str).unwrap_or_default();
                    let supported = req.split_whitespace().all(|cap| {
                        SUPPORTED_CAPS.contains(&cap.trim_start_matches('-'))
                    });
                    if supported {
                        for cap in req.split_whitespace() {
                            match cap.strip_prefix('-') {
                                Some(cap) => {
                                    hs.caps.remove(cap);
                                }
                                None => {
                                    hs.caps.insert(cap.to_owned());
                                }
                            }
                        }
                        framed
                            .send(Message::new("CAP", ["*", "ACK", req]).to_string())
                            .await?;
                    } else {
                        framed
                            .send(Message::new("CAP", ["*", "NAK", req]).to_string())
                            .await?;
                    }
                }
                Some("LIST") => {
                    let enabled: Vec<&str> = hs.caps.iter().map(String::as_str).collect();
                    let enabled = enabled.join(" ");
                    framed
                        .send(
                            Message::new("CAP", ["*", "LIST", enabled.as_str()]).to_string(),
                        )
                        .await?;
                }
                Some("END") => hs.negotiating = false,
                _ => {
                    framed
                        .send(
                            Message::new("410", ["*", "Invalid CAP command"]).to_string(),
                        )
                        .await?;
                }
            },
            "PASS" => hs.pass = msg.param(0).map(str::to_owned),
            "NICK" => hs.nick = msg.param(0).map(str::to_owned),
            "USER" => {
                hs.username = msg.param(0).map(str::to_owned);
                hs.realname = msg.param(3).unwrap_or_default().to_owned();
            }
            "PING" => {
                framed
                    .send(
                        Message::new("PONG", [msg.param(0).unwrap_or_default()]).to_string(),
                    )
                    .await?;
            }
            "QUIT" => return Ok(None),
            _ => {}
        }

        if hs.nick.is_some() && hs.username.is_some() && !hs.negotiating {
            return Ok(Some(hs));
        }
    }
}

// ============================================================================
// Welcome
// ============================================================================

/// Bring a freshly registered client up to date: numerics, MOTD, channel
/// state and backlog. Runs on the user dispatcher, before the session is
/// added to the downstream list.
pub(crate) async fn welcome(user: &mut User, dc: &mut Downstream) -> Result<(), HandlerError> {
    if let Some(name) = dc.network_name.clone() {
        match user.network_idx_by_name(&name) {
            Some(idx) => {
                dc.network_id = Some(user.networks[idx].record.id);
                dc.monitored.set_casemapping(user.networks[idx].casemap);
            }
            None => {
                return Err(HandlerError::Irc(Message::new(
                    "ERROR",
                    [format!("unknown network {name:?}").as_str()],
                )));
            }
        }
    }

    let config = user.config.get();
    let hostname = config.hostname.clone();
    let server_prefix = Prefix::ServerName(hostname.clone());
    let nick = dc.nick.clone();

    let title = config.title.clone().unwrap_or_else(|| "pontoon".to_owned());
    let welcome_text = format!("Welcome to {title}, {nick}");
    dc.send(
        Message::new("001", [nick.as_str(), welcome_text.as_str()])
            .with_prefix(server_prefix.clone()),
    );
    let host_text = format!("Your host is {hostname}, running pontoon");
    dc.send(
        Message::new("002", [nick.as_str(), host_text.as_str()])
            .with_prefix(server_prefix.clone()),
    );
    dc.send(
        Message::new("003", [nick.as_str(), "This server is always on"])
            .with_prefix(server_prefix.clone()),
    );
    dc.send(
        Message::new("004", [nick.as_str(), hostname.as_str(), "pontoon", "aiwro", "ov"])
            .with_prefix(server_prefix.clone()),
    );
    dc.send(
        Message::new(
            "005",
            [
                nick.as_str(),
                "CASEMAPPING=rfc1459",
                "BOUNCER",
                "are supported by this server",
            ],
        )
        .with_prefix(server_prefix.clone()),
    );

    match &config.motd {
        Some(motd) => {
            let header = format!("- {hostname} Message of the day");
            dc.send(
                Message::new("375", [nick.as_str(), header.as_str()])
                    .with_prefix(server_prefix.clone()),
            );
            for line in motd.lines() {
                let line = format!("- {line}");
                dc.send(
                    Message::new("372", [nick.as_str(), line.as_str()])
                        .with_prefix(server_prefix.clone()),
                );
            }
            dc.send(
                Message::new("376", [nick.as_str(), "End of /MOTD command"])
                    .with_prefix(server_prefix.clone()),
            );
        }
        None => {
            dc.send(
                Message::new("422", [nick.as_str(), "No MOTD"]).with_prefix(server_prefix.clone()),
            );
        }
    }

    // Replay channel state for every visible network.
    for idx in user.visible_network_indices(dc) {
        let net = &user.networks[idx];
        let joins: Vec<String> = net
            .channels
            .iter()
            .filter(|(_, ch)| !ch.detached)
            .map(|(name, _)| name.to_owned())
            .collect();
        for name in joins {
            let net = &user.networks[idx];
            let Some(uch) = net.conn.as_ref().and_then(|uc| uc.channels.get(&name)) else {
                continue;
            };
            dc.send(
                Message::new("JOIN", [dc.marshal_entity(net, &name).as_str()])
                    .with_prefix(dc.prefix(&hostname)),
            );
            forward_channel(dc, net, uch, &hostname);
        }
    }

    // Replay missed messages since each delivery checkpoint.
    if user.msg_store.is_persistent() {
        let store = user.msg_store.clone();
        for idx in user.visible_network_indices(dc) {
            let targets: Vec<String> = user.networks[idx]
                .delivered
                .targets()
                .map(str::to_owned)
                .collect();
            for target in targets {
                let after = user.networks[idx]
                    .delivered
                    .load_id(&target, &dc.client_name)
                    .map(str::to_owned);
                if let Some(after) = after {
                    send_target_backlog(
                        &mut user.networks[idx],
                        dc,
                        store.as_ref(),
                        &target,
                        &after,
                    )
                    .await;
                }
            }
        }
    }

    Ok(())
}

/// Send a channel's topic and names to one client.
pub(crate) fn forward_channel(
    dc: &Downstream,
    net: &Network,
    uch: &UpstreamChannel,
    hostname: &str,
) {
    let server_prefix = Prefix::ServerName(hostname.to_owned());
    let marshaled = dc.marshal_entity(net, &uch.name);

    if let Some(topic) = &uch.topic {
        dc.send(
            Message::new("332", [dc.nick.as_str(), marshaled.as_str(), topic.as_str()])
                .with_prefix(server_prefix.clone()),
        );
    }

    let names: Vec<String> = uch
        .members
        .iter()
        .map(|(nick, prefix)| format!("{prefix}{nick}"))
        .collect();
    for chunk in names.chunks(12) {
        let chunk = chunk.join(" ");
        dc.send(
            Message::new(
                "353",
                [dc.nick.as_str(), "=", marshaled.as_str(), chunk.as_str()],
            )
            .with_prefix(server_prefix.clone()),
        );
    }
    dc.send(
        Message::new("366", [dc.nick.as_str(), marshaled.as_str(), "End of /NAMES list"])
            .with_prefix(server_prefix),
    );
}

/// Replay stored messages on `target` newer than `after_id` to one client,
/// advancing its delivery checkpoint.
pub(crate) async fn send_target_backlog(
    net: &mut Network,
    dc: &Downstream,
    store: &dyn MessageStore,
    target: &str,
    after_id: &str,
) {
    let folded = net.casemap.fold(target);
    let backlog = match timeout(
        BACKLOG_TIMEOUT,
        store.load_after(&net.record, &folded, after_id, BACKLOG_LIMIT),
    )
    .await
    {
        Ok(Ok(backlog)) => backlog,
        Ok(Err(err)) => {
            warn!(msg_target = %target, error = %err, "failed to load backlog");
            return;
        }
        Err(_) => {
            warn!(msg_target = %target, "backlog query timed out");
            return;
        }
    };

    let is_channel = net.channels.contains_key(target) || target.starts_with('#');
    let mut last_id = None;
    for (id, mut msg) in backlog {
        // For direct messages the stored target is the peer; inbound lines
        // are re-addressed to this client, our own echoes keep the peer.
        let inbound = msg
            .source_nickname()
            .is_some_and(|sender| net.casemap.eq(sender, target));
        if let Some(first) = msg.params.first_mut() {
            *first = if is_channel || !inbound {
                dc.marshal_entity(net, target)
            } else {
                dc.nick.clone()
            };
        }
        if let Some(prefix) = msg.prefix.take() {
            msg.prefix = Some(dc.marshal_prefix(net, &prefix));
        }
        dc.send(msg);
        last_id = Some(id);
    }

    if let Some(id) = last_id {
        net.delivered.store_id(target, dc.client_name.clone(), id);
    }
}

// ============================================================================
// Dynamic capability bookkeeping
// ============================================================================

/// Re-advertise passthrough caps to a bound client after its upstream
/// gained or lost them.
pub(crate) fn update_supported_caps(dc: &mut Downstream, net: &Network) {
    if dc.network_id != Some(net.record.id) || dc.cap_version < 302 {
        return;
    }

    for &cap in PASSTHROUGH_CAPS {
        let available = net
            .conn
            .as_ref()
            .is_some_and(|uc| uc.caps.contains(cap));
        if !available && dc.caps.contains(cap) {
            dc.caps.remove(cap);
            dc.send(Message::new("CAP", [dc.nick.as_str(), "DEL", cap]));
        } else if available && !dc.caps.contains(cap) {
            dc.send(Message::new("CAP", [dc.nick.as_str(), "NEW", cap]));
        }
    }
}

/// Align a bound client's nick with the live upstream nick.
pub(crate) fn update_nick(dc: &mut Downstream, net: &Network, hostname: &str) {
    if dc.network_id != Some(net.record.id) {
        return;
    }
    let Some(uc) = &net.conn else {
        return;
    };
    if uc.nick == dc.nick {
        return;
    }
    let msg = Message::new("NICK", [uc.nick.as_str()]).with_prefix(dc.prefix(hostname));
    dc.send(msg);
    dc.nick = uc.nick.clone();
}

/// Tell an account-notify client about the upstream account binding.
pub(crate) fn update_account(dc: &Downstream, net: &Network) {
    if dc.network_id != Some(net.record.id) || !dc.has_cap("account-notify") {
        return;
    }
    let Some(uc) = &net.conn else {
        return;
    };
    let account = uc.account.as_deref().unwrap_or("*");
    dc.send(Message::new("ACCOUNT", [account]).with_prefix(Prefix::new(
        dc.nick.clone(),
        dc.username.clone(),
        "*",
    )));
}

// ============================================================================
// Message handling
// ============================================================================

/// Handle one command from a registered client, on the user dispatcher.
pub(crate) async fn handle_message(
    user: &mut User,
    dc_idx: usize,
    msg: Message,
) -> Result<(), HandlerError> {
    let nick = user.downstreams[dc_idx].nick.clone();
    let hostname = user.config.get().hostname.clone();
    let command = msg.command.clone();

    match command.as_str() {
        "PING" => {
            let token = msg.param(0).unwrap_or_default();
            user.downstreams[dc_idx].send(
                Message::new("PONG", [hostname.as_str(), token])
                    .with_prefix(Prefix::ServerName(hostname.clone())),
            );
        }
        "PONG" => {}
        "QUIT" => {
            let dc = &user.downstreams[dc_idx];
            dc.send(Message::new("ERROR", ["Closing connection"]));
            dc.close();
        }
        "NICK" => {
            let new_nick = msg
                .param(0)
                .ok_or_else(|| HandlerError::need_more_params(&nick, "NICK"))?
                .to_owned();
            {
                let dc = &mut user.downstreams[dc_idx];
                let echo =
                    Message::new("NICK", [new_nick.as_str()]).with_prefix(dc.prefix(&hostname));
                dc.send(echo);
                dc.nick = new_nick.clone();
            }
            // A bound client renames the upstream identity too.
            let dc = &user.downstreams[dc_idx];
            if let Some(net_id) = dc.network_id {
                if let Some(net) = user.networks.iter().find(|n| n.record.id == net_id) {
                    if let Some(uc) = &net.conn {
                        uc.send(Message::new("NICK", [new_nick.as_str()]));
                    }
                }
            }
        }
        "JOIN" => {
            let channels = msg
                .param(0)
                .ok_or_else(|| HandlerError::need_more_params(&nick, "JOIN"))?
                .to_owned();
            let keys: Vec<&str> = msg.param(1).unwrap_or_default().split(',').collect();
            for (i, raw) in channels.split(',').filter(|s| !s.is_empty()).enumerate() {
                let key = keys.get(i).copied().unwrap_or_default();
                handle_join(user, dc_idx, raw, key).await?;
            }
        }
        "PART" => {
            let channels = msg
                .param(0)
                .ok_or_else(|| HandlerError::need_more_params(&nick, "PART"))?
                .to_owned();
            let reason = msg.param(1).unwrap_or("").to_owned();
            for raw in channels.split(',').filter(|s| !s.is_empty()) {
                handle_part(user, dc_idx, raw, &reason).await?;
            }
        }
        "PRIVMSG" | "NOTICE" => {
            handle_chat(user, dc_idx, msg).await?;
        }
        "AWAY" => {
            let away = msg.param(0).filter(|text| !text.is_empty()).map(str::to_owned);
            let reply = if away.is_some() {
                Message::new("306", [nick.as_str(), "You have been marked as being away"])
            } else {
                Message::new("305", [nick.as_str(), "You are no longer marked as being away"])
            };
            {
                let dc = &mut user.downstreams[dc_idx];
                dc.away = away;
                dc.send(reply.with_prefix(Prefix::ServerName(hostname.clone())));
            }
            for idx in 0..user.networks.len() {
                crate::upstream::refresh_away(user, idx);
            }
        }
        "MONITOR" => {
            handle_monitor(user, dc_idx, &msg)?;
        }
        "LIST" => {
            handle_list(user, dc_idx, msg)?;
        }
        "CAP" => {
            handle_cap(user, dc_idx, &msg)?;
        }
        "TOPIC" => {
            let channel = msg
                .param(0)
                .ok_or_else(|| HandlerError::need_more_params(&nick, "TOPIC"))?
                .to_owned();
            let (net_idx, name) = resolve_entity(user, dc_idx, &channel)?;
            let net = &user.networks[net_idx];
            match msg.param(1) {
                Some(topic) => {
                    if let Some(uc) = &net.conn {
                        uc.send(Message::new("TOPIC", [name.as_str(), topic]));
                    }
                }
                None => {
                    let topic = net
                        .conn
                        .as_ref()
                        .and_then(|uc| uc.channels.get(&name))
                        .and_then(|uch| uch.topic.clone());
                    let dc = &user.downstreams[dc_idx];
                    let reply = match topic {
                        Some(topic) => Message::new(
                            "332",
                            [nick.as_str(), channel.as_str(), topic.as_str()],
                        ),
                        None => Message::new(
                            "331",
                            [nick.as_str(), channel.as_str(), "No topic is set"],
                        ),
                    };
                    dc.send(reply.with_prefix(Prefix::ServerName(hostname.clone())));
                }
            }
        }
        "USER" | "PASS" => {
            return Err(HandlerError::Irc(Message::new(
                "462",
                [nick.as_str(), "You may not reregister"],
            )));
        }
        // Pass-through for bound clients: the upstream answers directly.
        "WHO" | "WHOIS" | "WHOWAS" | "MODE" | "NAMES" | "INVITE" | "KICK" => {
            let dc = &user.downstreams[dc_idx];
            let bound = dc
                .network_id
                .and_then(|net_id| user.networks.iter().find(|n| n.record.id == net_id));
            match bound.and_then(|net| net.conn.as_ref()) {
                Some(uc) => uc.send(msg),
                None => {
                    return Err(HandlerError::unknown_command(&nick, &msg.command));
                }
            }
        }
        _ => {
            return Err(HandlerError::unknown_command(&nick, &msg.command));
        }
    }

    Ok(())
}

/// Resolve a client-visible entity name to `(network index, real name)`.
pub(crate) fn resolve_entity(
    user: &User,
    dc_idx: usize,
    raw: &str,
) -> Result<(usize, String), HandlerError> {
    let dc = &user.downstreams[dc_idx];
    if let Some(net_id) = dc.network_id {
        let idx = user
            .networks
            .iter()
            .position(|net| net.record.id == net_id)
            .ok_or_else(|| HandlerError::Internal("bound network is gone".to_owned()))?;
        return Ok((idx, raw.to_owned()));
    }
    if dc.is_multi_upstream {
        if let Some((name, net_name)) = raw.rsplit_once('/') {
            if let Some(idx) = user.network_idx_by_name(net_name) {
                return Ok((idx, name.to_owned()));
            }
        }
        return Err(HandlerError::no_such_channel(&dc.nick, raw));
    }
    Err(HandlerError::no_such_channel(&dc.nick, raw))
}

async fn handle_join(
    user: &mut User,
    dc_idx: usize,
    raw: &str,
    key: &str,
) -> Result<(), HandlerError> {
    let (net_idx, name) = resolve_entity(user, dc_idx, raw)?;
    let events = user.events();
    let store = user.msg_store.clone();
    let hostname = user.config.get().hostname.clone();
    let db = user.db.clone();
    let net_id = user.networks[net_idx].record.id;

    let known = user.networks[net_idx].channels.contains_key(&name);
    if known {
        let detached = user.networks[net_idx]
            .channels
            .get(&name)
            .is_some_and(|ch| ch.detached);
        if detached {
            user.networks[net_idx]
                .attach(&name, &user.downstreams, store.as_ref(), &hostname, &events)
                .await;
            if let Some(mut ch) = user.networks[net_idx].channels.get(&name).cloned() {
                if let Err(err) = db.store_channel(net_id, &mut ch).await {
                    warn!(channel = %ch.name, error = %err, "failed to store channel");
                }
            }
            return Ok(());
        }
    } else {
        let mut ch = crate::db::ChannelRecord {
            name: name.clone(),
            key: key.to_owned(),
            ..Default::default()
        };
        db.store_channel(net_id, &mut ch).await?;
        user.networks[net_idx].channels.insert(name.clone(), ch);
    }

    let net = &user.networks[net_idx];
    if let Some(uc) = &net.conn {
        if uc.channels.contains_key(&name) {
            // Already joined upstream: replay state to this client only.
            let dc = &user.downstreams[dc_idx];
            dc.send(
                Message::new("JOIN", [dc.marshal_entity(net, &name).as_str()])
                    .with_prefix(dc.prefix(&hostname)),
            );
            if let Some(uch) = uc.channels.get(&name) {
                forward_channel(dc, net, uch, &hostname);
            }
        } else if key.is_empty() {
            uc.send(Message::new("JOIN", [name.as_str()]));
        } else {
            uc.send(Message::new("JOIN", [name.as_str(), key]));
        }
    }
    Ok(())
}

async fn handle_part(
    user: &mut User,
    dc_idx: usize,
    raw: &str,
    reason: &str,
) -> Result<(), HandlerError> {
    let (net_idx, name) = resolve_entity(user, dc_idx, raw)?;
    let nick = user.downstreams[dc_idx].nick.clone();
    if !user.networks[net_idx].channels.contains_key(&name) {
        return Err(HandlerError::no_such_channel(&nick, raw));
    }

    let events = user.events();
    let db = user.db.clone();
    let hostname = user.config.get().hostname.clone();

    if let Some(uc) = &user.networks[net_idx].conn {
        if reason.is_empty() {
            uc.send(Message::new("PART", [name.as_str()]));
        } else {
            uc.send(Message::new("PART", [name.as_str(), reason]));
        }
    }

    if let Err(err) = user.networks[net_idx]
        .delete_channel(&db, &name, &events)
        .await
    {
        warn!(channel = %name, error = %err, "failed to delete channel");
    }

    let net = &user.networks[net_idx];
    for dc in net.applicable_downstreams(&user.downstreams) {
        let mut params = vec![dc.marshal_entity(net, &name)];
        if !reason.is_empty() {
            params.push(reason.to_owned());
        }
        dc.send(Message::new("PART", params).with_prefix(dc.prefix(&hostname)));
    }
    Ok(())
}

async fn handle_chat(
    user: &mut User,
    dc_idx: usize,
    msg: Message,
) -> Result<(), HandlerError> {
    let nick = user.downstreams[dc_idx].nick.clone();
    let raw_target = msg
        .param(0)
        .ok_or_else(|| HandlerError::need_more_params(&nick, &msg.command))?
        .to_owned();
    let text = msg
        .param(1)
        .ok_or_else(|| HandlerError::need_more_params(&nick, &msg.command))?
        .to_owned();

    // The bouncer's own service user.
    if raw_target.eq_ignore_ascii_case(crate::service::SERVICE_NICK) {
        if msg.command == "PRIVMSG" {
            let dc_id = user.downstreams[dc_idx].id;
            crate::service::handle_command(user, dc_id, &text).await?;
        }
        return Ok(());
    }

    let (net_idx, target) = resolve_entity(user, dc_idx, &raw_target)?;
    let hostname = user.config.get().hostname.clone();
    let command = msg.command.clone();

    let (upstream_nick, upstream_username) = {
        let net = &user.networks[net_idx];
        let Some(uc) = &net.conn else {
            return Err(HandlerError::Irc(Message::new(
                "401",
                [
                    nick.as_str(),
                    raw_target.as_str(),
                    "Not connected to network",
                ],
            )));
        };
        uc.send(Message::new(command.as_str(), [target.as_str(), text.as_str()]));
        (uc.nick.clone(), uc.username.clone())
    };

    // Record and echo to the user's other clients.
    let echo = Message::new(command.as_str(), [target.as_str(), text.as_str()])
        .with_prefix(Prefix::new(upstream_nick, upstream_username, hostname));

    let folded = user.networks[net_idx].casemap.fold(&target);
    let msg_id = user
        .msg_store
        .append(&user.networks[net_idx].record, &folded, &echo)
        .await
        .unwrap_or_else(|err| {
            warn!(error = %err, "failed to record message");
            None
        });

    let dc_id = user.downstreams[dc_idx].id;
    let delivered: Vec<String> = {
        let net = &user.networks[net_idx];
        net.applicable_downstreams(&user.downstreams)
            .filter(|dc| dc.id != dc_id)
            .map(|dc| {
                let mut out = echo.clone();
                if let Some(first) = out.params.first_mut() {
                    *first = dc.marshal_entity(net, &target);
                }
                dc.send(out);
                dc.client_name.clone()
            })
            .collect()
    };

    if let Some(id) = msg_id {
        let sender_client = user.downstreams[dc_idx].client_name.clone();
        let net = &mut user.networks[net_idx];
        for client in delivered {
            net.delivered.store_id(&target, client, id.clone());
        }
        net.delivered.store_id(&target, sender_client, id);
    }
    Ok(())
}

fn handle_monitor(user: &mut User, dc_idx: usize, msg: &Message) -> Result<(), HandlerError> {
    let nick = user.downstreams[dc_idx].nick.clone();
    let subcmd = msg
        .param(0)
        .ok_or_else(|| HandlerError::need_more_params(&nick, "MONITOR"))?
        .to_owned();

    match subcmd.as_str() {
        "+" | "-" => {
            let targets = msg
                .param(1)
                .ok_or_else(|| HandlerError::need_more_params(&nick, "MONITOR"))?
                .to_owned();
            let dc = &mut user.downstreams[dc_idx];
            for target in targets.split(',').filter(|t| !t.is_empty()) {
                if subcmd == "+" {
                    dc.monitored.insert(target, ());
                } else {
                    dc.monitored.remove(target);
                }
            }
        }
        "C" => {
            let dc = &mut user.downstreams[dc_idx];
            let targets: Vec<String> = dc.monitored.keys().map(str::to_owned).collect();
            for target in targets {
                dc.monitored.remove(&target);
            }
        }
        "L" => {
            let dc = &user.downstreams[dc_idx];
            let list = dc.monitored.keys().collect::<Vec<&str>>().join(",");
            if !list.is_empty() {
                dc.send(Message::new("732", [nick.as_str(), list.as_str()]));
            }
            dc.send(Message::new("733", [nick.as_str(), "End of MONITOR list"]));
            return Ok(());
        }
        _ => {
            return Err(HandlerError::unknown_command(&nick, "MONITOR"));
        }
    }

    let visible = {
        let dc = &user.downstreams[dc_idx];
        user.visible_network_indices(dc)
    };
    for idx in visible {
        crate::upstream::refresh_monitor(user, idx);
    }
    Ok(())
}

fn handle_list(user: &mut User, dc_idx: usize, msg: Message) -> Result<(), HandlerError> {
    let nick = user.downstreams[dc_idx].nick.clone();
    let dc_id = user.downstreams[dc_idx].id;

    let visible = {
        let dc = &user.downstreams[dc_idx];
        user.visible_network_indices(dc)
    };
    let connected: Vec<usize> = visible
        .into_iter()
        .filter(|&idx| user.networks[idx].conn.is_some())
        .collect();

    match connected.as_slice() {
        [idx] => {
            if let Some(uc) = user.networks[*idx].conn.as_mut() {
                uc.enqueue_list(dc_id, msg);
            }
        }
        _ => {
            // Zero or ambiguous targets: reply with an empty listing.
            let dc = &user.downstreams[dc_idx];
            dc.send(Message::new("321", [nick.as_str(), "Channel", "Users  Name"]));
            dc.send(Message::new("323", [nick.as_str(), "End of /LIST"]));
        }
    }
    Ok(())
}

fn handle_cap(user: &mut User, dc_idx: usize, msg: &Message) -> Result<(), HandlerError> {
    let nick = user.downstreams[dc_idx].nick.clone();
    let dc = &mut user.downstreams[dc_idx];

    match msg.param(0) {
        Some("LS") => {
            let caps = SUPPORTED_CAPS.join(" ");
            dc.send(Message::new(
                "CAP",
                [nick.as_str(), "LS", caps.as_str()],
            ));
        }
        Some("LIST") => {
            let enabled = dc.caps.iter().map(String::as_str).collect::<Vec<_>>().join(" ");
            dc.send(Message::new(
                "CAP",
                [nick.as_str(), "LIST", enabled.as_str()],
            ));
        }
        Some("REQ") => {
            let req = msg.params.last().map(String::as_str).unwrap_or_default();
            let supported = req
                .split_whitespace()
                .all(|cap| SUPPORTED_CAPS.contains(&cap.trim_start_matches('-')));
            if supported {
                for cap in req.split_whitespace() {
                    match cap.strip_prefix('-') {
                        Some(cap) => {
                            dc.caps.remove(cap);
                        }
                        None => {
                            dc.caps.insert(cap.to_owned());
                        }
                    }
                }
                dc.send(Message::new("CAP", [nick.as_str(), "ACK", req]));
            } else {
                dc.send(Message::new("CAP", [nick.as_str(), "NAK", req]));
            }
        }
        Some("END") => {}
        _ => {
            return Err(HandlerError::Irc(Message::new(
                "410",
                [nick.as_str(), "Invalid CAP command"],
            )));
        }
    }
    Ok(())
}

/// Bare session state for unit tests elsewhere in the crate; its channels
/// lead nowhere.
#[cfg(test)]
pub(crate) fn test_downstream(id: u64, network_id: Option<i64>, is_multi_upstream: bool) -> Downstream {
    let (out, _) = mpsc::unbounded_channel();
    let (stop, _) = watch::channel(false);
    Downstream {
        id,
        nick: format!("nick{id}"),
        username: "alice".to_owned(),
        realname: String::new(),
        client_name: "default".to_owned(),
        network_name: None,
        network_id,
        is_multi_upstream,
        caps: HashSet::new(),
        cap_version: 301,
        monitored: CaseMap::default(),
        away: None,
        out,
        stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_splitting() {
        assert_eq!(
            split_username("alice"),
            ("alice".to_owned(), None, "default".to_owned())
        );
        assert_eq!(
            split_username("alice/libera"),
            ("alice".to_owned(), Some("libera".to_owned()), "default".to_owned())
        );
        assert_eq!(
            split_username("alice/libera@phone"),
            ("alice".to_owned(), Some("libera".to_owned()), "phone".to_owned())
        );
        assert_eq!(
            split_username("alice@phone"),
            ("alice".to_owned(), None, "phone".to_owned())
        );
    }
}
