//! One logical upstream network: configuration record, runtime connection
//! state, channel set, delivery checkpoints, and the reconnect loop.
//!
//! The reconnect loop runs as its own task and only ever talks to the rest
//! of the system by posting events; all `Network` state here is owned by
//! the user dispatcher.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use pontoon_proto::{CaseMap, Casemapping, Message, Prefix};

use crate::backoff::Backoff;
use crate::config::ConfigHandle;
use crate::db::{ChannelRecord, Database, DeliveryReceipt, NetworkRecord, RelayPolicy};
use crate::delivered::DeliveredStore;
use crate::downstream::{send_target_backlog, Downstream};
use crate::ident::{user_ident, IdentStore};
use crate::push::{PushError, PushSender};
use crate::server::{Metrics, REGISTRATION_TIMEOUT};
use crate::store::MessageStore;
use crate::upstream::{self, Upstream};
use crate::user::{Event, EventSender};

pub struct Network {
    pub record: NetworkRecord,
    pub channels: CaseMap<ChannelRecord>,
    pub delivered: DeliveredStore,
    /// The live upstream connection, if any. At most one exists at a time.
    pub conn: Option<Upstream>,
    /// Last connection error text, for de-duplicating notices.
    pub last_error: Option<String>,
    pub casemap: Casemapping,
    stop: watch::Sender<bool>,
}

impl Network {
    pub fn new(record: NetworkRecord, channels: Vec<ChannelRecord>) -> Self {
        let casemap = Casemapping::default();
        let mut channel_map = CaseMap::new(casemap);
        for ch in channels {
            channel_map.insert(ch.name.clone(), ch);
        }
        let (stop, _) = watch::channel(false);
        Network {
            record,
            channels: channel_map,
            delivered: DeliveredStore::new(casemap),
            conn: None,
            last_error: None,
            casemap,
            stop,
        }
    }

    pub fn get_name(&self) -> &str {
        self.record.get_name()
    }

    /// Once stopped, a network never starts a new upstream connection.
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Stop the reconnect loop and close the live connection, if any.
    /// Idempotent; the transition is one-way.
    pub fn stop(&mut self) {
        let _ = self.stop.send(true);
        if let Some(uc) = &self.conn {
            uc.close();
        }
    }

    /// Whether a downstream sees this network: bound to it, or unbound and
    /// multi-upstream.
    pub fn is_applicable(&self, dc: &Downstream) -> bool {
        match dc.network_id {
            Some(id) => id == self.record.id,
            None => dc.is_multi_upstream,
        }
    }

    pub fn applicable_downstreams<'a>(
        &'a self,
        downstreams: &'a [Downstream],
    ) -> impl Iterator<Item = &'a Downstream> + 'a {
        downstreams.iter().filter(move |dc| self.is_applicable(dc))
    }

    /// Hide a channel from attached clients while staying joined upstream.
    pub async fn detach(
        &mut self,
        name: &str,
        downstreams: &[Downstream],
        msg_store: &dyn MessageStore,
        hostname: &str,
        events: &EventSender,
    ) {
        let folded = self.casemap.fold(name);
        {
            let Some(ch) = self.channels.get_mut(name) else {
                return;
            };
            if ch.detached {
                return;
            }
            info!(channel = %ch.name, network = %self.record.get_name(), "detaching channel");
            ch.detached = true;

            if msg_store.is_persistent() {
                // Remember where we were, so re-attaching can replay what
                // was missed. Failure only impairs the later replay.
                match msg_store.last_msg_id(&self.record, &folded, Utc::now()).await {
                    Ok(id) => ch.detached_internal_msg_id = id,
                    Err(err) => {
                        warn!(channel = %ch.name, error = %err, "failed to get last message ID")
                    }
                }
            }
        }

        let net_id = self.record.id;
        if let Some(uc) = &mut self.conn {
            let seq = uc.seq;
            if let Some(uch) = uc.channels.get_mut(name) {
                uch.update_auto_detach(Duration::ZERO, events, net_id, seq);
            }
        }

        for dc in self.applicable_downstreams(downstreams) {
            dc.send(
                Message::new("PART", [dc.marshal_entity(self, name).as_str(), "Detach"])
                    .with_prefix(dc.prefix(hostname)),
            );
        }
    }

    /// Reveal a detached channel again, replaying missed history.
    pub async fn attach(
        &mut self,
        name: &str,
        downstreams: &[Downstream],
        msg_store: &dyn MessageStore,
        hostname: &str,
        events: &EventSender,
    ) {
        let (detached_msg_id, detach_after) = {
            let Some(ch) = self.channels.get_mut(name) else {
                return;
            };
            if !ch.detached {
                return;
            }
            info!(channel = %ch.name, network = %self.record.get_name(), "attaching channel");
            ch.detached = false;
            (ch.detached_internal_msg_id.take(), ch.detach_after)
        };

        let net_id = self.record.id;
        if let Some(uc) = &mut self.conn {
            let seq = uc.seq;
            if let Some(uch) = uc.channels.get_mut(name) {
                uch.update_auto_detach(detach_after, events, net_id, seq);
            }
        }

        let applicable: Vec<usize> = downstreams
            .iter()
            .enumerate()
            .filter(|(_, dc)| self.is_applicable(dc))
            .map(|(i, _)| i)
            .collect();

        for &i in &applicable {
            let dc = &downstreams[i];
            dc.send(
                Message::new("JOIN", [dc.marshal_entity(self, name).as_str()])
                    .with_prefix(dc.prefix(hostname)),
            );
            if let Some(uch) = self.conn.as_ref().and_then(|uc| uc.channels.get(name)) {
                crate::downstream::forward_channel(dc, self, uch, hostname);
            }
        }

        if let Some(after_id) = detached_msg_id {
            for &i in &applicable {
                send_target_backlog(self, &downstreams[i], msg_store, name, &after_id).await;
            }
        }
    }

    /// Remove a channel from the bouncer entirely.
    pub async fn delete_channel(
        &mut self,
        db: &Database,
        name: &str,
        events: &EventSender,
    ) -> Result<(), crate::error::Error> {
        let Some(ch) = self.channels.get(name) else {
            return Err(crate::error::Error::Internal(format!(
                "unknown channel {name:?}"
            )));
        };
        let ch_id = ch.id;

        let net_id = self.record.id;
        if let Some(uc) = &mut self.conn {
            let seq = uc.seq;
            if let Some(uch) = uc.channels.get_mut(name) {
                uch.update_auto_detach(Duration::ZERO, events, net_id, seq);
            }
        }

        db.delete_channel(ch_id).await?;
        self.channels.remove(name);
        Ok(())
    }

    /// Apply a new casemapping to every derived map at once.
    pub fn update_casemapping(&mut self, casemap: Casemapping, downstreams: &mut [Downstream]) {
        self.casemap = casemap;
        self.channels.set_casemapping(casemap);
        self.delivered.set_casemapping(casemap);
        if let Some(uc) = &mut self.conn {
            uc.channels.set_casemapping(casemap);
            for (_, uch) in uc.channels.iter_mut() {
                uch.members.set_casemapping(casemap);
            }
            uc.monitored.set_casemapping(casemap);
        }
        for dc in downstreams.iter_mut() {
            if self.is_applicable(dc) {
                dc.monitored.set_casemapping(casemap);
            }
        }
    }

    /// Persist the delivery checkpoints of one client.
    pub async fn store_client_delivery_receipts(
        &self,
        db: &Database,
        client: &str,
        persistent: bool,
    ) {
        if !persistent || client.is_empty() {
            return;
        }

        let mut receipts = Vec::new();
        for target in self.delivered.targets() {
            if let Some(msg_id) = self.delivered.load_id(target, client) {
                receipts.push(DeliveryReceipt {
                    target: target.to_owned(),
                    client: client.to_owned(),
                    internal_msg_id: msg_id.to_owned(),
                });
            }
        }

        if let Err(err) = db
            .store_client_delivery_receipts(self.record.id, client, &receipts)
            .await
        {
            warn!(network = %self.get_name(), client = %client, error = %err,
                  "failed to store delivery receipts");
        }
    }

    /// Whether a message mentions the user by nick, preferring the live
    /// upstream nick.
    pub fn is_highlight(&self, msg: &Message) -> bool {
        if msg.command != "PRIVMSG" && msg.command != "NOTICE" {
            return false;
        }
        let Some(text) = msg.param(1) else {
            return false;
        };

        let nick = self
            .conn
            .as_ref()
            .map(|uc| uc.nick.as_str())
            .unwrap_or(self.record.nick.as_str());
        if nick.is_empty() {
            return false;
        }

        let sender = msg.prefix.as_ref().map(Prefix::name).unwrap_or_default();
        !self.casemap.eq(sender, nick) && is_highlight_text(text, nick)
    }

    /// Whether a message on a detached channel still reaches clients.
    pub fn detached_message_needs_relay(&self, ch: &ChannelRecord, msg: &Message) -> bool {
        let highlight = self.is_highlight(msg);
        ch.relay_detached == RelayPolicy::Message
            || ((ch.relay_detached == RelayPolicy::Highlight
                || ch.relay_detached == RelayPolicy::Default)
                && highlight)
    }

    /// Persist working SASL PLAIN credentials after a successful login.
    /// Never overwrites EXTERNAL or other non-PLAIN configurations.
    pub async fn auto_save_sasl_plain(
        &mut self,
        db: &Database,
        user_id: i64,
        username: String,
        password: String,
    ) {
        if !self.record.sasl.mechanism.is_empty() && self.record.sasl.mechanism != "PLAIN" {
            return;
        }

        info!(network = %self.get_name(), username = %username,
              "auto-saving SASL PLAIN credentials");
        self.record.sasl.mechanism = "PLAIN".to_owned();
        self.record.sasl.plain_username = username;
        self.record.sasl.plain_password = password;
        if let Err(err) = db.store_network(user_id, &mut self.record).await {
            warn!(network = %self.get_name(), error = %err,
                  "failed to save SASL PLAIN credentials");
        }
    }

    /// Fan a notification-worthy message out to this network's push
    /// subscriptions.
    pub async fn broadcast_web_push(&self, db: &Database, push: &dyn PushSender, msg: &Message) {
        let subs = match db.list_webpush_subscriptions(self.record.id).await {
            Ok(subs) => subs,
            Err(err) => {
                warn!(network = %self.get_name(), error = %err,
                      "failed to list push subscriptions");
                return;
            }
        };

        for sub in subs {
            match push.send(&sub, msg).await {
                Ok(()) => {}
                Err(PushError::SubscriptionExpired) => {
                    if let Err(err) = db.delete_webpush_subscription(sub.id).await {
                        warn!(error = %err, "failed to delete expired push subscription");
                    }
                }
                Err(err) => {
                    warn!(endpoint = %sub.endpoint, error = %err,
                          "failed to send push notification");
                }
            }
        }
    }
}

/// Word-boundary nick mention test, folded to ASCII case.
fn is_highlight_text(text: &str, nick: &str) -> bool {
    let text_lower = text.to_ascii_lowercase();
    let nick_lower = nick.to_ascii_lowercase();

    let mut start = 0;
    while let Some(pos) = text_lower[start..].find(&nick_lower) {
        let begin = start + pos;
        let end = begin + nick_lower.len();
        let left_ok = begin == 0
            || !text_lower[..begin]
                .chars()
                .next_back()
                .is_some_and(char::is_alphanumeric);
        let right_ok = end == text_lower.len()
            || !text_lower[end..].chars().next().is_some_and(char::is_alphanumeric);
        if left_ok && right_ok {
            return true;
        }
        // Skip one character, not one byte; nicks are not ASCII-only.
        start = begin
            + text_lower[begin..]
                .chars()
                .next()
                .map_or(1, char::len_utf8);
    }
    false
}

// ============================================================================
// Reconnect loop
// ============================================================================

/// Everything the reconnect task needs, snapshotted at spawn time.
pub(crate) struct RunParams {
    pub record: NetworkRecord,
    pub user_id: i64,
    pub default_nick: String,
    pub default_realname: String,
    pub events: EventSender,
    pub stopped: watch::Receiver<bool>,
    pub config: ConfigHandle,
    pub metrics: Arc<Metrics>,
    pub identd: Option<Arc<IdentStore>>,
}

/// Drive one network's connection lifecycle:
/// wait → connect → register → pump → reconnect, with bounded backoff.
///
/// Terminates when the network is disabled, stopped, or registration fails
/// permanently.
pub(crate) async fn run(mut params: RunParams) {
    if !params.record.enabled {
        return;
    }

    let net_id = params.record.id;
    let name = params.record.get_name().to_owned();
    let retry = params.config.get().retry;
    let mut backoff = Backoff::new(retry.min, retry.max, retry.jitter);
    let mut last_try: Option<Instant> = None;

    loop {
        if *params.stopped.borrow() {
            return;
        }

        let since_last = last_try
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        let delay = backoff.next().saturating_sub(since_last);
        if !delay.is_zero() {
            debug!(network = %name, delay = ?delay, "waiting before reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = params.stopped.changed() => {
                    // A dropped sender means the network is gone.
                    if changed.is_err() || *params.stopped.borrow() {
                        return;
                    }
                }
            }
            if *params.stopped.borrow() {
                return;
            }
        }
        last_try = Some(Instant::now());

        params.metrics.upstreams_inc();

        let local_addr = local_addr_for_record(&params).await;
        let dialed = match upstream::connect_to_upstream(&params.record, local_addr).await {
            Ok(dialed) => dialed,
            Err(err) => {
                warn!(network = %name, error = %err, "failed to connect to upstream");
                params.metrics.upstreams_dec();
                params.metrics.connect_errors_inc();
                if post(
                    &params.events,
                    Event::UpstreamConnectionError {
                        net_id,
                        err: format!("failed to connect: {err}"),
                    },
                )
                .await
                .is_err()
                {
                    return;
                }
                continue;
            }
        };

        let ident = user_ident(params.user_id);
        let endpoints = (dialed.remote_addr.clone(), dialed.local_addr.clone());
        if let (Some(identd), (Some(remote), Some(local))) = (&params.identd, &endpoints) {
            identd.store(remote.clone(), local.clone(), ident.clone());
        }

        let framed = tokio_util::codec::Framed::new(dialed.stream, upstream::line_codec());
        let registered = timeout(
            REGISTRATION_TIMEOUT,
            upstream::register(
                framed,
                &params.record,
                net_id,
                &params.default_nick,
                &params.default_realname,
                &ident,
                dialed.local_addr,
                dialed.remote_addr,
            ),
        )
        .await
        .unwrap_or_else(|_| {
            Err(crate::error::RegistrationError::temporary(
                "registration timed out",
            ))
        });

        match registered {
            Err(err) => {
                warn!(network = %name, error = %err.reason, "failed to register");
                delete_identd(&params, &endpoints);
                params.metrics.upstreams_dec();
                params.metrics.connect_errors_inc();
                if post(
                    &params.events,
                    Event::UpstreamConnectionError {
                        net_id,
                        err: format!("failed to register: {}", err.reason),
                    },
                )
                .await
                .is_err()
                {
                    return;
                }
                if !err.temporary {
                    return;
                }
                continue;
            }
            Ok(registered) => {
                let seq = registered.upstream.seq;
                if post(
                    &params.events,
                    Event::UpstreamConnected {
                        upstream: Box::new(registered.upstream),
                        sasl_plain: registered.sasl_plain,
                    },
                )
                .await
                .is_err()
                {
                    return;
                }

                if let Err(err) = upstream::read_messages(
                    registered.read_half,
                    &params.events,
                    registered.closed,
                    net_id,
                    seq,
                )
                .await
                {
                    warn!(network = %name, error = %err, "failed to handle messages");
                    let _ = post(
                        &params.events,
                        Event::UpstreamError {
                            net_id,
                            seq,
                            err: format!("failed to handle messages: {err}"),
                        },
                    )
                    .await;
                }

                let disconnected = post(
                    &params.events,
                    Event::UpstreamDisconnected { net_id, seq },
                )
                .await;
                delete_identd(&params, &endpoints);
                params.metrics.upstreams_dec();
                if disconnected.is_err() {
                    return;
                }
                backoff.reset();
            }
        }
    }
}

async fn post(events: &EventSender, event: Event) -> Result<(), ()> {
    events.send(event).await.map_err(|_| ())
}

fn delete_identd(params: &RunParams, endpoints: &(Option<String>, Option<String>)) {
    if let (Some(identd), (Some(remote), Some(local))) = (&params.identd, endpoints) {
        identd.delete(remote, local);
    }
}

async fn local_addr_for_record(params: &RunParams) -> Option<std::net::IpAddr> {
    let config = params.config.get();
    if config.upstream_user_ips.is_empty() {
        return None;
    }
    let host = params.record.url().ok()?.host_str()?.to_owned();
    match crate::user::local_tcp_addr_for_host(&config, params.user_id, &host).await {
        Ok(addr) => addr,
        Err(err) => {
            warn!(network = %params.record.get_name(), error = %err,
                  "failed to pick egress address");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_network() -> Network {
        Network::new(
            NetworkRecord {
                id: 7,
                name: "libera".to_owned(),
                addr: "ircs://irc.libera.chat".to_owned(),
                nick: "ada".to_owned(),
                ..NetworkRecord::default()
            },
            vec![
                ChannelRecord {
                    id: 1,
                    name: "#Foo".to_owned(),
                    ..ChannelRecord::default()
                },
                ChannelRecord {
                    id: 2,
                    name: "#BAR".to_owned(),
                    ..ChannelRecord::default()
                },
            ],
        )
    }

    fn privmsg(from: &str, target: &str, text: &str) -> Message {
        Message::new("PRIVMSG", [target, text]).with_prefix(Prefix::new(from, "u", "h"))
    }

    #[test]
    fn highlight_requires_word_boundary() {
        let net = test_network();
        assert!(net.is_highlight(&privmsg("bob", "#foo", "hey ada, ping")));
        assert!(net.is_highlight(&privmsg("bob", "#foo", "ADA: hi")));
        assert!(!net.is_highlight(&privmsg("bob", "#foo", "ciudadano reporting")));
        assert!(!net.is_highlight(&privmsg("bob", "#foo", "nothing here")));
    }

    #[test]
    fn own_messages_never_highlight() {
        let net = test_network();
        assert!(!net.is_highlight(&privmsg("ada", "#foo", "ada: talking to myself")));
    }

    #[test]
    fn highlight_scan_survives_multibyte_nicks() {
        let mut net = test_network();
        net.record.nick = "ädä".to_owned();
        // A rejected candidate match must advance on a char boundary, not
        // panic mid-character.
        assert!(!net.is_highlight(&privmsg("bob", "#foo", "xädäx then ädäx again")));
        assert!(net.is_highlight(&privmsg("bob", "#foo", "xädäx ädä: hello")));
        assert!(!net.is_highlight(&privmsg("bob", "#foo", "no mention at all")));
    }

    #[test]
    fn detached_relay_policy_matrix() {
        let net = test_network();
        let mut ch = ChannelRecord {
            name: "#foo".to_owned(),
            detached: true,
            ..ChannelRecord::default()
        };
        let plain = privmsg("bob", "#foo", "hello world");
        let mention = privmsg("bob", "#foo", "ada: hello");

        ch.relay_detached = RelayPolicy::Message;
        assert!(net.detached_message_needs_relay(&ch, &plain));

        ch.relay_detached = RelayPolicy::Highlight;
        assert!(!net.detached_message_needs_relay(&ch, &plain));
        assert!(net.detached_message_needs_relay(&ch, &mention));

        ch.relay_detached = RelayPolicy::Default;
        assert!(!net.detached_message_needs_relay(&ch, &plain));
        assert!(net.detached_message_needs_relay(&ch, &mention));

        ch.relay_detached = RelayPolicy::None;
        assert!(!net.detached_message_needs_relay(&ch, &plain));
        assert!(!net.detached_message_needs_relay(&ch, &mention));
    }

    #[test]
    fn casemapping_switch_preserves_channels_and_receipts() {
        let mut net = test_network();
        net.update_casemapping(Casemapping::Ascii, &mut []);
        net.channels.insert(
            "#Ops[1]".to_owned(),
            ChannelRecord {
                id: 3,
                name: "#Ops[1]".to_owned(),
                ..ChannelRecord::default()
            },
        );
        net.delivered.store_id("#Ops[1]", "laptop", "m1");
        assert!(net.channels.get("#ops{1}").is_none());

        net.update_casemapping(Casemapping::Rfc1459, &mut []);
        assert!(net.channels.get("#ops{1}").is_some());
        assert!(net.channels.get("#foo").is_some());
        assert!(net.channels.get("#bar").is_some());
        assert_eq!(net.delivered.load_id("#OPS{1}", "laptop"), Some("m1"));

        // Iteration still yields the original spellings.
        let mut names: Vec<&str> = net.channels.keys().collect();
        names.sort_unstable();
        assert_eq!(names, vec!["#BAR", "#Foo", "#Ops[1]"]);
        assert_eq!(net.delivered.targets().collect::<Vec<_>>(), vec!["#Ops[1]"]);
    }

    #[test]
    fn stop_is_one_way() {
        let mut net = test_network();
        assert!(!net.is_stopped());
        net.stop();
        assert!(net.is_stopped());
        net.stop();
        assert!(net.is_stopped());
    }

    #[tokio::test]
    async fn detach_and_attach_are_idempotent() {
        let mut net = test_network();
        let store = crate::store::MemoryMessageStore;
        let (events, _events_rx) = tokio::sync::mpsc::channel(4);

        net.detach("#foo", &[], &store, "localhost", &events).await;
        assert!(net.channels.get("#foo").is_some_and(|ch| ch.detached));
        net.detach("#foo", &[], &store, "localhost", &events).await;
        assert!(net.channels.get("#foo").is_some_and(|ch| ch.detached));

        net.attach("#foo", &[], &store, "localhost", &events).await;
        assert!(net.channels.get("#foo").is_some_and(|ch| !ch.detached));
        net.attach("#foo", &[], &store, "localhost", &events).await;
        assert!(net.channels.get("#foo").is_some_and(|ch| !ch.detached));
    }

    #[test]
    fn applicable_downstream_predicate() {
        let net = test_network();
        let bound = crate::downstream::test_downstream(1, Some(7), false);
        let other = crate::downstream::test_downstream(2, Some(8), false);
        let multi = crate::downstream::test_downstream(3, None, true);
        let single_unbound = crate::downstream::test_downstream(4, None, false);

        assert!(net.is_applicable(&bound));
        assert!(!net.is_applicable(&other));
        assert!(net.is_applicable(&multi));
        assert!(!net.is_applicable(&single_unbound));

        let downstreams = vec![bound, other, multi, single_unbound];
        let ids: Vec<u64> = net
            .applicable_downstreams(&downstreams)
            .map(|dc| dc.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
