//! The per-user actor.
//!
//! One task per user drains one bounded event queue; that task is the sole
//! mutator of the user's networks, downstream sessions, per-network runtime
//! state and of any persistent write touching them. Transport readers and
//! reconnect loops communicate with it exclusively by posting [`Event`]s.
//! A full queue back-pressures the transport readers, which in turn applies
//! TCP back-pressure to peers.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use pontoon_proto::{escape_tag_value, Message, Prefix};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigHandle};
use crate::db::{self, ChannelRecord, Database, NetworkRecord, UserRecord};
use crate::downstream::{self, Downstream};
use crate::error::{Error, HandlerError, NetworkCheckError};
use crate::ident::IdentStore;
use crate::network::{self, Network};
use crate::push::PushSender;
use crate::server::{Metrics, HANDLE_DOWNSTREAM_TIMEOUT};
use crate::store::{FsMessageStore, MemoryMessageStore, MessageStore};
use crate::upstream::{self, Upstream};

/// Capacity of the per-user event queue. Writers block when it is full;
/// that is the intended flow control.
pub const EVENT_QUEUE_CAPACITY: usize = 64;

pub type EventSender = mpsc::Sender<Event>;

/// Everything that can happen to a user, serialized through one queue.
pub enum Event {
    /// A registered upstream connection is handed to the dispatcher.
    UpstreamConnected {
        upstream: Box<Upstream>,
        /// SASL PLAIN credentials the server accepted during registration.
        sasl_plain: Option<(String, String)>,
    },
    UpstreamDisconnected {
        net_id: i64,
        seq: u64,
    },
    UpstreamConnectionError {
        net_id: i64,
        err: String,
    },
    UpstreamError {
        net_id: i64,
        seq: u64,
        err: String,
    },
    UpstreamMessage {
        net_id: i64,
        seq: u64,
        msg: Message,
    },
    /// An upstream channel's inactivity timer fired.
    ChannelDetach {
        net_id: i64,
        seq: u64,
        name: String,
    },
    DownstreamConnected {
        downstream: Box<Downstream>,
    },
    DownstreamDisconnected {
        id: u64,
    },
    DownstreamMessage {
        id: u64,
        msg: Message,
    },
    /// Send a message to every downstream.
    Broadcast {
        msg: Message,
    },
    /// Patch the user record; `password` is the new plain-text password.
    UserUpdate {
        password: Option<String>,
        admin: Option<bool>,
        done: oneshot::Sender<Result<(), Error>>,
    },
    Stop,
}

enum Flow {
    Continue,
    Stop,
}

pub struct User {
    pub(crate) record: UserRecord,
    pub(crate) config: ConfigHandle,
    pub(crate) db: Database,
    pub(crate) msg_store: Arc<dyn MessageStore>,
    pub(crate) push: Arc<dyn PushSender>,
    pub(crate) identd: Option<Arc<IdentStore>>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) networks: Vec<Network>,
    pub(crate) downstreams: Vec<Downstream>,
    events_tx: EventSender,
    events_rx: mpsc::Receiver<Event>,
}

impl User {
    pub fn new(
        record: UserRecord,
        config: ConfigHandle,
        db: Database,
        metrics: Arc<Metrics>,
        push: Arc<dyn PushSender>,
        identd: Option<Arc<IdentStore>>,
    ) -> Self {
        let msg_store: Arc<dyn MessageStore> = match &config.get().log_path {
            Some(path) => Arc::new(FsMessageStore::new(path.clone(), &record.username)),
            None => Arc::new(MemoryMessageStore),
        };
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        User {
            record,
            config,
            db,
            msg_store,
            push,
            identd,
            metrics,
            networks: Vec::new(),
            downstreams: Vec::new(),
            events_tx,
            events_rx,
        }
    }

    /// Handle used by transports and the server to post events.
    pub fn events(&self) -> EventSender {
        self.events_tx.clone()
    }

    pub(crate) fn network_and_downstreams(
        &mut self,
        idx: usize,
    ) -> (&mut Network, &mut [Downstream]) {
        (&mut self.networks[idx], &mut self.downstreams)
    }

    fn network_idx_by_id(&self, id: i64) -> Option<usize> {
        self.networks.iter().position(|net| net.record.id == id)
    }

    pub(crate) fn network_idx_by_name(&self, name: &str) -> Option<usize> {
        self.networks
            .iter()
            .position(|net| net.record.addr == name || net.get_name() == name)
    }

    /// Indices of the networks a downstream sees.
    pub(crate) fn visible_network_indices(&self, dc: &Downstream) -> Vec<usize> {
        match dc.network_id {
            Some(id) => self.network_idx_by_id(id).into_iter().collect(),
            None if dc.is_multi_upstream => (0..self.networks.len()).collect(),
            None => Vec::new(),
        }
    }

    fn server_prefix(&self) -> Prefix {
        Prefix::ServerName(self.config.get().hostname.clone())
    }

    fn service_prefix(&self) -> Prefix {
        Prefix::new(
            crate::service::SERVICE_NICK,
            "bouncer",
            self.config.get().hostname.clone(),
        )
    }

    /// Human-readable notice from the bouncer's service user.
    pub(crate) fn send_service_notice(&self, dc: &Downstream, text: &str) {
        dc.send(
            Message::new("NOTICE", [dc.nick.as_str(), text]).with_prefix(self.service_prefix()),
        );
    }

    /// `BOUNCER NETWORK <id> <attrs>` to every downstream that negotiated
    /// state notifications.
    pub(crate) fn broadcast_bouncer_network(&self, net_id: i64, attrs: &str) {
        let id = net_id.to_string();
        for dc in &self.downstreams {
            if dc.has_cap("soju.im/bouncer-networks-notify") {
                dc.send(
                    Message::new("BOUNCER", ["NETWORK", id.as_str(), attrs])
                        .with_prefix(self.server_prefix()),
                );
            }
        }
    }

    /// Run the dispatcher until a Stop event.
    pub async fn run(mut self) {
        info!(user = %self.record.username, "starting user dispatcher");

        if let Err(err) = self.load_networks().await {
            error!(user = %self.record.username, error = %err, "failed to load networks");
        } else {
            while let Some(event) = self.events_rx.recv().await {
                match self.handle_event(event).await {
                    Flow::Continue => {}
                    Flow::Stop => break,
                }
            }
        }

        if let Err(err) = self.msg_store.close().await {
            warn!(user = %self.record.username, error = %err, "failed to close message store");
        }
        info!(user = %self.record.username, "user dispatcher stopped");
    }

    async fn load_networks(&mut self) -> Result<(), Error> {
        // list_networks orders by id, which also fixes the list order here.
        let records = self.db.list_networks(self.record.id).await?;
        for record in records {
            let channels = match self.db.list_channels(record.id).await {
                Ok(channels) => channels,
                Err(err) => {
                    warn!(network = %record.get_name(), error = %err,
                          "failed to list channels");
                    continue;
                }
            };

            let mut network = Network::new(record, channels);

            if self.msg_store.is_persistent() {
                let receipts = self.db.list_delivery_receipts(network.record.id).await?;
                for receipt in receipts {
                    network.delivered.store_id(
                        receipt.target,
                        receipt.client,
                        receipt.internal_msg_id,
                    );
                }
            }

            self.add_network(network);
        }
        Ok(())
    }

    /// Append a network (keeping the list ordered by id) and spawn its
    /// reconnect loop.
    fn add_network(&mut self, network: Network) {
        let params = network::RunParams {
            record: network.record.clone(),
            user_id: self.record.id,
            default_nick: self.record.username.clone(),
            default_realname: if self.record.realname.is_empty() {
                self.record.username.clone()
            } else {
                self.record.realname.clone()
            },
            events: self.events_tx.clone(),
            stopped: network.stop_signal(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            identd: self.identd.clone(),
        };
        self.networks.push(network);
        self.networks.sort_by_key(|net| net.record.id);
        tokio::spawn(network::run(params));
    }

    /// Stop a network, close downstreams bound to it and excise it.
    fn remove_network(&mut self, idx: usize) -> Network {
        let mut network = self.networks.remove(idx);
        network.stop();
        for dc in &self.downstreams {
            if dc.network_id == Some(network.record.id) {
                dc.close();
            }
        }
        network
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::UpstreamConnected {
                upstream,
                sasl_plain,
            } => {
                self.handle_upstream_connected(*upstream, sasl_plain).await;
            }
            Event::UpstreamDisconnected { net_id, seq } => {
                // If the network was removed in the meantime, its state
                // (and timers) died with it.
                let Some(idx) = self.network_idx_by_id(net_id) else {
                    return Flow::Continue;
                };
                let matches = self.networks[idx]
                    .conn
                    .as_ref()
                    .is_some_and(|uc| uc.seq == seq);
                if !matches {
                    return Flow::Continue;
                }
                if let Some(uc) = self.networks[idx].conn.take() {
                    self.handle_upstream_disconnected(idx, uc);
                }
            }
            Event::UpstreamConnectionError { net_id, err } => {
                let Some(idx) = self.network_idx_by_id(net_id) else {
                    return Flow::Continue;
                };

                let stopped = self.networks[idx].is_stopped();
                let repeated = self.networks[idx].last_error.as_deref() == Some(err.as_str());
                if !stopped && !repeated {
                    let name = self.networks[idx].get_name().to_owned();
                    for dc in self.networks[idx].applicable_downstreams(&self.downstreams) {
                        self.send_service_notice(
                            dc,
                            &format!("failed connecting/registering to {name}: {err}"),
                        );
                    }
                }
                self.networks[idx].last_error = Some(err.clone());
                self.broadcast_bouncer_network(net_id, &encode_attrs(&[("error", &err)]));
            }
            Event::UpstreamError { net_id, seq: _, err } => {
                let Some(idx) = self.network_idx_by_id(net_id) else {
                    return Flow::Continue;
                };

                // The upstream was previously up, so this always surfaces.
                let name = self.networks[idx].get_name().to_owned();
                for dc in self.networks[idx].applicable_downstreams(&self.downstreams) {
                    self.send_service_notice(dc, &format!("disconnected from {name}: {err}"));
                }
                self.networks[idx].last_error = Some(err.clone());
                self.broadcast_bouncer_network(net_id, &encode_attrs(&[("error", &err)]));
            }
            Event::UpstreamMessage { net_id, seq, msg } => {
                let Some(idx) = self.network_idx_by_id(net_id) else {
                    return Flow::Continue;
                };
                let live = self.networks[idx]
                    .conn
                    .as_ref()
                    .is_some_and(|uc| uc.seq == seq && !uc.is_closed());
                if !live {
                    debug!(network_id = net_id, command = %msg.command,
                           "ignoring message on closed connection");
                    return Flow::Continue;
                }
                if let Err(err) = upstream::handle_message(self, idx, msg).await {
                    warn!(network_id = net_id, error = %err,
                          "failed to handle upstream message");
                }
            }
            Event::ChannelDetach { net_id, seq, name } => {
                let Some(idx) = self.network_idx_by_id(net_id) else {
                    return Flow::Continue;
                };
                let live = self.networks[idx]
                    .conn
                    .as_ref()
                    .is_some_and(|uc| uc.seq == seq);
                if !live {
                    return Flow::Continue;
                }
                let already = self.networks[idx]
                    .channels
                    .get(&name)
                    .map(|ch| ch.detached)
                    .unwrap_or(true);
                if already {
                    return Flow::Continue;
                }

                let store = self.msg_store.clone();
                let hostname = self.config.get().hostname.clone();
                let events = self.events_tx.clone();
                self.networks[idx]
                    .detach(&name, &self.downstreams, store.as_ref(), &hostname, &events)
                    .await;

                let updated = self.networks[idx].channels.get(&name).cloned();
                if let Some(mut ch) = updated {
                    if let Err(err) = self.db.store_channel(net_id, &mut ch).await {
                        warn!(channel = %ch.name, error = %err,
                              "failed to store detached channel");
                    }
                }
            }
            Event::DownstreamConnected { downstream } => {
                self.handle_downstream_connected(*downstream).await;
            }
            Event::DownstreamDisconnected { id } => {
                self.handle_downstream_disconnected(id).await;
            }
            Event::DownstreamMessage { id, msg } => {
                let Some(idx) = self.downstreams.iter().position(|dc| dc.id == id) else {
                    debug!(downstream_id = id, "ignoring message on closed connection");
                    return Flow::Continue;
                };
                if self.downstreams[idx].is_closed() {
                    debug!(downstream_id = id, "ignoring message on closed connection");
                    return Flow::Continue;
                }

                let result = match timeout(
                    HANDLE_DOWNSTREAM_TIMEOUT,
                    downstream::handle_message(self, idx, msg),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(HandlerError::Internal(
                        "downstream command timed out".to_owned(),
                    )),
                };

                match result {
                    Ok(()) => {}
                    Err(HandlerError::Irc(mut reply)) => {
                        reply.prefix = Some(self.server_prefix());
                        if let Some(dc) = self.downstreams.iter().find(|dc| dc.id == id) {
                            dc.send(reply);
                        }
                    }
                    Err(err) => {
                        warn!(downstream_id = id, error = %err,
                              "failed to handle downstream message");
                        if let Some(dc) = self.downstreams.iter().find(|dc| dc.id == id) {
                            dc.close();
                        }
                    }
                }
            }
            Event::Broadcast { msg } => {
                for dc in &self.downstreams {
                    dc.send(msg.clone());
                }
            }
            Event::UserUpdate {
                password,
                admin,
                done,
            } => {
                let mut record = self.record.clone();
                let mut hash_err = None;
                if let Some(password) = &password {
                    match db::hash_password(password) {
                        Ok(hash) => record.password = hash,
                        Err(err) => hash_err = Some(Error::Internal(err.to_string())),
                    }
                }
                if let Some(admin) = admin {
                    record.admin = admin;
                }

                let result = match hash_err {
                    Some(err) => Err(err),
                    None => self.update_user(record).await,
                };
                let _ = done.send(result);

                // Force re-authentication with the new credentials.
                if password.is_some() {
                    for dc in &self.downstreams {
                        dc.close();
                    }
                }
            }
            Event::Stop => {
                for dc in &self.downstreams {
                    dc.close();
                }
                let persistent = self.msg_store.is_persistent();
                for idx in 0..self.networks.len() {
                    self.networks[idx].stop();
                    for client in self.networks[idx].delivered.client_names() {
                        self.networks[idx]
                            .store_client_delivery_receipts(&self.db, &client, persistent)
                            .await;
                    }
                }
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn handle_upstream_connected(
        &mut self,
        upstream: Upstream,
        sasl_plain: Option<(String, String)>,
    ) {
        let net_id = upstream.net_id;

        // A Stop (or network removal) can race the hand-off; the dispatcher
        // owns closing such orphans.
        let Some(idx) = self.network_idx_by_id(net_id) else {
            upstream.close();
            return;
        };
        if self.networks[idx].is_stopped() {
            upstream.close();
            return;
        }

        self.networks[idx].conn = Some(upstream);

        upstream::refresh_away(self, idx);
        upstream::refresh_monitor(self, idx);

        if let Some((username, password)) = sasl_plain {
            let user_id = self.record.id;
            let db = self.db.clone();
            self.networks[idx]
                .auto_save_sasl_plain(&db, user_id, username, password)
                .await;
        }

        let name = self.networks[idx].get_name().to_owned();
        let hostname = self.config.get().hostname.clone();
        for i in 0..self.downstreams.len() {
            if !self.networks[idx].is_applicable(&self.downstreams[i]) {
                continue;
            }
            downstream::update_supported_caps(&mut self.downstreams[i], &self.networks[idx]);
            if !self.downstreams[i].has_cap("soju.im/bouncer-networks") {
                self.send_service_notice(&self.downstreams[i], &format!("connected to {name}"));
            }
            downstream::update_nick(&mut self.downstreams[i], &self.networks[idx], &hostname);
            downstream::update_account(&self.downstreams[i], &self.networks[idx]);
        }

        self.broadcast_bouncer_network(
            net_id,
            &encode_attrs(&[("state", "connected"), ("error", "")]),
        );
        self.networks[idx].last_error = None;
    }

    /// Bookkeeping shared between the disconnect event and the update path
    /// that synthesizes it. `conn` has already been detached from the
    /// network.
    fn handle_upstream_disconnected(&mut self, idx: usize, mut uc: Upstream) {
        uc.close();

        // Pending forwarded commands get their end numerics so clients do
        // not hang.
        for (dc_id, mut end) in uc.abort_pending_commands() {
            if let Some(dc) = self.downstreams.iter().find(|dc| dc.id == dc_id) {
                end.prefix = Some(self.server_prefix());
                if let Some(first) = end.params.first_mut() {
                    *first = dc.nick.clone();
                }
                dc.send(end);
            }
        }

        for i in 0..self.downstreams.len() {
            if self.networks[idx].is_applicable(&self.downstreams[i]) {
                downstream::update_supported_caps(&mut self.downstreams[i], &self.networks[idx]);
            }
        }

        let net_id = self.networks[idx].record.id;
        self.broadcast_bouncer_network(net_id, "state=disconnected");

        if self.networks[idx].last_error.is_none() {
            let name = self.networks[idx].get_name().to_owned();
            for dc in self.networks[idx].applicable_downstreams(&self.downstreams) {
                if !dc.has_cap("soju.im/bouncer-networks") {
                    self.send_service_notice(dc, &format!("disconnected from {name}"));
                }
            }
        }

        // Dropping the connection aborts its auto-detach timers.
        drop(uc);
    }

    async fn handle_downstream_connected(&mut self, mut dc: Downstream) {
        if let Err(err) = downstream::welcome(self, &mut dc).await {
            match err {
                HandlerError::Irc(mut msg) => {
                    msg.prefix = Some(self.server_prefix());
                    warn!(downstream_id = dc.id, error = %msg,
                          "failed to welcome downstream");
                    dc.send(msg);
                }
                err => {
                    warn!(downstream_id = dc.id, error = %err,
                          "failed to welcome downstream");
                    dc.send(Message::new("ERROR", ["Internal server error"]));
                }
            }
            return;
        }

        let network_id = dc.network_id;
        let is_multi = dc.is_multi_upstream;
        let dc_idx = self.downstreams.len();
        self.downstreams.push(dc);

        let visible: Vec<usize> = match network_id {
            Some(id) => self.network_idx_by_id(id).into_iter().collect(),
            None if is_multi => (0..self.networks.len()).collect(),
            None => Vec::new(),
        };
        for idx in visible {
            if let Some(err) = &self.networks[idx].last_error {
                let name = self.networks[idx].get_name();
                let text = format!("disconnected from {name}: {err}");
                self.send_service_notice(&self.downstreams[dc_idx], &text);
            }
        }

        for idx in 0..self.networks.len() {
            upstream::refresh_away(self, idx);
        }
    }

    async fn handle_downstream_disconnected(&mut self, id: u64) {
        let Some(pos) = self.downstreams.iter().position(|dc| dc.id == id) else {
            return;
        };
        let dc = self.downstreams.remove(pos);

        let persistent = self.msg_store.is_persistent();
        let visible = match dc.network_id {
            Some(net_id) => self.network_idx_by_id(net_id).into_iter().collect::<Vec<_>>(),
            None if dc.is_multi_upstream => (0..self.networks.len()).collect(),
            None => Vec::new(),
        };
        for idx in visible {
            self.networks[idx]
                .store_client_delivery_receipts(&self.db, &dc.client_name, persistent)
                .await;
        }

        for idx in 0..self.networks.len() {
            if let Some(uc) = &mut self.networks[idx].conn {
                uc.cancel_pending_commands_by_downstream_id(id);
            }
            upstream::refresh_away(self, idx);
            upstream::refresh_monitor(self, idx);
        }
    }

    // ========================================================================
    // Administrative write paths
    // ========================================================================

    pub(crate) fn check_network(&self, record: &NetworkRecord) -> Result<(), NetworkCheckError> {
        check_network_record(
            record,
            self.networks
                .iter()
                .map(|net| (net.record.id, net.get_name())),
        )
    }

    /// Create a network from a fresh record and start connecting it.
    pub(crate) async fn create_network(&mut self, mut record: NetworkRecord) -> Result<i64, Error> {
        if record.id != 0 {
            return Err(Error::Internal(
                "tried creating an already-existing network".to_owned(),
            ));
        }

        self.check_network(&record)?;

        let max = self.config.get().max_user_networks;
        if max >= 0 && self.networks.len() >= max as usize {
            return Err(NetworkCheckError::TooManyNetworks.into());
        }

        self.db.store_network(self.record.id, &mut record).await?;
        let network = Network::new(record, Vec::new());
        let id = network.record.id;
        let attrs = network_attrs(&network);
        self.add_network(network);

        self.broadcast_bouncer_network(id, &attrs);
        Ok(id)
    }

    /// Update a network in place. Most changes require a reconnect, so the
    /// old connection is torn down and a fresh network (with the old
    /// channel set) takes its place under the same id.
    pub(crate) async fn update_network(&mut self, mut record: NetworkRecord) -> Result<(), Error> {
        if record.id == 0 {
            return Err(Error::Internal("tried updating a new network".to_owned()));
        }

        // A realname equal to the user default means "inherit".
        if record.realname == self.record.realname {
            record.realname = String::new();
        }

        self.check_network(&record)?;

        let Some(idx) = self.network_idx_by_id(record.id) else {
            return Err(Error::Internal(
                "tried updating a non-existing network".to_owned(),
            ));
        };

        self.db.store_network(self.record.id, &mut record).await?;

        let channels: Vec<ChannelRecord> =
            self.networks[idx].channels.values().cloned().collect();
        let updated = Network::new(record, channels);

        // Tear down the live connection with full disconnect bookkeeping.
        self.networks[idx].stop();
        if let Some(uc) = self.networks[idx].conn.take() {
            self.handle_upstream_disconnected(idx, uc);
        }

        // Downstreams are bound by network id, which the fresh network
        // keeps, so they follow it implicitly. The old object must still be
        // excised without the bound-downstream close that removal normally
        // performs.
        let old = self.networks.remove(idx);

        if self.msg_store.is_persistent() && updated.get_name() != old.get_name() {
            if let Err(err) = self
                .msg_store
                .rename_network(&old.record, &updated.record)
                .await
            {
                warn!(old = %old.get_name(), new = %updated.get_name(), error = %err,
                      "failed to rename message store directory");
            }
        }

        let id = updated.record.id;
        let attrs = network_attrs(&updated);
        self.add_network(updated);

        self.broadcast_bouncer_network(id, &attrs);
        Ok(())
    }

    /// Delete a network: storage first, then runtime state, then the gone
    /// sentinel.
    pub(crate) async fn delete_network(&mut self, id: i64) -> Result<(), Error> {
        let Some(idx) = self.network_idx_by_id(id) else {
            return Err(Error::Internal(
                "tried deleting a non-existing network".to_owned(),
            ));
        };

        self.db.delete_network(id).await?;
        self.remove_network(idx);
        self.broadcast_bouncer_network(id, "*");
        Ok(())
    }

    /// Persist an updated user record. A realname change propagates to
    /// networks inheriting the default: via SETNAME where the upstream
    /// supports it, otherwise by reconnecting them.
    pub(crate) async fn update_user(&mut self, mut record: UserRecord) -> Result<(), Error> {
        if record.id != self.record.id {
            return Err(Error::Internal("user ID mismatch".to_owned()));
        }

        let realname_updated = self.record.realname != record.realname;
        self.db.store_user(&mut record).await?;
        self.record = record;

        if realname_updated {
            let mut need_update = Vec::new();
            for net in &self.networks {
                if !net.record.realname.is_empty() {
                    continue;
                }
                if let Some(uc) = &net.conn {
                    if uc.caps.contains("setname") {
                        uc.send(Message::new("SETNAME", [self.record.realname.as_str()]));
                        continue;
                    }
                }
                need_update.push(net.record.clone());
            }

            let mut last_err = None;
            for rec in need_update {
                if let Err(err) = self.update_network(rec).await {
                    last_err = Some(err);
                }
            }
            if let Some(err) = last_err {
                return Err(err);
            }
        }

        Ok(())
    }
}

/// Validate a network record against the URL grammar and the user's
/// existing networks (`existing` yields `(id, name)` pairs).
pub(crate) fn check_network_record<'a>(
    record: &NetworkRecord,
    existing: impl Iterator<Item = (i64, &'a str)>,
) -> Result<(), NetworkCheckError> {
    let url = record
        .url()
        .map_err(|err| NetworkCheckError::InvalidUrl(err.to_string()))?;
    let scheme = url.scheme().to_owned();

    if !url.username().is_empty() || url.password().is_some() {
        return Err(NetworkCheckError::UrlUserinfo(scheme));
    }
    if url.query().is_some() {
        return Err(NetworkCheckError::UrlQuery(scheme));
    }
    if url.fragment().is_some() {
        return Err(NetworkCheckError::UrlFragment(scheme));
    }

    match scheme.as_str() {
        "ircs" | "irc+insecure" => {
            if url.host_str().map_or(true, str::is_empty) {
                return Err(NetworkCheckError::UrlMissingHost(scheme));
            }
            if !url.path().is_empty() {
                return Err(NetworkCheckError::UrlUnexpectedPath(scheme));
            }
        }
        "irc+unix" | "unix" => {
            if url.host_str().is_some_and(|host| !host.is_empty()) {
                return Err(NetworkCheckError::UrlUnexpectedHost(scheme));
            }
            if url.path().is_empty() {
                return Err(NetworkCheckError::UrlMissingPath(scheme));
            }
        }
        _ => return Err(NetworkCheckError::UnknownScheme(scheme)),
    }

    let name = record.get_name();
    if name.is_empty() {
        return Err(NetworkCheckError::EmptyName);
    }
    // A leading dash would be ambiguous with flags in service commands.
    if name.starts_with('-') {
        return Err(NetworkCheckError::DashName);
    }

    for (id, existing_name) in existing {
        if existing_name == name && id != record.id {
            return Err(NetworkCheckError::DuplicateName(name.to_owned()));
        }
    }

    Ok(())
}

/// Encode BOUNCER NETWORK attributes as `key=value` pairs with message-tag
/// escaping.
pub(crate) fn encode_attrs(pairs: &[(&str, &str)]) -> String {
    let mut out = String::new();
    for (i, (key, value)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(key);
        out.push('=');
        escape_tag_value(&mut out, value);
    }
    out
}

/// The attribute set broadcast on network create/update.
pub(crate) fn network_attrs(network: &Network) -> String {
    let host = network
        .record
        .url()
        .ok()
        .and_then(|url| url.host_str().map(str::to_owned))
        .unwrap_or_default();
    let state = if network.conn.is_some() {
        "connected"
    } else {
        "disconnected"
    };
    encode_attrs(&[
        ("name", network.get_name()),
        ("host", &host),
        ("state", state),
        ("nickname", &network.record.nick),
    ])
}

/// Deterministic per-user egress address selection: the configured range's
/// base plus `user id + 1`, one range per address family.
pub(crate) async fn local_tcp_addr_for_host(
    config: &Config,
    user_id: i64,
    host: &str,
) -> Result<Option<IpAddr>, String> {
    if config.upstream_user_ips.is_empty() {
        return Ok(None);
    }

    let addrs: Vec<_> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|err| err.to_string())?
        .collect();
    let want_v6 = addrs.iter().any(|addr| addr.is_ipv6());

    let Some(range) = config
        .upstream_user_ips
        .iter()
        .find(|net| matches!(net, IpNet::V6(_)) == want_v6)
    else {
        return Ok(None);
    };

    compute_user_addr(range, user_id).map(Some)
}

/// `range base + (user id + 1)`, rejected when it falls outside the range.
pub(crate) fn compute_user_addr(range: &IpNet, user_id: i64) -> Result<IpAddr, String> {
    match range {
        IpNet::V4(net) => {
            let base = u32::from(net.addr());
            let addr = base
                .checked_add(user_id as u32 + 1)
                .ok_or_else(|| format!("IP network {net} too small"))?;
            let addr = std::net::Ipv4Addr::from(addr);
            if !net.contains(&addr) {
                return Err(format!("IP network {net} too small"));
            }
            Ok(IpAddr::V4(addr))
        }
        IpNet::V6(net) => {
            let base = u128::from(net.addr());
            let addr = base
                .checked_add(user_id as u128 + 1)
                .ok_or_else(|| format!("IP network {net} too small"))?;
            let addr = std::net::Ipv6Addr::from(addr);
            if !net.contains(&addr) {
                return Err(format!("IP network {net} too small"));
            }
            Ok(IpAddr::V6(addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, addr: &str) -> NetworkRecord {
        NetworkRecord {
            name: name.to_owned(),
            addr: addr.to_owned(),
            ..NetworkRecord::default()
        }
    }

    #[test]
    fn check_network_url_grammar() {
        let ok = |addr: &str| {
            check_network_record(&record("net", addr), std::iter::empty())
                .unwrap_or_else(|err| panic!("{addr}: {err}"))
        };
        let err = |addr: &str| {
            check_network_record(&record("net", addr), std::iter::empty()).unwrap_err()
        };

        ok("ircs://irc.libera.chat");
        ok("ircs://irc.libera.chat:6697");
        ok("irc+insecure://irc.example.org");
        ok("unix:///var/run/ircd.sock");
        ok("irc+unix:///var/run/ircd.sock");
        // A bare host is read as ircs://.
        ok("irc.libera.chat");

        assert_eq!(
            err("ircs://user:pw@irc.example.org"),
            NetworkCheckError::UrlUserinfo("ircs".to_owned())
        );
        assert_eq!(
            err("ircs://irc.example.org?tls=0"),
            NetworkCheckError::UrlQuery("ircs".to_owned())
        );
        assert_eq!(
            err("ircs://irc.example.org#frag"),
            NetworkCheckError::UrlFragment("ircs".to_owned())
        );
        assert_eq!(
            err("ircs://irc.example.org/path"),
            NetworkCheckError::UrlUnexpectedPath("ircs".to_owned())
        );
        assert_eq!(
            err("unix://host/path"),
            NetworkCheckError::UrlUnexpectedHost("unix".to_owned())
        );
        assert_eq!(
            err("http://irc.example.org"),
            NetworkCheckError::UnknownScheme("http".to_owned())
        );
    }

    #[test]
    fn check_network_name_rules() {
        let mut rec = record("-libera", "ircs://irc.libera.chat");
        assert_eq!(
            check_network_record(&rec, std::iter::empty()),
            Err(NetworkCheckError::DashName)
        );

        rec.name = "libera".to_owned();
        assert_eq!(
            check_network_record(&rec, [(1, "libera")].into_iter()),
            Err(NetworkCheckError::DuplicateName("libera".to_owned()))
        );

        // The same name is fine when it is the record being updated.
        rec.id = 1;
        assert!(check_network_record(&rec, [(1, "libera")].into_iter()).is_ok());
    }

    #[test]
    fn egress_address_is_deterministic() {
        let range: IpNet = "192.0.2.0/24".parse().unwrap();
        assert_eq!(
            compute_user_addr(&range, 1).unwrap(),
            "192.0.2.2".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            compute_user_addr(&range, 41).unwrap(),
            "192.0.2.42".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn egress_address_rejects_too_small_ranges() {
        let v4: IpNet = "192.0.2.1/32".parse().unwrap();
        assert!(compute_user_addr(&v4, 1).is_err());

        let v6: IpNet = "2001:db8::1/128".parse().unwrap();
        assert!(compute_user_addr(&v6, 1).is_err());

        let ok: IpNet = "2001:db8::/64".parse().unwrap();
        assert_eq!(
            compute_user_addr(&ok, 7).unwrap(),
            "2001:db8::8".parse::<IpAddr>().unwrap()
        );
    }

    /// A Stop can race the `UpstreamConnected` hand-off; the dispatcher
    /// must close any connection arriving for a stopped or removed
    /// network instead of leaking it.
    #[tokio::test]
    async fn post_stop_upstream_connected_is_closed() {
        let db = Database::open(":memory:").await.expect("in-memory db");
        let mut user_rec = UserRecord {
            username: "alice".to_owned(),
            ..UserRecord::default()
        };
        db.store_user(&mut user_rec).await.expect("store user");

        let mut user = User::new(
            user_rec,
            ConfigHandle::new(Config::default()),
            db.clone(),
            Arc::new(Metrics::default()),
            Arc::new(crate::push::LogPushSender),
            None,
        );

        let mut network = Network::new(
            NetworkRecord {
                id: 7,
                name: "stopped".to_owned(),
                addr: "ircs://irc.example.org".to_owned(),
                ..NetworkRecord::default()
            },
            Vec::new(),
        );
        network.stop();
        user.networks.push(network);

        let (uc, closed) = upstream::test_upstream(7, 1);
        user.handle_upstream_connected(uc, None).await;
        assert!(user.networks[0].conn.is_none());
        assert!(*closed.borrow());

        // Same for a network that no longer exists at all.
        let (uc, closed) = upstream::test_upstream(999, 2);
        user.handle_upstream_connected(uc, None).await;
        assert!(*closed.borrow());
    }

    #[test]
    fn attrs_encoding_escapes_values() {
        assert_eq!(
            encode_attrs(&[("state", "connected"), ("error", "")]),
            "state=connected;error="
        );
        assert_eq!(
            encode_attrs(&[("error", "no route; try later")]),
            "error=no\\sroute\\:\\stry\\slater"
        );
    }
}
