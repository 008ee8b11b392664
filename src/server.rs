//! Server: registry of users, shared configuration, listeners and
//! shutdown coordination.
//!
//! The registry lock is held briefly and never across I/O; per-user work
//! happens by posting events to the user's queue. A panic in one user's
//! dispatcher is isolated: it is logged and that user is removed from the
//! registry, leaving everyone else running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigHandle};
use crate::db::{Database, DbError, UserRecord};
use crate::downstream;
use crate::ident::IdentStore;
use crate::push::{LogPushSender, PushSender};
use crate::user::{Event, EventSender, User};

// Deadlines for operations that would otherwise block indefinitely.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub(crate) const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DOWNSTREAM_REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const HANDLE_DOWNSTREAM_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const BACKLOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Cap on messages replayed per target on reconnect.
pub(crate) const BACKLOG_LIMIT: usize = 4000;

/// Cross-user gauges and counters, readable from any thread.
#[derive(Default)]
pub struct Metrics {
    downstreams: AtomicI64,
    upstreams: AtomicI64,
    upstream_connect_errors: AtomicU64,
}

impl Metrics {
    pub(crate) fn downstreams_inc(&self) {
        self.downstreams.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn downstreams_dec(&self) {
        self.downstreams.fetch_sub(1, Ordering::Relaxed);
    }
    pub(crate) fn upstreams_inc(&self) {
        self.upstreams.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn upstreams_dec(&self) {
        self.upstreams.fetch_sub(1, Ordering::Relaxed);
    }
    pub(crate) fn connect_errors_inc(&self) {
        self.upstream_connect_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn downstreams(&self) -> i64 {
        self.downstreams.load(Ordering::Relaxed)
    }
    pub fn upstreams(&self) -> i64 {
        self.upstreams.load(Ordering::Relaxed)
    }
    pub fn upstream_connect_errors(&self) -> u64 {
        self.upstream_connect_errors.load(Ordering::Relaxed)
    }
}

/// Point-in-time server statistics.
pub struct ServerStats {
    pub users: usize,
    pub downstreams: i64,
    pub upstreams: i64,
}

/// Registry entry for a running user dispatcher.
#[derive(Clone)]
pub(crate) struct UserHandle {
    pub username: String,
    pub events: EventSender,
}

struct Shared {
    config: ConfigHandle,
    db: Database,
    push: Arc<dyn PushSender>,
    identd: Option<Arc<IdentStore>>,
    metrics: Arc<Metrics>,
    users: Mutex<HashMap<String, UserHandle>>,
    user_tasks: Mutex<Vec<JoinHandle<()>>>,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|err| err.into_inner())
}

#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

impl Server {
    pub fn new(config: Config, db: Database) -> Self {
        Server {
            shared: Arc::new(Shared {
                config: ConfigHandle::new(config),
                db,
                push: Arc::new(LogPushSender),
                identd: Some(Arc::new(IdentStore::default())),
                metrics: Arc::new(Metrics::default()),
                users: Mutex::new(HashMap::new()),
                user_tasks: Mutex::new(Vec::new()),
                listener_tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config_handle(&self) -> ConfigHandle {
        self.shared.config.clone()
    }

    pub(crate) fn config(&self) -> Arc<Config> {
        self.shared.config.get()
    }

    pub(crate) fn db(&self) -> Database {
        self.shared.db.clone()
    }

    pub(crate) fn metrics(&self) -> Arc<Metrics> {
        self.shared.metrics.clone()
    }

    pub(crate) fn user_handle(&self, username: &str) -> Option<UserHandle> {
        lock(&self.shared.users).get(username).cloned()
    }

    /// Event queue handle for one user's dispatcher, for administrative
    /// paths.
    pub fn user_events(&self, username: &str) -> Option<EventSender> {
        self.user_handle(username).map(|handle| handle.events)
    }

    /// Load every user from storage and spawn their dispatchers.
    pub async fn start(&self) -> Result<(), DbError> {
        let users = self.shared.db.list_users().await?;
        for record in users {
            self.add_user(record);
        }
        Ok(())
    }

    fn add_user(&self, record: UserRecord) -> UserHandle {
        info!(user = %record.username, "starting bouncer for user");

        let user = User::new(
            record.clone(),
            self.shared.config.clone(),
            self.shared.db.clone(),
            self.shared.metrics.clone(),
            self.shared.push.clone(),
            self.shared.identd.clone(),
        );
        let handle = UserHandle {
            username: record.username.clone(),
            events: user.events(),
        };
        lock(&self.shared.users).insert(record.username.clone(), handle.clone());

        let shared = self.shared.clone();
        let username = record.username;
        let task = tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(user.run()).catch_unwind().await;
            if let Err(panic) = result {
                error!(user = %username, panic = panic_message(&panic),
                       "panic serving user");
            }
            lock(&shared.users).remove(&username);
        });
        lock(&self.shared.user_tasks).push(task);

        handle
    }

    /// Create a user record (password already hashed) and start its
    /// dispatcher.
    pub async fn create_user(&self, mut record: UserRecord) -> Result<(), DbError> {
        if lock(&self.shared.users).contains_key(&record.username) {
            return Err(DbError::UserExists(record.username));
        }
        self.shared.db.store_user(&mut record).await?;
        self.add_user(record);
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            users: lock(&self.shared.users).len(),
            downstreams: self.shared.metrics.downstreams(),
            upstreams: self.shared.metrics.upstreams(),
        }
    }

    /// Accept clients on the listener until shutdown. Transient accept
    /// errors are retried with a short escalating delay.
    pub fn listen(&self, listener: TcpListener) {
        let server = self.clone();
        let task = tokio::spawn(async move {
            let mut retry_delay = Duration::from_millis(5);
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        retry_delay = Duration::from_millis(5);
                        tokio::spawn(downstream::serve(server.clone(), stream, remote));
                    }
                    Err(err) => {
                        warn!(error = %err, delay = ?retry_delay, "accept error, retrying");
                        tokio::time::sleep(retry_delay).await;
                        retry_delay = (retry_delay * 2).min(Duration::from_secs(1));
                    }
                }
            }
        });
        lock(&self.shared.listener_tasks).push(task);
    }

    /// Stop listeners, stop every user (persisting their state), wait for
    /// the dispatchers, then close storage.
    pub async fn shutdown(&self) {
        for task in lock(&self.shared.listener_tasks).drain(..) {
            task.abort();
        }

        let handles: Vec<UserHandle> = lock(&self.shared.users).values().cloned().collect();
        for handle in handles {
            let _ = handle.events.send(Event::Stop).await;
        }

        let tasks: Vec<JoinHandle<()>> = lock(&self.shared.user_tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.shared.db.close().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text
    } else {
        "unknown panic"
    }
}
