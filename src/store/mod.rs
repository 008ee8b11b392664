//! Message store abstraction.
//!
//! The bouncer records relayed messages so reconnecting clients can be
//! replayed what they missed. Two backends exist: an in-memory store that
//! records nothing (no backlog, no delivery receipts) and a filesystem
//! store with one log file per (network, target).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pontoon_proto::Message;
use thiserror::Error;

use crate::db::NetworkRecord;

mod fs;
mod memory;

pub use fs::FsMessageStore;
pub use memory::MemoryMessageStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed stored message: {0}")]
    Malformed(String),
}

/// A store of relayed messages, addressed by internal message IDs.
///
/// Targets are always passed pre-folded under the network's active
/// casemapping, so a channel's history is found regardless of spelling.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Whether stored messages survive a restart. Delivery receipts and
    /// backlog are only maintained for persistent stores.
    fn is_persistent(&self) -> bool;

    /// Record a message, returning its internal ID when the store keeps it.
    async fn append(
        &self,
        network: &NetworkRecord,
        target: &str,
        msg: &Message,
    ) -> Result<Option<String>, StoreError>;

    /// The ID of the latest message on `target` at or before `at`.
    async fn last_msg_id(
        &self,
        network: &NetworkRecord,
        target: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError>;

    /// Messages strictly after `after_id` as `(id, message)` pairs, oldest
    /// first, at most `limit`.
    async fn load_after(
        &self,
        network: &NetworkRecord,
        target: &str,
        after_id: &str,
        limit: usize,
    ) -> Result<Vec<(String, Message)>, StoreError>;

    /// Follow a network rename, so history stays addressable.
    async fn rename_network(
        &self,
        old: &NetworkRecord,
        new: &NetworkRecord,
    ) -> Result<(), StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}
