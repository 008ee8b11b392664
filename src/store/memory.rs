//! Non-persistent message store.
//!
//! Used when no log path is configured. Nothing is recorded, so there is
//! no backlog to replay and no delivery receipts are kept.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pontoon_proto::Message;

use crate::db::NetworkRecord;

use super::{MessageStore, StoreError};

#[derive(Default)]
pub struct MemoryMessageStore;

#[async_trait]
impl MessageStore for MemoryMessageStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn append(
        &self,
        _network: &NetworkRecord,
        _target: &str,
        _msg: &Message,
    ) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn last_msg_id(
        &self,
        _network: &NetworkRecord,
        _target: &str,
        _at: DateTime<Utc>,
    ) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    async fn load_after(
        &self,
        _network: &NetworkRecord,
        _target: &str,
        _after_id: &str,
        _limit: usize,
    ) -> Result<Vec<(String, Message)>, StoreError> {
        Ok(Vec::new())
    }

    async fn rename_network(
        &self,
        _old: &NetworkRecord,
        _new: &NetworkRecord,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
