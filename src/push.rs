//! Push notification delivery seam.
//!
//! The core decides *what* is notification-worthy and fans out to the
//! network's subscriptions; actual Web Push delivery lives behind this
//! trait. The expired-subscription error is distinguished because it makes
//! the core delete the subscription from storage.

use async_trait::async_trait;
use pontoon_proto::Message;
use thiserror::Error;
use tracing::debug;

use crate::db::WebPushSubscription;

#[derive(Debug, Error)]
pub enum PushError {
    /// The endpoint reported the subscription gone; it should be deleted.
    #[error("subscription expired")]
    SubscriptionExpired,

    #[error("push delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, sub: &WebPushSubscription, msg: &Message) -> Result<(), PushError>;
}

/// Delivery stub used when no push backend is configured: logs and
/// succeeds, so the fan-out path stays exercised.
#[derive(Default)]
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(&self, sub: &WebPushSubscription, msg: &Message) -> Result<(), PushError> {
        debug!(endpoint = %sub.endpoint, command = %msg.command, "push notification (no backend configured)");
        Ok(())
    }
}
