//! Partner push notifications
//!
//! Pushes are dispatched through a backend edge function. Delivery is best
//! effort; callers log failures and carry on.

use crate::backend::Backend;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slate_core::{SlateResult, UserId};
use std::sync::Arc;
use tracing::debug;

/// Edge function that fans a message out to the target's push subscriptions
pub const PUSH_FUNCTION: &str = "send-push-notification";

/// Event a push announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    /// A task was completed
    TaskCompleted,
    /// A reward was bought
    RewardPurchased,
    /// A reward was redeemed
    RewardRedeemed,
    /// A punishment was applied
    PunishmentApplied,
    /// A rule was broken
    RuleBroken,
}

/// Message body sent to the edge function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Recipient
    pub target_user_id: UserId,
    /// Event type
    #[serde(rename = "type")]
    pub kind: PushKind,
    /// Notification title
    pub title: String,
    /// Notification text
    pub body: String,
    /// Event payload
    #[serde(default)]
    pub data: Value,
}

impl PushMessage {
    /// Message for `target_user_id`
    #[must_use]
    pub fn new(target_user_id: UserId, kind: PushKind, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            target_user_id,
            kind,
            title: title.into(),
            body: body.into(),
            data: Value::Null,
        }
    }

    /// Attach extra payload for the notification click handler
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Sends push messages
#[async_trait::async_trait]
pub trait PushDispatcher: Send + Sync {
    /// Deliver `message`
    async fn dispatch(&self, message: &PushMessage) -> SlateResult<()>;
}

/// Dispatcher backed by the push edge function
#[derive(Debug, Clone)]
pub struct EdgeFunctionPush {
    backend: Arc<dyn Backend>,
}

impl EdgeFunctionPush {
    /// Dispatcher invoking the push function on `backend`
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl PushDispatcher for EdgeFunctionPush {
    async fn dispatch(&self, message: &PushMessage) -> SlateResult<()> {
        debug!(target = %message.target_user_id, kind = ?message.kind, "dispatching push");
        let payload = crate::accessor::encode_row(crate::table::Table::UserPushSubscriptions, message)?;
        self.backend.invoke(PUSH_FUNCTION, payload).await?;
        Ok(())
    }
}
