//! Best-effort pushes to the linked partner

use parking_lot::RwLock;
use serde_json::Value;
use slate_core::UserId;
use slate_remote::{PushDispatcher, PushKind, PushMessage};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Sends a push to the partner after confirmed mutations
///
/// Failures never reach the caller.
#[derive(Clone)]
pub struct PartnerPush {
    dispatcher: Option<Arc<dyn PushDispatcher>>,
    partner: Arc<RwLock<Option<UserId>>>,
    enabled: bool,
}

impl PartnerPush {
    /// Push through `dispatcher` when `enabled`
    #[must_use]
    pub fn new(dispatcher: Arc<dyn PushDispatcher>, enabled: bool) -> Self {
        Self {
            dispatcher: Some(dispatcher),
            partner: Arc::new(RwLock::new(None)),
            enabled,
        }
    }

    /// No dispatcher; every send is a no-op
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            dispatcher: None,
            partner: Arc::new(RwLock::new(None)),
            enabled: false,
        }
    }

    /// Target future pushes at `partner`
    pub fn set_partner(&self, partner: Option<UserId>) {
        *self.partner.write() = partner;
    }

    /// Current push target
    #[must_use]
    pub fn partner(&self) -> Option<UserId> {
        self.partner.read().clone()
    }

    /// Push `kind` to the partner; returns whether it was delivered
    pub async fn send(&self, kind: PushKind, title: &str, body: String, data: Value) -> bool {
        if !self.enabled {
            return false;
        }
        let (Some(dispatcher), Some(partner)) = (&self.dispatcher, self.partner()) else {
            debug!(?kind, "no partner linked, skipping push");
            return false;
        };

        let message = PushMessage::new(partner, kind, title, body).with_data(data);
        match dispatcher.dispatch(&message).await {
            Ok(()) => true,
            Err(error) => {
                warn!(?kind, %error, "partner push failed");
                false
            }
        }
    }
}

impl fmt::Debug for PartnerPush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartnerPush")
            .field("enabled", &self.enabled)
            .field("partner", &self.partner())
            .finish_non_exhaustive()
    }
}
