//! EventSub subscription table: what we want to be subscribed to, what the
//! server has acknowledged, and which callback receives each event type.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{ChannelPointRewardRedemption, SubscriptionKind, SubscriptionStatus};

/// Callback receiving redemptions. Runs on the WebSocket unit's task.
pub type RedemptionCallback = Arc<dyn Fn(ChannelPointRewardRedemption) + Send + Sync>;

#[derive(Clone)]
pub struct EventSubSubscription {
    pub kind: SubscriptionKind,
    /// True once the server answered the create request with 202.
    pub subscribed: bool,
    /// Server-assigned id from the 202 response.
    pub id: Option<String>,
    pub callback: Option<RedemptionCallback>,
}

impl EventSubSubscription {
    fn new(kind: SubscriptionKind, callback: Option<RedemptionCallback>) -> Self {
        Self {
            kind,
            subscribed: false,
            id: None,
            callback,
        }
    }

    pub fn wire_type(&self) -> &'static str {
        self.kind.wire_type()
    }

    pub fn version(&self) -> &'static str {
        self.kind.version()
    }
}

impl fmt::Debug for EventSubSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubSubscription")
            .field("type", &self.wire_type())
            .field("subscribed", &self.subscribed)
            .field("id", &self.id)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Shared subscription table. Cloning shares the same table.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    entries: Arc<RwLock<BTreeMap<SubscriptionKind, EventSubSubscription>>>,
}

impl SubscriptionRegistry {
    /// Table seeded with `automod.message.hold` (no callback), which keeps a
    /// new WebSocket session from being closed for having no subscriptions.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            SubscriptionKind::AutomodMessageHold,
            EventSubSubscription::new(SubscriptionKind::AutomodMessageHold, None),
        );
        Self {
            entries: Arc::new(RwLock::new(entries)),
        }
    }

    /// Table with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register `kind`, or replace its callback if already registered.
    pub async fn subscribe(&self, kind: SubscriptionKind, callback: Option<RedemptionCallback>) {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&kind) {
            Some(existing) => {
                existing.callback = callback;
                debug!(subscription = %kind, "replaced subscription callback");
            }
            None => {
                entries.insert(kind, EventSubSubscription::new(kind, callback));
                info!(subscription = %kind, "subscription registered");
            }
        }
    }

    /// Remove `kind`, returning the removed entry.
    pub async fn unsubscribe(&self, kind: SubscriptionKind) -> Option<EventSubSubscription> {
        let removed = self.entries.write().await.remove(&kind);
        match &removed {
            Some(_) => info!(subscription = %kind, "subscription removed"),
            None => warn!(subscription = %kind, "no subscription to remove"),
        }
        removed
    }

    pub async fn status(&self, kind: SubscriptionKind) -> SubscriptionStatus {
        match self.entries.read().await.get(&kind) {
            Some(entry) if entry.subscribed => SubscriptionStatus::Subscribed,
            Some(_) => SubscriptionStatus::NotSubscribed,
            None => SubscriptionStatus::Unknown,
        }
    }

    pub async fn get(&self, kind: SubscriptionKind) -> Option<EventSubSubscription> {
        self.entries.read().await.get(&kind).cloned()
    }

    /// Kinds registered but not acknowledged.
    pub async fn pending(&self) -> Vec<SubscriptionKind> {
        self.entries
            .read()
            .await
            .values()
            .filter(|entry| !entry.subscribed)
            .map(|entry| entry.kind)
            .collect()
    }

    /// Record a server acknowledgement. Returns false if `kind` was removed meanwhile.
    pub async fn mark_subscribed(&self, kind: SubscriptionKind, id: Option<String>) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&kind) {
            Some(entry) => {
                entry.subscribed = true;
                entry.id = id;
                true
            }
            None => false,
        }
    }

    pub async fn mark_pending(&self, kind: SubscriptionKind) {
        if let Some(entry) = self.entries.write().await.get_mut(&kind) {
            entry.subscribed = false;
            entry.id = None;
        }
    }

    /// Mark every entry pending, e.g. after the WebSocket session changed.
    pub async fn mark_all_pending(&self) {
        for entry in self.entries.write().await.values_mut() {
            entry.subscribed = false;
            entry.id = None;
        }
    }

    pub async fn snapshot(&self) -> Vec<EventSubSubscription> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn seeded_with_automod_hold() {
        let registry = SubscriptionRegistry::new();
        let automod = registry.get(SubscriptionKind::AutomodMessageHold).await.unwrap();
        assert!(automod.callback.is_none());
        assert_eq!(registry.pending().await, vec![SubscriptionKind::AutomodMessageHold]);
        assert_eq!(SubscriptionRegistry::empty().len().await, 0);
    }

    #[tokio::test]
    async fn status_follows_acknowledgement() {
        let registry = SubscriptionRegistry::empty();
        let kind = SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd;
        assert_eq!(registry.status(kind).await, SubscriptionStatus::Unknown);

        registry.subscribe(kind, None).await;
        assert_eq!(registry.status(kind).await, SubscriptionStatus::NotSubscribed);

        assert!(registry.mark_subscribed(kind, Some("sub-1".into())).await);
        assert_eq!(registry.status(kind).await, SubscriptionStatus::Subscribed);
        assert_eq!(registry.get(kind).await.unwrap().id.as_deref(), Some("sub-1"));

        registry.mark_pending(kind).await;
        assert_eq!(registry.status(kind).await, SubscriptionStatus::NotSubscribed);
    }

    #[tokio::test]
    async fn resubscribe_replaces_callback_and_keeps_state() {
        let registry = SubscriptionRegistry::empty();
        let kind = SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd;
        let hits = Arc::new(AtomicUsize::new(0));

        registry.subscribe(kind, None).await;
        registry.mark_subscribed(kind, None).await;
        let counter = hits.clone();
        let callback: RedemptionCallback = Arc::new(move |_: ChannelPointRewardRedemption| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry.subscribe(kind, Some(callback)).await;

        let entry = registry.get(kind).await.unwrap();
        assert!(entry.subscribed);
        (entry.callback.unwrap())(ChannelPointRewardRedemption::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unsubscribe_and_mark_all_pending() {
        let registry = SubscriptionRegistry::new();
        let kind = SubscriptionKind::ChannelPointsCustomRewardRedemptionAdd;
        registry.subscribe(kind, None).await;
        registry.mark_subscribed(kind, Some("a".into())).await;
        registry.mark_subscribed(SubscriptionKind::AutomodMessageHold, Some("b".into())).await;
        assert!(registry.pending().await.is_empty());

        registry.mark_all_pending().await;
        assert_eq!(registry.pending().await.len(), 2);

        assert!(registry.unsubscribe(kind).await.is_some());
        assert!(registry.unsubscribe(kind).await.is_none());
        assert!(!registry.mark_subscribed(kind, None).await);
    }
}
