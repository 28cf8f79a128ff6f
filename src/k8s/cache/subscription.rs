use super::identity::ClusterId;
use super::kind::ResourceKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    /// Object added or modified
    Applied,
    Deleted,
    /// Store replaced by a full list
    Resynced,
}

/// Notification that a cached store changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUpdate {
    pub cluster_id: ClusterId,
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub action: UpdateAction,
}

impl StoreUpdate {
    /// `"<cluster>:<kind>:<namespace>"`, the key subscription patterns match against
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.cluster_id, self.kind, self.namespace)
    }
}

pub struct Subscription {
    pub id: String,
    pub pattern: String,
    pub sender: mpsc::Sender<StoreUpdate>,
}

impl Subscription {
    #[must_use]
    pub fn new(pattern: String, capacity: usize) -> (Self, mpsc::Receiver<StoreUpdate>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = Uuid::new_v4().to_string();

        (
            Self {
                id,
                pattern,
                sender: tx,
            },
            rx,
        )
    }
}

pub struct SubscriptionManager {
    subscriptions: Arc<RwLock<HashMap<String, Vec<Subscription>>>>,
    capacity: usize,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    pub async fn subscribe(&self, pattern: String) -> (String, mpsc::Receiver<StoreUpdate>) {
        let (subscription, receiver) = Subscription::new(pattern.clone(), self.capacity);
        let id = subscription.id.clone();

        let mut subs = self.subscriptions.write().await;
        subs.entry(pattern).or_default().push(subscription);

        (id, receiver)
    }

    pub async fn unsubscribe(&self, subscription_id: &str) {
        let mut subs = self.subscriptions.write().await;

        for subscriptions in subs.values_mut() {
            subscriptions.retain(|s| s.id != subscription_id);
        }

        // Clean up empty entries
        subs.retain(|_, v| !v.is_empty());
    }

    /// Deliver `update` to every matching subscriber without waiting; a full or
    /// closed channel drops the update for that subscriber only
    pub async fn notify(&self, update: &StoreUpdate) {
        let subs = self.subscriptions.read().await;
        if subs.is_empty() {
            return;
        }
        let key = update.key();

        for (pattern, subscriptions) in subs.iter() {
            if Self::pattern_matches(pattern, &key) {
                for subscription in subscriptions {
                    if subscription.sender.try_send(update.clone()).is_err() {
                        debug!(
                            subscription = %subscription.id,
                            %key,
                            "dropped update for lagging subscriber"
                        );
                    }
                }
            }
        }
    }

    fn pattern_matches(pattern: &str, key: &str) -> bool {
        if pattern == "*" || pattern == key {
            return true;
        }

        // Prefix pattern, e.g. "3:pods:*" matches "3:pods:default"
        pattern
            .strip_suffix('*')
            .is_some_and(|prefix| key.starts_with(prefix))
    }

    pub async fn active_subscriptions(&self) -> usize {
        let subs = self.subscriptions.read().await;
        subs.values().map(std::vec::Vec::len).sum()
    }
}
