/**
 * Cluster Cache Manager
 *
 * Registry of cache entries keyed by cluster identity. The registry map is the
 * only process-wide mutable state; each entry and each store synchronizes on
 * its own, so one cluster never contends with another.
 *
 * Concurrent first access for an identity collapses onto one slot: the first
 * caller builds the client and the entry, the rest wait on that slot and share
 * the result.
 */
use super::cluster_entry::{ClusterCacheEntry, ClusterStats};
use super::config::CacheConfig;
use super::errors::{lock_poisoned_error, CacheError};
use super::identity::{ClusterDescriptor, ClusterId, ClusterIdentity};
use super::kind::{CachedResource, ResourceKind};
use super::lister::Lister;
use super::subscription::{StoreUpdate, SubscriptionManager};
use super::watch_session::{ActiveSessions, SessionContext, SessionState};
use crate::k8s::remote::{ClientFactory, KubeClientFactory};
use crate::k8s::USER_AGENT;
use futures::future::join_all;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Secret, Service};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info, warn};

type Slot = Arc<OnceCell<Arc<ClusterCacheEntry>>>;

#[derive(Default)]
struct Registry {
    slots: HashMap<ClusterIdentity, Slot>,
    /// Identity currently registered for each cluster
    current: HashMap<ClusterId, ClusterIdentity>,
}

impl Registry {
    fn remove_cluster(&mut self, cluster_id: ClusterId) -> Option<Slot> {
        let identity = self.current.remove(&cluster_id)?;
        self.slots.remove(&identity)
    }

    fn entry_for(&self, cluster_id: ClusterId) -> Option<Arc<ClusterCacheEntry>> {
        let identity = self.current.get(&cluster_id)?;
        self.slots.get(identity)?.get().cloned()
    }
}

pub struct ClusterCacheManager {
    config: Arc<CacheConfig>,
    factory: Arc<dyn ClientFactory>,
    registry: Mutex<Registry>,
    active: ActiveSessions,
    updates: Arc<SubscriptionManager>,
}

impl ClusterCacheManager {
    #[must_use]
    pub fn new(config: CacheConfig, factory: Arc<dyn ClientFactory>) -> Self {
        let updates = Arc::new(SubscriptionManager::new(config.subscription_channel_capacity));
        Self {
            config: Arc::new(config),
            factory,
            registry: Mutex::new(Registry::default()),
            active: ActiveSessions::default(),
            updates,
        }
    }

    /// Manager that talks to real API servers through `kube::Client`
    #[must_use]
    pub fn with_kube_client(config: CacheConfig) -> Self {
        let factory =
            KubeClientFactory::new(Some(USER_AGENT.to_string()), config.watch_timeout_seconds);
        Self::new(config, Arc::new(factory))
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Make sure the default kinds are cached for `descriptor` and wait for them to sync
    ///
    /// # Errors
    ///
    /// See [`ClusterCacheManager::ensure_kinds_and_wait`]
    pub async fn ensure_and_wait(
        &self,
        descriptor: &ClusterDescriptor,
        timeout: Duration,
    ) -> Result<(), CacheError> {
        let kinds = self.config.default_kinds.clone();
        self.ensure_kinds_and_wait(descriptor, &kinds, timeout).await
    }

    /// Make sure `kinds` are cached for `descriptor` and wait up to `timeout` for
    /// them to sync. Only the wait is bounded; syncing continues in the background.
    ///
    /// # Errors
    ///
    /// - `SyncTimeout` if some kinds were still syncing when `timeout` elapsed
    /// - `ClusterUnavailable` if the client could not be built or a first list failed
    /// - `Retired` if the entry was invalidated while this call was using it
    pub async fn ensure_kinds_and_wait(
        &self,
        descriptor: &ClusterDescriptor,
        kinds: &[ResourceKind],
        timeout: Duration,
    ) -> Result<(), CacheError> {
        let entry = self.resolve(descriptor).await?;
        entry.ensure_kinds(kinds)?;
        entry.wait_ready(kinds, timeout).await
    }

    /// Find or create the entry for the descriptor's current identity, retiring
    /// the previous entry when the credentials changed
    async fn resolve(
        &self,
        descriptor: &ClusterDescriptor,
    ) -> Result<Arc<ClusterCacheEntry>, CacheError> {
        let identity = descriptor.identity();
        let (slot, stale) = {
            let mut registry = self.lock_registry()?;
            let stale = match registry.current.insert(identity.cluster_id, identity) {
                Some(previous) if previous != identity => registry.slots.remove(&previous),
                _ => None,
            };
            let slot = registry.slots.entry(identity).or_default().clone();
            (slot, stale)
        };

        if let Some(entry) = stale.as_ref().and_then(|slot| slot.get()) {
            info!(
                cluster = %identity.cluster_id,
                old = %entry.identity(),
                new = %identity,
                "🔑 credentials changed, retiring cache entry"
            );
            entry.retire().await;
        }

        let entry = slot
            .get_or_try_init(|| async {
                debug!(
                    cluster = %identity,
                    name = %descriptor.display_name(),
                    "🔧 creating cache entry"
                );
                let client = self
                    .factory
                    .connect(descriptor)
                    .await
                    .map_err(|e| CacheError::unavailable(identity.cluster_id, None, &e))?;
                let ctx = SessionContext {
                    client,
                    config: self.config.clone(),
                    updates: self.updates.clone(),
                    active: self.active.clone(),
                };
                Ok::<_, CacheError>(Arc::new(ClusterCacheEntry::new(
                    identity,
                    descriptor.namespace.clone(),
                    ctx,
                )))
            })
            .await?
            .clone();

        // the slot may have been dropped from the registry while the entry was being built
        let installed = self
            .lock_registry()?
            .slots
            .get(&identity)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !installed {
            entry.retire().await;
            return Err(CacheError::Retired {
                cluster_id: identity.cluster_id,
            });
        }

        entry.touch();
        Ok(entry)
    }

    /// Read-only view of the `K` store for `cluster_id`
    ///
    /// # Errors
    ///
    /// - `NotReady` if the cluster has no entry or the kind was never ensured
    /// - `NotReady` if the kind has not synced yet
    /// - `ClusterUnavailable` if the kind's first sync failed
    /// - `Retired` if the entry is being retired
    pub fn lister<K: CachedResource>(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Lister<K>, CacheError> {
        let not_ready = CacheError::NotReady {
            cluster_id,
            kind: K::KIND,
        };
        let Some(entry) = self.lock_registry()?.entry_for(cluster_id) else {
            return Err(not_ready);
        };

        let session = entry.session(K::KIND)?;
        match session.state() {
            SessionState::Ready => {
                entry.touch();
                Ok(Lister::new(session))
            }
            SessionState::Failed(failure) => Err(CacheError::ClusterUnavailable {
                cluster_id,
                kind: Some(K::KIND),
                reason: failure.reason,
                code: failure.code,
            }),
            SessionState::Stopped => Err(CacheError::Retired { cluster_id }),
            SessionState::Starting | SessionState::Syncing => Err(not_ready),
        }
    }

    /// # Errors
    ///
    /// See [`ClusterCacheManager::lister`]
    pub fn pods_lister(&self, cluster_id: ClusterId) -> Result<Lister<Pod>, CacheError> {
        self.lister(cluster_id)
    }

    /// # Errors
    ///
    /// See [`ClusterCacheManager::lister`]
    pub fn nodes_lister(&self, cluster_id: ClusterId) -> Result<Lister<Node>, CacheError> {
        self.lister(cluster_id)
    }

    /// # Errors
    ///
    /// See [`ClusterCacheManager::lister`]
    pub fn namespaces_lister(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Lister<Namespace>, CacheError> {
        self.lister(cluster_id)
    }

    /// # Errors
    ///
    /// See [`ClusterCacheManager::lister`]
    pub fn config_maps_lister(
        &self,
        cluster_id: ClusterId,
    ) -> Result<Lister<ConfigMap>, CacheError> {
        self.lister(cluster_id)
    }

    /// # Errors
    ///
    /// See [`ClusterCacheManager::lister`]
    pub fn secrets_lister(&self, cluster_id: ClusterId) -> Result<Lister<Secret>, CacheError> {
        self.lister(cluster_id)
    }

    /// # Errors
    ///
    /// See [`ClusterCacheManager::lister`]
    pub fn services_lister(&self, cluster_id: ClusterId) -> Result<Lister<Service>, CacheError> {
        self.lister(cluster_id)
    }

    /// Retire the cluster's entry; the next access builds a fresh one.
    /// Returns whether there was anything to retire.
    ///
    /// # Errors
    ///
    /// `LockPoisoned` if the registry lock is poisoned
    pub async fn invalidate(&self, cluster_id: ClusterId) -> Result<bool, CacheError> {
        let slot = self.lock_registry()?.remove_cluster(cluster_id);
        Ok(Self::retire_slot(cluster_id, slot).await)
    }

    /// Retire the entry only if it is still the one registered under `identity`
    ///
    /// # Errors
    ///
    /// `LockPoisoned` if the registry lock is poisoned
    pub async fn invalidate_identity(&self, identity: ClusterIdentity) -> Result<bool, CacheError> {
        let slot = {
            let mut registry = self.lock_registry()?;
            if registry.current.get(&identity.cluster_id) != Some(&identity) {
                return Ok(false);
            }
            registry.remove_cluster(identity.cluster_id)
        };
        Ok(Self::retire_slot(identity.cluster_id, slot).await)
    }

    async fn retire_slot(cluster_id: ClusterId, slot: Option<Slot>) -> bool {
        let Some(slot) = slot else {
            return false;
        };
        info!(cluster = %cluster_id, "invalidating cache entry");
        if let Some(entry) = slot.get() {
            entry.retire().await;
        }
        true
    }

    /// Retire the cluster's entry if `descriptor` carries different credentials
    /// than the ones it was built with
    ///
    /// # Errors
    ///
    /// `LockPoisoned` if the registry lock is poisoned
    pub async fn invalidate_on_credential_change(
        &self,
        descriptor: &ClusterDescriptor,
    ) -> Result<bool, CacheError> {
        let fresh = descriptor.identity();
        let registered = self.lock_registry()?.current.get(&fresh.cluster_id).copied();
        match registered {
            Some(identity) if identity != fresh => {
                info!(
                    cluster = %fresh.cluster_id,
                    old = %identity,
                    new = %fresh,
                    "🔑 credentials changed"
                );
                self.invalidate_identity(identity).await
            }
            _ => Ok(false),
        }
    }

    /// Retire entries not accessed for at least `idle`; returns the clusters retired
    ///
    /// # Errors
    ///
    /// `LockPoisoned` if the registry lock is poisoned
    pub async fn sweep(&self, idle: Duration) -> Result<Vec<ClusterId>, CacheError> {
        let expired: Vec<Arc<ClusterCacheEntry>> = {
            let mut registry = self.lock_registry()?;
            let idle_clusters: Vec<ClusterId> = registry
                .current
                .keys()
                .copied()
                .filter(|&cluster_id| {
                    registry
                        .entry_for(cluster_id)
                        .is_some_and(|entry| entry.idle_for() >= idle)
                })
                .collect();
            idle_clusters
                .into_iter()
                .filter_map(|cluster_id| registry.remove_cluster(cluster_id))
                .filter_map(|slot| slot.get().cloned())
                .collect()
        };

        join_all(expired.iter().map(|entry| entry.retire())).await;
        let mut swept: Vec<ClusterId> = expired.iter().map(|entry| entry.cluster_id()).collect();
        swept.sort();
        if !swept.is_empty() {
            info!(clusters = ?swept, "🧹 swept idle cache entries");
        }
        Ok(swept)
    }

    /// Background watch loops currently alive across every entry
    #[must_use]
    pub fn active_session_count(&self) -> usize {
        self.active.count()
    }

    /// Registered clusters with a built entry
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.registry.lock().map_or(0, |registry| {
            registry.slots.values().filter(|slot| slot.initialized()).count()
        })
    }

    #[must_use]
    pub fn stats(&self) -> Vec<ClusterStats> {
        let entries: Vec<Arc<ClusterCacheEntry>> = self.registry.lock().map_or_else(
            |_| Vec::new(),
            |registry| registry.slots.values().filter_map(|slot| slot.get().cloned()).collect(),
        );
        let mut stats: Vec<ClusterStats> = entries.iter().map(|entry| entry.stats()).collect();
        stats.sort_by_key(|s| s.identity.cluster_id);
        stats
    }

    /// Receive a `StoreUpdate` for every change whose key matches `pattern`
    /// (`"<cluster>:<kind>:<namespace>"`, `*` suffix allowed)
    pub async fn subscribe(
        &self,
        pattern: impl Into<String>,
    ) -> (String, mpsc::Receiver<StoreUpdate>) {
        self.updates.subscribe(pattern.into()).await
    }

    pub async fn unsubscribe(&self, subscription_id: &str) {
        self.updates.unsubscribe(subscription_id).await;
    }

    /// Retire every entry
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<ClusterCacheEntry>> = match self.registry.lock() {
            Ok(mut registry) => {
                registry.current.clear();
                registry.slots.drain().filter_map(|(_, slot)| slot.get().cloned()).collect()
            }
            Err(_) => {
                warn!("registry lock poisoned during shutdown");
                return;
            }
        };
        join_all(entries.iter().map(|entry| entry.retire())).await;
        info!(clusters = entries.len(), "cluster cache shut down");
    }

    fn lock_registry(&self) -> Result<MutexGuard<'_, Registry>, CacheError> {
        self.registry
            .lock()
            .map_err(|_| lock_poisoned_error("cluster cache registry poisoned"))
    }
}
