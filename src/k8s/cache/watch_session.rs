/**
 * Resource Watch Session
 *
 * Keeps one (cluster, kind) store current with a list-then-watch loop running
 * as an owned, cancellable task. Readiness is published on a `watch` channel
 * so any number of callers can wait on first sync without polling.
 */
use super::config::CacheConfig;
use super::errors::CacheError;
use super::identity::ClusterId;
use super::kind::ResourceKind;
use super::store::ObjectStore;
use super::subscription::{StoreUpdate, SubscriptionManager, UpdateAction};
use crate::k8s::remote::{RemoteClusterClient, WatchStream};
use crate::k8s::selector::LabelSelector;
use futures::StreamExt;
use kube::api::WatchEvent;
use kube::core::DynamicObject;
use kube::ResourceExt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a session could not complete its first list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub reason: String,
    pub code: Option<u16>,
}

impl From<&crate::error::Error> for SyncFailure {
    fn from(error: &crate::error::Error) -> Self {
        Self {
            reason: error.to_string(),
            code: error.api_status(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Syncing,
    Ready,
    Stopped,
    Failed(SyncFailure),
}

impl SessionState {
    /// Ready, or never going to become ready
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Ready | Self::Stopped | Self::Failed(_))
    }
}

/// Counts background loops that are alive across every session sharing it
#[derive(Debug, Clone, Default)]
pub struct ActiveSessions(Arc<AtomicUsize>);

impl ActiveSessions {
    #[must_use]
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn enter(&self) -> ActiveGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(self.0.clone())
    }
}

// decrements on drop, so an aborted task is still accounted for
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What a session needs from its cluster entry to run
#[derive(Clone)]
pub struct SessionContext {
    pub client: Arc<dyn RemoteClusterClient>,
    pub config: Arc<CacheConfig>,
    pub updates: Arc<SubscriptionManager>,
    pub active: ActiveSessions,
}

#[derive(Debug, Default)]
struct SessionCounters {
    lists: AtomicU64,
    watch_restarts: AtomicU64,
    events_applied: AtomicU64,
}

/// Point-in-time view of a session for introspection
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub kind: ResourceKind,
    pub state: SessionState,
    pub objects: usize,
    pub lists: u64,
    pub watch_restarts: u64,
    pub events_applied: u64,
}

struct SessionShared {
    cluster_id: ClusterId,
    kind: ResourceKind,
    namespace: Option<String>,
    store: Arc<ObjectStore>,
    state: watch::Sender<SessionState>,
    counters: SessionCounters,
}

impl SessionShared {
    /// Publish a new state; `Stopped` is final
    fn transition(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == SessionState::Stopped || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

pub struct ResourceWatchSession {
    shared: Arc<SessionShared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceWatchSession {
    /// `namespace` only applies to namespaced kinds
    #[must_use]
    pub fn new(cluster_id: ClusterId, kind: ResourceKind, namespace: Option<String>) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            shared: Arc::new(SessionShared {
                cluster_id,
                kind,
                namespace: namespace.filter(|_| kind.is_namespaced()),
                store: Arc::new(ObjectStore::new()),
                state,
                counters: SessionCounters::default(),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Spawn the list-then-watch loop; a second call, or a call after `stop`, does nothing
    pub fn start(&self, ctx: &SessionContext) {
        let Ok(mut task) = self.task.lock() else {
            error!(
                cluster = %self.shared.cluster_id,
                kind = %self.shared.kind,
                "session task lock poisoned"
            );
            return;
        };
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let watch_loop = WatchLoop {
            shared: self.shared.clone(),
            client: ctx.client.clone(),
            config: ctx.config.clone(),
            updates: ctx.updates.clone(),
            cancel: self.cancel.clone(),
        };
        let guard = ctx.active.enter();
        *task = Some(tokio::spawn(async move {
            let _guard = guard;
            watch_loop.run().await;
        }));
    }

    /// Cancel the background loop and release the store; idempotent
    pub fn stop(&self) {
        self.cancel.cancel();
        self.shared.state.send_replace(SessionState::Stopped);
        self.shared.store.retire();
    }

    /// `stop`, then wait for the background loop to exit
    pub async fn shutdown(&self) {
        self.stop();
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(
                        cluster = %self.shared.cluster_id,
                        kind = %self.shared.kind,
                        "watch loop panicked"
                    );
                }
            }
        }
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.shared.kind
    }

    #[must_use]
    pub fn cluster_id(&self) -> ClusterId {
        self.shared.cluster_id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state.borrow().clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.shared.state.borrow() == SessionState::Ready
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the session is ready, failed or stopped, and return that state
    pub async fn wait_settled(&self) -> SessionState {
        let mut rx = self.shared.state.subscribe();
        match rx.wait_for(SessionState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => SessionState::Stopped,
        }
    }

    /// # Errors
    ///
    /// `Retired` once the session has been stopped, `LockPoisoned` on a poisoned store
    pub fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Arc<DynamicObject>>, CacheError> {
        self.check_live()?;
        self.shared.store.get(namespace, name)
    }

    /// # Errors
    ///
    /// `Retired` once the session has been stopped, `LockPoisoned` on a poisoned store
    pub fn list(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Arc<DynamicObject>>, CacheError> {
        self.check_live()?;
        self.shared.store.list(namespace, selector)
    }

    fn check_live(&self) -> Result<(), CacheError> {
        if self.shared.store.is_retired() {
            return Err(CacheError::Retired {
                cluster_id: self.shared.cluster_id,
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let counters = &self.shared.counters;
        SessionStats {
            kind: self.shared.kind,
            state: self.state(),
            objects: self.shared.store.len(),
            lists: counters.lists.load(Ordering::Relaxed),
            watch_restarts: counters.watch_restarts.load(Ordering::Relaxed),
            events_applied: counters.events_applied.load(Ordering::Relaxed),
        }
    }
}

impl Drop for ResourceWatchSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum WatchOutcome {
    Cancelled,
    /// Stream ended cleanly (server-side timeout); resume from the last version
    Ended,
    /// Transport error or expired version; fall back to a full list
    Desynced(String),
}

struct WatchLoop {
    shared: Arc<SessionShared>,
    client: Arc<dyn RemoteClusterClient>,
    config: Arc<CacheConfig>,
    updates: Arc<SubscriptionManager>,
    cancel: CancellationToken,
}

impl WatchLoop {
    async fn run(self) {
        let cluster = self.shared.cluster_id;
        let kind = self.shared.kind;
        info!(%cluster, %kind, "🔍 watch session started");

        let mut backoff = self.config.initial_backoff();
        let mut synced = false;

        'relist: loop {
            if !synced {
                self.shared.transition(SessionState::Syncing);
            }

            let listed = tokio::select! {
                () = self.cancel.cancelled() => break 'relist,
                listed = self.client.list(kind, self.shared.namespace.as_deref()) => listed,
            };

            let mut resource_version = match listed {
                Ok(snapshot) => {
                    let count = snapshot.items.len();
                    let items = snapshot.items.into_iter().map(|obj| self.normalize(obj)).collect();
                    let namespaces = match self.shared.store.replace(items) {
                        Ok(namespaces) => namespaces,
                        Err(e) if !synced => {
                            error!(%cluster, %kind, "❌ could not store list result: {}", e);
                            self.shared.transition(SessionState::Failed(SyncFailure {
                                reason: e.to_string(),
                                code: None,
                            }));
                            break 'relist;
                        }
                        Err(e) => {
                            warn!(
                                %cluster,
                                %kind,
                                "could not store relist, retrying in {:?}: {}",
                                backoff,
                                e
                            );
                            if !self.pause(backoff).await {
                                break 'relist;
                            }
                            backoff = self.config.next_backoff(backoff);
                            continue 'relist;
                        }
                    };
                    self.shared.counters.lists.fetch_add(1, Ordering::Relaxed);
                    if synced {
                        debug!(%cluster, %kind, count, "🔄 relisted");
                    } else {
                        synced = true;
                        self.shared.transition(SessionState::Ready);
                        info!(%cluster, %kind, count, "✅ initial sync complete");
                    }
                    // one update per namespace, so namespace-scoped subscribers see the relist
                    for namespace in namespaces {
                        self.notify(namespace, String::new(), UpdateAction::Resynced).await;
                    }
                    backoff = self.config.initial_backoff();
                    snapshot.resource_version
                }
                Err(e) if !synced => {
                    error!(%cluster, %kind, "❌ initial list failed: {}", e);
                    self.shared.transition(SessionState::Failed(SyncFailure::from(&e)));
                    break 'relist;
                }
                Err(e) => {
                    warn!(%cluster, %kind, "relist failed, retrying in {:?}: {}", backoff, e);
                    if !self.pause(backoff).await {
                        break 'relist;
                    }
                    backoff = self.config.next_backoff(backoff);
                    continue 'relist;
                }
            };

            loop {
                let namespace = self.shared.namespace.as_deref();
                let opened = tokio::select! {
                    () = self.cancel.cancelled() => break 'relist,
                    opened = self.client.watch(kind, namespace, &resource_version) => opened,
                };
                let stream = match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        self.shared.counters.watch_restarts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            %cluster,
                            %kind,
                            "watch could not be opened, relisting in {:?}: {}",
                            backoff,
                            e
                        );
                        if !self.pause(backoff).await {
                            break 'relist;
                        }
                        backoff = self.config.next_backoff(backoff);
                        continue 'relist;
                    }
                };

                match self.consume(stream, &mut resource_version).await {
                    WatchOutcome::Cancelled => break 'relist,
                    WatchOutcome::Ended => {
                        debug!(%cluster, %kind, %resource_version, "watch ended, resuming");
                        if !self.pause(self.config.restart_delay()).await {
                            break 'relist;
                        }
                    }
                    WatchOutcome::Desynced(reason) => {
                        self.shared.counters.watch_restarts.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            %cluster,
                            %kind,
                            "watch interrupted ({}), relisting in {:?}",
                            reason,
                            backoff
                        );
                        if !self.pause(backoff).await {
                            break 'relist;
                        }
                        backoff = self.config.next_backoff(backoff);
                        continue 'relist;
                    }
                }
            }
        }

        info!(%cluster, %kind, "watch session stopped");
    }

    /// Apply events in stream order until the stream ends, breaks, or the session is cancelled
    async fn consume(
        &self,
        mut stream: WatchStream,
        resource_version: &mut String,
    ) -> WatchOutcome {
        loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return WatchOutcome::Cancelled,
                next = stream.next() => next,
            };

            let event = match next {
                None => return WatchOutcome::Ended,
                Some(Err(e)) => return WatchOutcome::Desynced(e.to_string()),
                Some(Ok(event)) => event,
            };

            let applied = match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                    Self::advance(resource_version, &obj);
                    let (namespace, name) = (obj.namespace().unwrap_or_default(), obj.name_any());
                    self.shared
                        .store
                        .apply(self.normalize(obj))
                        .map(|()| (namespace, name, UpdateAction::Applied))
                }
                WatchEvent::Deleted(obj) => {
                    Self::advance(resource_version, &obj);
                    let (namespace, name) = (obj.namespace().unwrap_or_default(), obj.name_any());
                    self.shared
                        .store
                        .delete(&namespace, &name)
                        .map(|_| (namespace, name, UpdateAction::Deleted))
                }
                WatchEvent::Bookmark(bookmark) => {
                    *resource_version = bookmark.metadata.resource_version;
                    continue;
                }
                WatchEvent::Error(status) if status.code == 410 => {
                    return WatchOutcome::Desynced(format!(
                        "resource version expired: {}",
                        status.message
                    ));
                }
                WatchEvent::Error(status) => {
                    return WatchOutcome::Desynced(format!("{} {}", status.code, status.message));
                }
            };

            match applied {
                Ok((namespace, name, action)) => {
                    self.shared.counters.events_applied.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        cluster = %self.shared.cluster_id,
                        kind = %self.shared.kind,
                        %namespace,
                        %name,
                        ?action,
                        "applied watch event"
                    );
                    self.notify(namespace, name, action).await;
                }
                Err(e) => return WatchOutcome::Desynced(e.to_string()),
            }
        }
    }

    fn advance(resource_version: &mut String, obj: &DynamicObject) {
        if let Some(version) = obj.resource_version() {
            *resource_version = version;
        }
    }

    fn normalize(&self, mut obj: DynamicObject) -> DynamicObject {
        obj.types.get_or_insert_with(|| self.shared.kind.type_meta());
        obj
    }

    async fn notify(&self, namespace: String, name: String, action: UpdateAction) {
        self.updates
            .notify(&StoreUpdate {
                cluster_id: self.shared.cluster_id,
                kind: self.shared.kind,
                namespace,
                name,
                action,
            })
            .await;
    }

    /// Sleep unless cancelled first; returns false on cancellation
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = sleep(duration) => true,
        }
    }
}
