/**
 * Cluster Cache Entry
 *
 * Owns the watch sessions for one cluster identity. Entries are never
 * re-pointed at new credentials: a rotation produces a new entry and this one
 * is retired.
 */
use super::errors::{lock_poisoned_error, CacheError};
use super::identity::{ClusterId, ClusterIdentity};
use super::kind::ResourceKind;
use super::watch_session::{ResourceWatchSession, SessionContext, SessionState, SessionStats};
use chrono::{DateTime, Utc};
use futures::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

type SessionMap = HashMap<ResourceKind, Arc<ResourceWatchSession>>;

/// Point-in-time view of an entry for introspection
#[derive(Debug, Clone)]
pub struct ClusterStats {
    pub identity: ClusterIdentity,
    pub generation: Uuid,
    pub created_at: DateTime<Utc>,
    pub idle: Duration,
    pub retired: bool,
    pub sessions: Vec<SessionStats>,
}

pub struct ClusterCacheEntry {
    identity: ClusterIdentity,
    /// Distinguishes successive entries for the same cluster in logs
    generation: Uuid,
    namespace: Option<String>,
    ctx: SessionContext,
    sessions: Mutex<SessionMap>,
    created_at: DateTime<Utc>,
    last_access: Mutex<Instant>,
    retired: AtomicBool,
}

impl ClusterCacheEntry {
    #[must_use]
    pub fn new(identity: ClusterIdentity, namespace: Option<String>, ctx: SessionContext) -> Self {
        Self {
            identity,
            generation: Uuid::new_v4(),
            namespace,
            ctx,
            sessions: Mutex::new(HashMap::new()),
            created_at: Utc::now(),
            last_access: Mutex::new(Instant::now()),
            retired: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn identity(&self) -> ClusterIdentity {
        self.identity
    }

    #[must_use]
    pub const fn cluster_id(&self) -> ClusterId {
        self.identity.cluster_id
    }

    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Start a session for every kind that has none; a session whose first sync
    /// failed is replaced so a recovered cluster can sync on the next attempt
    ///
    /// # Errors
    ///
    /// `Retired` if the entry has been retired, `LockPoisoned` on a poisoned session map
    pub fn ensure_kinds(&self, kinds: &[ResourceKind]) -> Result<(), CacheError> {
        let mut sessions = self.lock_sessions()?;
        if self.is_retired() {
            return Err(self.retired_error());
        }

        for &kind in kinds {
            if let Some(existing) = sessions.get(&kind) {
                if !matches!(existing.state(), SessionState::Failed(_)) {
                    continue;
                }
                debug!(cluster = %self.identity, %kind, "replacing failed session");
                existing.stop();
            }

            let session = Arc::new(ResourceWatchSession::new(
                self.cluster_id(),
                kind,
                self.namespace.clone(),
            ));
            session.start(&self.ctx);
            sessions.insert(kind, session);
        }
        drop(sessions);

        self.touch();
        Ok(())
    }

    /// Wait until every listed kind has synced, one of them failed its first sync,
    /// or `timeout` elapses. Concurrent waiters share the sessions' readiness
    /// signal; the background sync carries on after a timeout.
    ///
    /// # Errors
    ///
    /// `ClusterUnavailable` when a first sync failed, `SyncTimeout` naming the kinds
    /// still syncing, `NotReady` for a kind that was never ensured, `Retired` if the
    /// entry was retired while waiting
    pub async fn wait_ready(
        &self,
        kinds: &[ResourceKind],
        timeout: Duration,
    ) -> Result<(), CacheError> {
        let sessions = kinds
            .iter()
            .map(|&kind| self.session(kind))
            .collect::<Result<Vec<_>, _>>()?;

        let cluster_id = self.cluster_id();
        let waits = sessions.iter().map(|session| async move {
            match session.wait_settled().await {
                SessionState::Ready => Ok(()),
                SessionState::Failed(failure) => Err(CacheError::ClusterUnavailable {
                    cluster_id,
                    kind: Some(session.kind()),
                    reason: failure.reason,
                    code: failure.code,
                }),
                _ => Err(CacheError::Retired { cluster_id }),
            }
        });

        match tokio::time::timeout(timeout, try_join_all(waits)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                // a failure recorded right at the deadline still outranks the timeout
                if let Some(failed) = sessions.iter().find_map(|session| match session.state() {
                    SessionState::Failed(failure) => Some(CacheError::ClusterUnavailable {
                        cluster_id,
                        kind: Some(session.kind()),
                        reason: failure.reason,
                        code: failure.code,
                    }),
                    _ => None,
                }) {
                    return Err(failed);
                }
                let pending = sessions
                    .iter()
                    .filter(|session| !session.is_ready())
                    .map(|session| session.kind())
                    .collect();
                Err(CacheError::SyncTimeout { cluster_id, pending })
            }
        }
    }

    /// The session for `kind`, whatever its state
    ///
    /// # Errors
    ///
    /// `Retired` if the entry was retired, `NotReady` if the kind was never ensured
    pub fn session(&self, kind: ResourceKind) -> Result<Arc<ResourceWatchSession>, CacheError> {
        let sessions = self.lock_sessions()?;
        if self.is_retired() {
            return Err(self.retired_error());
        }
        sessions.get(&kind).cloned().ok_or(CacheError::NotReady {
            cluster_id: self.cluster_id(),
            kind,
        })
    }

    /// Stop every session and mark the entry terminal; later calls fail fast
    pub async fn retire(&self) {
        let drained: Vec<Arc<ResourceWatchSession>> = match self.sessions.lock() {
            Ok(mut sessions) => {
                self.retired.store(true, Ordering::SeqCst);
                sessions.drain().map(|(_, session)| session).collect()
            }
            Err(poisoned) => {
                self.retired.store(true, Ordering::SeqCst);
                poisoned.into_inner().drain().map(|(_, session)| session).collect()
            }
        };
        if drained.is_empty() {
            return;
        }

        join_all(drained.iter().map(|session| session.shutdown())).await;
        info!(
            cluster = %self.identity,
            generation = %self.generation,
            sessions = drained.len(),
            "🗑️  cache entry retired"
        );
    }

    pub fn touch(&self) {
        if let Ok(mut last_access) = self.last_access.lock() {
            *last_access = Instant::now();
        }
    }

    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_access
            .lock()
            .map_or(Duration::ZERO, |last_access| last_access.elapsed())
    }

    #[must_use]
    pub fn stats(&self) -> ClusterStats {
        let mut sessions: Vec<SessionStats> = self
            .sessions
            .lock()
            .map(|sessions| sessions.values().map(|session| session.stats()).collect())
            .unwrap_or_default();
        sessions.sort_by_key(|stats| stats.kind);

        ClusterStats {
            identity: self.identity,
            generation: self.generation,
            created_at: self.created_at,
            idle: self.idle_for(),
            retired: self.is_retired(),
            sessions,
        }
    }

    fn lock_sessions(&self) -> Result<MutexGuard<'_, SessionMap>, CacheError> {
        self.sessions
            .lock()
            .map_err(|_| lock_poisoned_error("cluster entry session map poisoned"))
    }

    const fn retired_error(&self) -> CacheError {
        CacheError::Retired {
            cluster_id: self.identity.cluster_id,
        }
    }
}
