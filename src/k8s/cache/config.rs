/**
 * Configuration constants for the cluster cache and its watch sessions
 */
use super::kind::ResourceKind;
use serde::Deserialize;
use std::time::Duration;

/// Initial backoff in milliseconds after a failed relist or watch
pub const INITIAL_BACKOFF_MILLIS: u64 = 1_000;

/// Maximum backoff in milliseconds between reconnect attempts
pub const MAX_BACKOFF_MILLIS: u64 = 60_000;

/// Brief delay in milliseconds before reopening a watch that ended normally
pub const RESTART_DELAY_MILLIS: u64 = 1_000;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// How long `ensure_and_wait` callers wait for first sync when they give no timeout
pub const DEFAULT_SYNC_TIMEOUT_SECONDS: u64 = 30;

/// Channel buffer size for each change-feed subscriber
pub const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 100;

/// Tunables for the cluster cache manager
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Kinds started eagerly by `ensure_and_wait`
    pub default_kinds: Vec<ResourceKind>,
    pub initial_backoff_millis: u64,
    pub max_backoff_millis: u64,
    pub restart_delay_millis: u64,
    pub watch_timeout_seconds: u32,
    pub default_sync_timeout_seconds: u64,
    pub subscription_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_kinds: ResourceKind::DEFAULT.to_vec(),
            initial_backoff_millis: INITIAL_BACKOFF_MILLIS,
            max_backoff_millis: MAX_BACKOFF_MILLIS,
            restart_delay_millis: RESTART_DELAY_MILLIS,
            watch_timeout_seconds: WATCH_TIMEOUT_SECONDS,
            default_sync_timeout_seconds: DEFAULT_SYNC_TIMEOUT_SECONDS,
            subscription_channel_capacity: SUBSCRIPTION_CHANNEL_CAPACITY,
        }
    }
}

impl CacheConfig {
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_millis)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_millis)
    }

    #[must_use]
    pub const fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_millis)
    }

    #[must_use]
    pub const fn default_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.default_sync_timeout_seconds)
    }

    /// Next backoff step: doubles `current`, capped at the configured maximum
    #[must_use]
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff())
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(INITIAL_BACKOFF_MILLIS > 0, "INITIAL_BACKOFF_MILLIS must be greater than 0");
    assert!(
        MAX_BACKOFF_MILLIS >= INITIAL_BACKOFF_MILLIS,
        "MAX_BACKOFF_MILLIS must not be below INITIAL_BACKOFF_MILLIS"
    );
    assert!(RESTART_DELAY_MILLIS > 0, "RESTART_DELAY_MILLIS must be greater than 0");
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
    assert!(
        SUBSCRIPTION_CHANNEL_CAPACITY > 0,
        "SUBSCRIPTION_CHANNEL_CAPACITY must be greater than 0"
    );
};
