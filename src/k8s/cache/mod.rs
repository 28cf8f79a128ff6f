pub mod cluster_entry;
pub mod config;
pub mod errors;
pub mod identity;
pub mod kind;
pub mod lister;
pub mod manager;
pub mod store;
pub mod subscription;
pub mod watch_session;

pub use cluster_entry::{ClusterCacheEntry, ClusterStats};
pub use config::CacheConfig;
pub use errors::CacheError;
pub use identity::{ClusterCredentials, ClusterDescriptor, ClusterId, ClusterIdentity};
pub use kind::{CachedResource, ResourceKind};
pub use lister::Lister;
pub use manager::ClusterCacheManager;
pub use store::ObjectStore;
pub use subscription::{StoreUpdate, SubscriptionManager, UpdateAction};
pub use watch_session::{ResourceWatchSession, SessionState, SessionStats, SyncFailure};
