//! In-process stand-in for remote API servers, scripted per test.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::WatchEvent;
use kube::core::{DynamicObject, ErrorResponse};
use kube::ResourceExt;
use kubecache::error::{Error, Result};
use kubecache::k8s::cache::{
    CacheConfig, ClusterCacheManager, ClusterCredentials, ClusterDescriptor, ClusterId,
    ResourceKind,
};
use kubecache::k8s::remote::{ClientFactory, ListSnapshot, RemoteClusterClient, WatchStream};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

type EventSender = mpsc::UnboundedSender<Result<WatchEvent<DynamicObject>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListMode {
    Serve,
    Reject(u16),
}

/// One fake API server
pub struct FakeCluster {
    objects: Mutex<HashMap<ResourceKind, Vec<DynamicObject>>>,
    resource_version: AtomicU64,
    mode: Mutex<ListMode>,
    /// lists block while this is false
    gate: watch::Sender<bool>,
    lists: Mutex<HashMap<ResourceKind, usize>>,
    list_namespaces: Mutex<HashMap<ResourceKind, Option<String>>>,
    watches: Mutex<HashMap<ResourceKind, usize>>,
    watch_versions: Mutex<HashMap<ResourceKind, String>>,
    watchers: Mutex<HashMap<ResourceKind, Vec<EventSender>>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            resource_version: AtomicU64::new(100),
            mode: Mutex::new(ListMode::Serve),
            gate,
            lists: Mutex::new(HashMap::new()),
            list_namespaces: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
            watch_versions: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_objects(&self, kind: ResourceKind, objects: Vec<DynamicObject>) {
        self.objects.lock().unwrap().insert(kind, objects);
    }

    /// Lists stay pending until `release_lists`
    pub fn hold_lists(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_lists(&self) {
        self.gate.send_replace(true);
    }

    /// Lists fail with an API status, like rejected credentials
    pub fn reject_lists(&self, code: u16) {
        *self.mode.lock().unwrap() = ListMode::Reject(code);
    }

    pub fn serve_lists(&self) {
        *self.mode.lock().unwrap() = ListMode::Serve;
    }

    pub fn list_calls(&self, kind: ResourceKind) -> usize {
        self.lists.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    pub fn last_list_namespace(&self, kind: ResourceKind) -> Option<String> {
        self.list_namespaces.lock().unwrap().get(&kind).cloned().flatten()
    }

    pub fn watch_calls(&self, kind: ResourceKind) -> usize {
        self.watches.lock().unwrap().get(&kind).copied().unwrap_or(0)
    }

    /// Resource version the most recent watch started from
    pub fn last_watch_version(&self, kind: ResourceKind) -> Option<String> {
        self.watch_versions.lock().unwrap().get(&kind).cloned()
    }

    /// Watch streams for `kind` whose receiving end is still alive
    pub fn open_watches(&self, kind: ResourceKind) -> usize {
        self.watchers
            .lock()
            .unwrap()
            .get(&kind)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Deliver an event to every open watch, updating what later lists return.
    /// Returns how many watches received it.
    pub fn push(&self, kind: ResourceKind, event: WatchEvent<DynamicObject>) -> usize {
        let event = match event {
            WatchEvent::Added(obj) => WatchEvent::Added(self.stamp(obj)),
            WatchEvent::Modified(obj) => WatchEvent::Modified(self.stamp(obj)),
            WatchEvent::Deleted(obj) => WatchEvent::Deleted(self.stamp(obj)),
            other => other,
        };
        match &event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let mut objects = self.objects.lock().unwrap();
                let items = objects.entry(kind).or_default();
                items.retain(|o| !same_object(o, obj));
                items.push(obj.clone());
            }
            WatchEvent::Deleted(obj) => {
                if let Some(items) = self.objects.lock().unwrap().get_mut(&kind) {
                    items.retain(|o| !same_object(o, obj));
                }
            }
            _ => {}
        }

        let mut watchers = self.watchers.lock().unwrap();
        let senders = watchers.entry(kind).or_default();
        senders.retain(|tx| tx.send(Ok(event.clone())).is_ok());
        senders.len()
    }

    /// Tell every open watch its resource version is too old
    pub fn expire_watches(&self, kind: ResourceKind) -> usize {
        self.push(kind, WatchEvent::Error(status(410, "Expired", "too old resource version")))
    }

    /// Break every open watch with a transport error
    pub fn break_watches(&self, kind: ResourceKind) {
        if let Some(senders) = self.watchers.lock().unwrap().remove(&kind) {
            for tx in senders {
                let _ = tx.send(Err(Error::Custom("connection reset by peer".to_string())));
            }
        }
    }

    /// End every open watch cleanly, as a server-side timeout does
    pub fn end_watches(&self, kind: ResourceKind) {
        self.watchers.lock().unwrap().remove(&kind);
    }

    fn stamp(&self, mut obj: DynamicObject) -> DynamicObject {
        let version = self.resource_version.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(version.to_string());
        obj
    }

    fn bump<V: Clone>(
        map: &Mutex<HashMap<ResourceKind, V>>,
        kind: ResourceKind,
        update: impl FnOnce(Option<V>) -> V,
    ) {
        let mut map = map.lock().unwrap();
        let next = update(map.get(&kind).cloned());
        map.insert(kind, next);
    }
}

#[async_trait]
impl RemoteClusterClient for FakeCluster {
    async fn list(&self, kind: ResourceKind, namespace: Option<&str>) -> Result<ListSnapshot> {
        Self::bump(&self.lists, kind, |n| n.unwrap_or(0) + 1);
        Self::bump(&self.list_namespaces, kind, |_| namespace.map(str::to_string));

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mode = *self.mode.lock().unwrap();
        if let ListMode::Reject(code) = mode {
            let rejected = status(code, "Unauthorized", "credentials rejected");
            return Err(Error::Kube(kube::Error::Api(rejected)));
        }

        let items: Vec<DynamicObject> = self
            .objects
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|obj| namespace.is_none_or(|ns| obj.namespace().as_deref() == Some(ns)))
            .collect();
        Ok(ListSnapshot {
            items,
            resource_version: self.resource_version.load(Ordering::SeqCst).to_string(),
        })
    }

    async fn watch(
        &self,
        kind: ResourceKind,
        _namespace: Option<&str>,
        resource_version: &str,
    ) -> Result<WatchStream> {
        Self::bump(&self.watches, kind, |n| n.unwrap_or(0) + 1);
        Self::bump(&self.watch_versions, kind, |_| resource_version.to_string());

        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers.lock().unwrap().entry(kind).or_default().push(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Hands out a `FakeCluster` per cluster ID and counts connects
pub struct FakeFactory {
    clusters: Mutex<HashMap<ClusterId, Arc<FakeCluster>>>,
    connects: Mutex<HashMap<ClusterId, usize>>,
    total_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
    /// connects block while this is false
    gate: watch::Sender<bool>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            clusters: Mutex::new(HashMap::new()),
            connects: Mutex::new(HashMap::new()),
            total_connects: AtomicUsize::new(0),
            connect_attempts: AtomicUsize::new(0),
            gate,
        })
    }

    /// Connects stay pending until `release_connects`
    pub fn hold_connects(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.gate.send_replace(true);
    }

    /// Connects started, including ones still held
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn cluster(&self, id: u64) -> Arc<FakeCluster> {
        self.clusters
            .lock()
            .unwrap()
            .entry(ClusterId(id))
            .or_insert_with(FakeCluster::new)
            .clone()
    }

    pub fn connects(&self, id: u64) -> usize {
        self.connects.lock().unwrap().get(&ClusterId(id)).copied().unwrap_or(0)
    }

    pub fn total_connects(&self) -> usize {
        self.total_connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn connect(
        &self,
        descriptor: &ClusterDescriptor,
    ) -> Result<Arc<dyn RemoteClusterClient>> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        // widen the window for racing first accesses
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.total_connects.fetch_add(1, Ordering::SeqCst);
        *self.connects.lock().unwrap().entry(descriptor.id).or_default() += 1;
        if descriptor.api_server == "https://unreachable.invalid" {
            return Err(Error::Custom("dns error: unreachable.invalid".to_string()));
        }
        Ok(self.cluster(descriptor.id.0))
    }
}

pub fn test_config() -> CacheConfig {
    CacheConfig {
        initial_backoff_millis: 10,
        max_backoff_millis: 50,
        restart_delay_millis: 10,
        ..CacheConfig::default()
    }
}

pub fn manager(factory: &Arc<FakeFactory>) -> Arc<ClusterCacheManager> {
    Arc::new(ClusterCacheManager::new(test_config(), factory.clone()))
}

pub fn descriptor(id: u64, token: &str) -> ClusterDescriptor {
    ClusterDescriptor {
        id: ClusterId(id),
        name: Some(format!("fake-{id}")),
        api_server: format!("https://cluster-{id}.example.com"),
        credentials: ClusterCredentials::BearerToken {
            token: token.to_string(),
            ca_bundle: None,
        },
        namespace: None,
    }
}

pub fn pod(namespace: &str, name: &str, labels: &[(&str, &str)]) -> DynamicObject {
    let mut obj = DynamicObject::new(name, &ResourceKind::Pod.api_resource()).within(namespace);
    obj.metadata.labels = Some(
        labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>(),
    );
    obj
}

pub fn node(name: &str) -> DynamicObject {
    DynamicObject::new(name, &ResourceKind::Node.api_resource())
}

pub fn status(code: u16, reason: &str, message: &str) -> ErrorResponse {
    ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: reason.to_string(),
        code,
    }
}

fn same_object(a: &DynamicObject, b: &DynamicObject) -> bool {
    a.namespace() == b.namespace() && a.name_any() == b.name_any()
}

/// Poll `check` until it holds, failing the test after a few seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
