//! Typed, read-only views over a watch session's store.
//!
//! A lister never touches the network: every call reads the session's current
//! snapshot and decodes the matching objects into `K`.

use super::errors::CacheError;
use super::identity::ClusterId;
use super::kind::CachedResource;
use super::watch_session::ResourceWatchSession;
use crate::k8s::selector::LabelSelector;
use k8s_openapi::serde_json;
use kube::core::DynamicObject;
use kube::ResourceExt;
use std::marker::PhantomData;
use std::sync::Arc;

pub struct Lister<K> {
    session: Arc<ResourceWatchSession>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: CachedResource> Lister<K> {
    pub(crate) const fn new(session: Arc<ResourceWatchSession>) -> Self {
        Self {
            session,
            _kind: PhantomData,
        }
    }

    #[must_use]
    pub fn cluster_id(&self) -> ClusterId {
        self.session.cluster_id()
    }

    /// One object by namespace and name; cluster-scoped kinds use an empty namespace
    ///
    /// # Errors
    ///
    /// `Retired` once the backing entry has been retired, `Decode` if the cached
    /// object does not fit `K`
    pub fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, CacheError> {
        self.session
            .get(namespace, name)?
            .map(|obj| decode(&obj))
            .transpose()
    }

    /// Objects in `namespace` matching `selector`; an empty namespace means all of them
    ///
    /// # Errors
    ///
    /// See [`Lister::get`]
    pub fn list(&self, namespace: &str, selector: &LabelSelector) -> Result<Vec<K>, CacheError> {
        let scope = Some(namespace).filter(|ns| !ns.is_empty());
        self.session
            .list(scope, selector)?
            .iter()
            .map(|obj| decode(obj))
            .collect()
    }

    /// Objects across every namespace matching `selector`
    ///
    /// # Errors
    ///
    /// See [`Lister::get`]
    pub fn list_all(&self, selector: &LabelSelector) -> Result<Vec<K>, CacheError> {
        self.list("", selector)
    }
}

fn decode<K: CachedResource>(obj: &DynamicObject) -> Result<K, CacheError> {
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|e| CacheError::Decode {
            kind: K::KIND,
            name: obj.name_any(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::cache::kind::ResourceKind;
    use k8s_openapi::api::core::v1::{Node, Pod};

    fn pod_object(ns: &str, name: &str, image: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ResourceKind::Pod.api_resource()).within(ns);
        obj.data = serde_json::json!({
            "spec": { "containers": [{ "name": "main", "image": image }] }
        });
        obj
    }

    #[test]
    fn test_decode_typed_pod() {
        let pod: Pod = decode(&pod_object("default", "web-0", "nginx:1.27")).unwrap();
        assert_eq!(pod.name_any(), "web-0");
        assert_eq!(pod.namespace().as_deref(), Some("default"));
        let image = pod.spec.unwrap().containers[0].image.clone();
        assert_eq!(image.as_deref(), Some("nginx:1.27"));
    }

    #[test]
    fn test_decode_reports_shape_mismatch() {
        let mut obj = DynamicObject::new("n1", &ResourceKind::Node.api_resource());
        obj.data = serde_json::json!({ "spec": { "unschedulable": "sometimes" } });
        let err = decode::<Node>(&obj).unwrap_err();
        assert!(matches!(err, CacheError::Decode { kind: ResourceKind::Node, .. }));
    }
}
