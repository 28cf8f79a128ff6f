//! Resource kinds the cache knows how to list and watch.
//!
//! Every kind is a row in a small table (`KindSpec`); the watch machinery is
//! kind-agnostic and only consults the table for the API coordinates. Adding
//! a kind means adding a variant, a table row and a `CachedResource` impl.

use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Pod, Secret, Service};
use kube::core::{ApiResource, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Pod,
    Node,
    Namespace,
    ConfigMap,
    Secret,
    Service,
}

struct KindSpec {
    api_resource: fn() -> ApiResource,
    namespaced: bool,
    plural: &'static str,
}

impl ResourceKind {
    /// Every kind in the table
    pub const ALL: [Self; 6] = [
        Self::Pod,
        Self::Node,
        Self::Namespace,
        Self::ConfigMap,
        Self::Secret,
        Self::Service,
    ];

    /// Kinds started eagerly on first `ensure_and_wait`
    pub const DEFAULT: [Self; 5] = [
        Self::Pod,
        Self::Node,
        Self::Namespace,
        Self::ConfigMap,
        Self::Secret,
    ];

    fn spec(self) -> KindSpec {
        match self {
            Self::Pod => KindSpec {
                api_resource: || ApiResource::erase::<Pod>(&()),
                namespaced: true,
                plural: "pods",
            },
            Self::Node => KindSpec {
                api_resource: || ApiResource::erase::<Node>(&()),
                namespaced: false,
                plural: "nodes",
            },
            Self::Namespace => KindSpec {
                api_resource: || ApiResource::erase::<Namespace>(&()),
                namespaced: false,
                plural: "namespaces",
            },
            Self::ConfigMap => KindSpec {
                api_resource: || ApiResource::erase::<ConfigMap>(&()),
                namespaced: true,
                plural: "configmaps",
            },
            Self::Secret => KindSpec {
                api_resource: || ApiResource::erase::<Secret>(&()),
                namespaced: true,
                plural: "secrets",
            },
            Self::Service => KindSpec {
                api_resource: || ApiResource::erase::<Service>(&()),
                namespaced: true,
                plural: "services",
            },
        }
    }

    /// API coordinates (group, version, kind, plural) used for list and watch
    #[must_use]
    pub fn api_resource(self) -> ApiResource {
        (self.spec().api_resource)()
    }

    #[must_use]
    pub fn is_namespaced(self) -> bool {
        self.spec().namespaced
    }

    /// Lower-case plural, as used in API paths and change-feed keys
    #[must_use]
    pub fn as_str(self) -> &'static str {
        self.spec().plural
    }

    /// `apiVersion`/`kind` pair stamped onto list items, which the API server omits
    #[must_use]
    pub fn type_meta(self) -> TypeMeta {
        let ar = self.api_resource();
        TypeMeta {
            api_version: ar.api_version,
            kind: ar.kind,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| {
                let plural = kind.as_str();
                wanted == plural
                    || wanted == plural.trim_end_matches('s')
                    || wanted == format!("{kind:?}").to_ascii_lowercase()
            })
            .ok_or_else(|| format!("unknown resource kind '{s}'"))
    }
}

/// Binds a typed Kubernetes object to the cache kind that stores it
pub trait CachedResource:
    Resource<DynamicType = ()> + DeserializeOwned + Clone + Send + Sync + 'static
{
    const KIND: ResourceKind;
}

impl CachedResource for Pod {
    const KIND: ResourceKind = ResourceKind::Pod;
}

impl CachedResource for Node {
    const KIND: ResourceKind = ResourceKind::Node;
}

impl CachedResource for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;
}

impl CachedResource for ConfigMap {
    const KIND: ResourceKind = ResourceKind::ConfigMap;
}

impl CachedResource for Secret {
    const KIND: ResourceKind = ResourceKind::Secret;
}

impl CachedResource for Service {
    const KIND: ResourceKind = ResourceKind::Service;
}
