use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Numeric ID of a registered cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How to authenticate against a cluster's API server
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterCredentials {
    /// A full kubeconfig document; `context` selects a non-current context
    Kubeconfig {
        content: String,
        #[serde(default)]
        context: Option<String>,
    },
    /// Bearer token with an optional PEM CA bundle
    BearerToken {
        token: String,
        #[serde(default)]
        ca_bundle: Option<String>,
    },
}

impl fmt::Debug for ClusterCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kubeconfig { context, .. } => f
                .debug_struct("Kubeconfig")
                .field("context", context)
                .finish_non_exhaustive(),
            Self::BearerToken { ca_bundle, .. } => f
                .debug_struct("BearerToken")
                .field("ca_bundle", &ca_bundle.is_some())
                .finish_non_exhaustive(),
        }
    }
}

/// Everything needed to build a client for one cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub id: ClusterId,
    #[serde(default)]
    pub name: Option<String>,
    /// API server URL; for kubeconfig credentials an empty value keeps the kubeconfig's server
    #[serde(default)]
    pub api_server: String,
    pub credentials: ClusterCredentials,
    /// Restrict namespaced kinds to this namespace
    #[serde(default)]
    pub namespace: Option<String>,
}

impl ClusterDescriptor {
    /// Identity of this registration: cluster ID plus a fingerprint of everything
    /// that determines what the cache would observe
    #[must_use]
    pub fn identity(&self) -> ClusterIdentity {
        let mut hasher = DefaultHasher::new();
        self.api_server.hash(&mut hasher);
        self.credentials.hash(&mut hasher);
        self.namespace.hash(&mut hasher);
        ClusterIdentity {
            cluster_id: self.id,
            fingerprint: hasher.finish(),
        }
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("cluster-{}", self.id))
    }
}

/// Registry key: a credential change yields a different identity for the same cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterIdentity {
    pub cluster_id: ClusterId,
    pub fingerprint: u64,
}

impl fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:016x}", self.cluster_id, self.fingerprint)
    }
}
