use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Service, ServiceSpec};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use tokio::sync::RwLock;

#[cfg(test)]
mod fixtures;
mod index;
pub mod workspace;
pub mod workspacekind;

pub use index::{owned_by, workspaces_of_kind};

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
        }
    }
}

/// Operator configuration read at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Generate an Istio VirtualService per Workspace
    pub use_layer7_routing: bool,
    /// Cluster DNS domain used in VirtualService destination hosts
    pub cluster_domain: String,
    /// Istio gateway, as `<namespace>/<name>`
    pub istio_gateway: String,
    /// Hosts placed on each VirtualService
    pub istio_hosts: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_layer7_routing: false,
            cluster_domain: "cluster.local".into(),
            istio_gateway: "kubeflow/kubeflow-gateway".into(),
            istio_hosts: vec!["*".into()],
        }
    }
}

/// State shared between the controllers and the web servers
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconcilers
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    pub registry: prometheus::Registry,
    pub settings: Arc<Settings>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new(settings: Settings) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            registry: prometheus::Registry::default(),
            settings: Arc::new(settings),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }
}

// deletion apparently doesn't lead to any change in metadata otherwise, which means the changed_predicate
// would drop them.
fn ensure_deletion_change<K: Resource, E>(
    mut event: Result<kube::runtime::watcher::Event<K>, E>,
) -> Result<kube::runtime::watcher::Event<K>, E> {
    if let Ok(kube::runtime::watcher::Event::Delete(ref mut object)) = event {
        let meta = object.meta_mut();
        meta.generation = match meta.generation {
            Some(val) => Some(val + 1),
            None => Some(0),
        }
    }
    event
}

fn changed_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    if let Some(g) = obj.meta().generation {
        // covers spec but not metadata or status
        g.hash(&mut hasher)
    }
    obj.labels().hash(&mut hasher);
    obj.annotations().hash(&mut hasher);
    Some(hasher.finish())
}

/// Any write to the object, status included
fn resource_version_predicate<K: Resource>(obj: &K) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    obj.resource_version().hash(&mut hasher);
    Some(hasher.finish())
}

trait ObservedSpec {
    type Spec;

    fn spec(&self) -> &Self::Spec;
}

impl ObservedSpec for Service {
    type Spec = Option<ServiceSpec>;

    fn spec(&self) -> &Self::Spec {
        &self.spec
    }
}

fn spec_predicate_serde<K: Resource + ObservedSpec>(obj: &K) -> Option<u64>
where
    K::Spec: Serialize,
{
    let mut hasher = DefaultHasher::new();
    serde_hashkey::to_key(obj.spec()).ok()?.hash(&mut hasher);
    Some(hasher.finish())
}
