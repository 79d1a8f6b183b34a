use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_mirror_cluster_watcher::{ClusterHandle, QueueMetrics};
use mesh_mirror_common::GatewaySpec;
use mesh_mirror_probe::ProbeManager;

/// One live remote cluster registration. Exactly one exists per
/// cluster name at any time.
pub(crate) struct Registration {
    pub secret_name: String,
    pub resource_version: String,
    pub kubeconfig: String,
    pub gateway: GatewaySpec,
    pub watcher: Arc<ClusterHandle>,
}

pub struct Context {
    pub local_client: kube::Client,
    pub probes: Arc<ProbeManager>,
    pub requeue_limit: u32,
    pub gc_period: Duration,
    pub metrics: QueueMetrics,
    /// Registrations keyed by cluster name.
    pub(crate) registrations: Mutex<BTreeMap<String, Registration>>,
}

impl Context {
    pub fn new(
        local_client: kube::Client,
        probes: Arc<ProbeManager>,
        requeue_limit: u32,
        gc_period: Duration,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            local_client,
            probes,
            requeue_limit,
            gc_period,
            metrics,
            registrations: Mutex::new(BTreeMap::new()),
        }
    }
}
