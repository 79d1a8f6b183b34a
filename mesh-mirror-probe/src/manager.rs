use std::sync::{Arc, Mutex};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};

use mesh_mirror_common::{EventSink, GatewaySpec};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Result;
use crate::metrics::ProbeMetrics;
use crate::worker::{ProbeState, run_worker};

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Per-gateway bookkeeping held by the manager: the current spec, the
/// worker's cancellation token and its reachability state.
struct GatewayMirror {
    spec: GatewaySpec,
    cancel: CancellationToken,
    state: Arc<Mutex<ProbeState>>,
}

/// Owns one prober task per registered gateway, keyed by cluster name.
/// Probers run concurrently with each other and with reconcilers; the
/// only thing they share with the rest of the engine is the event sink
/// handed over at registration.
pub struct ProbeManager {
    client: reqwest::Client,
    threshold: u32,
    metrics: ProbeMetrics,
    gateways: Mutex<HashMap<String, GatewayMirror>>,
}

impl ProbeManager {
    pub fn new(threshold: u32, metrics: ProbeMetrics) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            threshold,
            metrics,
            gateways: Mutex::new(HashMap::new()),
        })
    }

    /// Starts a prober for a gateway. Registering a cluster name twice
    /// replaces the previous prober and its state.
    pub fn register(&self, spec: GatewaySpec, sink: Arc<dyn EventSink>) {
        let state = Arc::new(Mutex::new(ProbeState::new()));
        self.start(spec, sink, state);
    }

    /// Restarts a gateway's prober with new timing while preserving its
    /// accumulated reachability state. Falls back to a fresh
    /// registration when the gateway was never registered.
    pub fn update(&self, spec: GatewaySpec, sink: Arc<dyn EventSink>) {
        let existing = {
            let mut gateways = self.gateways.lock().expect("gateway map lock poisoned");
            gateways.remove(&spec.cluster_name)
        };
        let state = match existing {
            Some(mirror) => {
                mirror.cancel.cancel();
                mirror.state
            }
            None => {
                warn!(cluster = %spec.cluster_name, "gateway update for unregistered cluster");
                Arc::new(Mutex::new(ProbeState::new()))
            }
        };
        self.start(spec, sink, state);
    }

    /// Stops a gateway's prober and discards its bookkeeping.
    pub fn deregister(&self, cluster_name: &str) {
        let mut gateways = self.gateways.lock().expect("gateway map lock poisoned");
        if let Some(mirror) = gateways.remove(cluster_name) {
            mirror.cancel.cancel();
            info!(
                cluster = %cluster_name,
                gateway = %mirror.spec.gateway_name,
                "deregistered gateway prober"
            );
        }
    }

    /// Stops every prober. Idempotent.
    pub fn stop(&self) {
        let mut gateways = self.gateways.lock().expect("gateway map lock poisoned");
        for (cluster, mirror) in gateways.drain() {
            mirror.cancel.cancel();
            info!(cluster = %cluster, "stopped gateway prober");
        }
    }

    pub fn is_registered(&self, cluster_name: &str) -> bool {
        self.gateways
            .lock()
            .expect("gateway map lock poisoned")
            .contains_key(cluster_name)
    }

    fn start(&self, spec: GatewaySpec, sink: Arc<dyn EventSink>, state: Arc<Mutex<ProbeState>>) {
        let cancel = CancellationToken::new();
        tokio::spawn(run_worker(
            self.client.clone(),
            spec.clone(),
            state.clone(),
            sink,
            self.threshold,
            self.metrics.clone(),
            cancel.clone(),
        ));

        let mut gateways = self.gateways.lock().expect("gateway map lock poisoned");
        if let Some(previous) = gateways.insert(
            spec.cluster_name.clone(),
            GatewayMirror {
                spec,
                cancel,
                state,
            },
        ) {
            previous.cancel.cancel();
        }
    }
}
