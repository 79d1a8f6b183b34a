use std::sync::Arc;

use prometheus_client::registry::Registry;

use mesh_mirror_cluster_watcher::QueueMetrics;
use mesh_mirror_probe::ProbeMetrics;

#[derive(Clone)]
pub struct Metrics {
    pub queue: QueueMetrics,
    pub probe: ProbeMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("mesh_mirror");
        let queue = QueueMetrics::default().register(&mut registry);
        let probe = ProbeMetrics::default().register(&mut registry);
        Self {
            queue,
            probe,
            registry: Arc::new(registry),
        }
    }
}
