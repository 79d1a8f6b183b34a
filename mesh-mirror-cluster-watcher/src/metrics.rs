use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster: String,
}

#[derive(Clone, Default)]
pub struct QueueMetrics {
    requeues: Family<ClusterLabels, Counter>,
    drops: Family<ClusterLabels, Counter>,
}

impl QueueMetrics {
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "events_requeued",
            "Reconciliation events requeued after a handler failure",
            self.requeues.clone(),
        );
        registry.register(
            "events_dropped",
            "Reconciliation events dropped after exhausting the requeue limit",
            self.drops.clone(),
        );
        self
    }

    pub fn observe_requeue(&self, cluster: &str) {
        self.requeues
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }

    pub fn observe_drop(&self, cluster: &str) {
        self.drops
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }
}
