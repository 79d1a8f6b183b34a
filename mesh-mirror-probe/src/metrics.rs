use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ProbeResult {
    Success,
    Failure,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Direction {
    Up,
    Down,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProbeLabels {
    pub cluster: String,
    pub result: ProbeResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub cluster: String,
    pub direction: Direction,
}

#[derive(Clone, Default)]
pub struct ProbeMetrics {
    probes: Family<ProbeLabels, Counter>,
    transitions: Family<TransitionLabels, Counter>,
}

impl ProbeMetrics {
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "gateway_probes",
            "Gateway health probe attempts by result",
            self.probes.clone(),
        );
        registry.register(
            "gateway_transitions",
            "Gateway reachability transitions by direction",
            self.transitions.clone(),
        );
        self
    }

    pub fn observe_probe(&self, cluster: &str, success: bool) {
        let result = if success {
            ProbeResult::Success
        } else {
            ProbeResult::Failure
        };
        self.probes
            .get_or_create(&ProbeLabels {
                cluster: cluster.to_string(),
                result,
            })
            .inc();
    }

    pub fn observe_transition(&self, cluster: &str, reachable: bool) {
        let direction = if reachable {
            Direction::Up
        } else {
            Direction::Down
        };
        self.transitions
            .get_or_create(&TransitionLabels {
                cluster: cluster.to_string(),
                direction,
            })
            .inc();
    }
}
