use std::sync::{Arc, Mutex};
use std::time::Duration;

use mesh_mirror_common::{Event, EventSink, GatewaySpec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::ProbeMetrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reachability {
    Unknown,
    Up,
    Down,
}

/// Per-gateway probe bookkeeping. Mutated only by the owning worker;
/// carried across worker restarts when the gateway spec changes.
#[derive(Debug)]
pub(crate) struct ProbeState {
    reachability: Reachability,
    consecutive_failures: u32,
}

impl ProbeState {
    pub(crate) fn new() -> Self {
        Self {
            reachability: Reachability::Unknown,
            consecutive_failures: 0,
        }
    }

    /// Folds one probe result into the state. Returns the new
    /// reachability iff this result flipped it, so a transition event
    /// is emitted exactly once per flip.
    pub(crate) fn observe(&mut self, success: bool, threshold: u32) -> Option<bool> {
        if success {
            self.consecutive_failures = 0;
            if self.reachability != Reachability::Up {
                self.reachability = Reachability::Up;
                return Some(true);
            }
            return None;
        }

        self.consecutive_failures += 1;
        if self.reachability != Reachability::Down && self.consecutive_failures >= threshold {
            self.reachability = Reachability::Down;
            return Some(false);
        }
        None
    }

    pub(crate) fn reachability(&self) -> Reachability {
        self.reachability
    }
}

/// One timer-driven prober for one gateway. Never mutates mirror state:
/// transitions only flow out through the sink.
pub(crate) async fn run_worker(
    client: reqwest::Client,
    spec: GatewaySpec,
    state: Arc<Mutex<ProbeState>>,
    sink: Arc<dyn EventSink>,
    threshold: u32,
    metrics: ProbeMetrics,
    cancel: CancellationToken,
) {
    let cluster = spec.cluster_name.clone();
    let period = Duration::from_secs(spec.probe.period_seconds.max(1));
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(%cluster, gateway = %spec.gateway_name, ?period, "starting gateway prober");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {
                let success = probe_gateway(&client, &spec).await;
                metrics.observe_probe(&cluster, success);

                let transition = state
                    .lock()
                    .expect("probe state lock poisoned")
                    .observe(success, threshold);
                if let Some(reachable) = transition {
                    info!(%cluster, reachable, "gateway reachability changed");
                    metrics.observe_transition(&cluster, reachable);
                    sink.send(Event::ProbeTransition { reachable });
                }
            }
        }
    }
    debug!(%cluster, "gateway prober stopped");
}

/// Tries each gateway address in order; the first 2xx wins. All
/// addresses failing counts as a single failed probe.
async fn probe_gateway(client: &reqwest::Client, spec: &GatewaySpec) -> bool {
    for address in &spec.addresses {
        let url = probe_url(address, spec);
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                debug!(%url, status = %response.status(), "gateway probe rejected")
            }
            Err(e) => {
                warn!(%url, error = %e, "gateway probe failed")
            }
        }
    }
    false
}

fn probe_url(address: &str, spec: &GatewaySpec) -> String {
    let path = &spec.probe.path;
    if path.starts_with('/') {
        format!("http://{}:{}{}", address, spec.probe.port, path)
    } else {
        format!("http://{}:{}/{}", address, spec.probe.port, path)
    }
}

#[cfg(test)]
mod tests {
    use mesh_mirror_common::ProbeConfig;

    use super::*;

    fn make_spec() -> GatewaySpec {
        GatewaySpec {
            gateway_name: "gateway".into(),
            gateway_namespace: "mesh-gateway".into(),
            cluster_name: "east".into(),
            addresses: vec!["10.0.0.5".into()],
            incoming_port: 4143,
            resource_version: "41".into(),
            identity: "gateway.mesh-gateway.east".into(),
            probe: ProbeConfig {
                path: "health".into(),
                port: 4181,
                period_seconds: 3,
            },
        }
    }

    #[test]
    fn test_probe_url_normalizes_path() {
        let spec = make_spec();
        assert_eq!(
            probe_url("10.0.0.5", &spec),
            "http://10.0.0.5:4181/health".to_string()
        );
    }

    #[test]
    fn test_threshold_crossing_flips_down_exactly_once() {
        let mut state = ProbeState::new();
        state.observe(true, 3);
        assert_eq!(state.observe(false, 3), None);
        assert_eq!(state.observe(false, 3), None);
        assert_eq!(state.observe(false, 3), Some(false));
        assert_eq!(state.reachability(), Reachability::Down);

        // already down, further failures stay quiet
        assert_eq!(state.observe(false, 3), None);
        assert_eq!(state.observe(false, 3), None);
    }

    #[test]
    fn test_sub_threshold_success_resets_silently() {
        let mut state = ProbeState::new();
        assert_eq!(state.observe(true, 3), Some(true));
        assert_eq!(state.observe(false, 3), None);
        assert_eq!(state.observe(false, 3), None);
        // success before the third failure: no flip, no event
        assert_eq!(state.observe(true, 3), None);
        assert_eq!(state.reachability(), Reachability::Up);

        // counter was reset, two more failures still stay quiet
        assert_eq!(state.observe(false, 3), None);
        assert_eq!(state.observe(false, 3), None);
        assert_eq!(state.observe(false, 3), Some(false));
    }

    #[test]
    fn test_down_to_up_emits_once() {
        let mut state = ProbeState::new();
        assert_eq!(state.observe(false, 1), Some(false));
        assert_eq!(state.observe(true, 1), Some(true));
        assert_eq!(state.observe(true, 1), None);
    }

    #[test]
    fn test_unknown_gateway_goes_down_after_threshold() {
        let mut state = ProbeState::new();
        assert_eq!(state.observe(false, 2), None);
        assert_eq!(state.observe(false, 2), Some(false));
        assert_eq!(state.reachability(), Reachability::Down);
    }
}
