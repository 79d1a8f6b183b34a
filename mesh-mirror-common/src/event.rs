use std::fmt;

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;

use crate::gateway::GatewaySpec;

/// One reconciliation event for a cluster watcher's queue. Tagged union,
/// consumed exactly once by the owning queue's consumer.
#[derive(Clone, Debug)]
pub enum Event {
    /// A qualifying remote service appeared.
    RemoteServiceCreated { service: Service },
    /// A remote service or its endpoints changed.
    RemoteServiceUpdated { service: Service },
    /// A remote service went away.
    RemoteServiceDeleted { name: String, namespace: String },
    /// The cluster's gateway was registered.
    GatewayCreated { spec: GatewaySpec },
    /// The cluster's gateway config changed.
    GatewayUpdated { spec: GatewaySpec },
    /// The cluster's gateway config went away.
    GatewayDeleted,
    /// The gateway's reachability flipped, reported by its probe worker.
    ProbeTransition { reachable: bool },
    /// A local mirror was observed changing out-of-band.
    LocalMirrorChanged { name: String, namespace: String },
    /// The registry tore down this cluster's registration.
    ClusterUnregistered,
    /// Periodic or manual orphan sweep.
    OrphanSweepTriggered,
}

impl Event {
    /// The variant tag, used for structured logging and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RemoteServiceCreated { .. } => "RemoteServiceCreated",
            Event::RemoteServiceUpdated { .. } => "RemoteServiceUpdated",
            Event::RemoteServiceDeleted { .. } => "RemoteServiceDeleted",
            Event::GatewayCreated { .. } => "GatewayCreated",
            Event::GatewayUpdated { .. } => "GatewayUpdated",
            Event::GatewayDeleted => "GatewayDeleted",
            Event::ProbeTransition { .. } => "ProbeTransition",
            Event::LocalMirrorChanged { .. } => "LocalMirrorChanged",
            Event::ClusterUnregistered => "ClusterUnregistered",
            Event::OrphanSweepTriggered => "OrphanSweepTriggered",
        }
    }
}

// Structured rendering keyed by the variant tag. Debug support only,
// the reconciler dispatches on the enum itself.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.kind())?;
        match self {
            Event::RemoteServiceCreated { service } | Event::RemoteServiceUpdated { service } => {
                write!(f, "service: {}", format_service(service))?;
            }
            Event::RemoteServiceDeleted { name, namespace }
            | Event::LocalMirrorChanged { name, namespace } => {
                write!(f, "name: {namespace}/{name}")?;
            }
            Event::GatewayCreated { spec } | Event::GatewayUpdated { spec } => {
                write!(f, "spec: {spec}")?;
            }
            Event::ProbeTransition { reachable } => {
                write!(f, "reachable: {reachable}")?;
            }
            Event::GatewayDeleted | Event::ClusterUnregistered | Event::OrphanSweepTriggered => {}
        }
        write!(f, "}}")
    }
}

impl fmt::Display for GatewaySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GatewaySpec{{gateway: {}/{}, cluster: {}, addresses: [{}], incomingPort: {}, resourceVersion: {}, probe: :{}{} every {}s}}",
            self.gateway_namespace,
            self.gateway_name,
            self.cluster_name,
            self.addresses.join(","),
            self.incoming_port,
            self.resource_version,
            self.probe.port,
            self.probe.path,
            self.probe.period_seconds,
        )
    }
}

fn format_service(service: &Service) -> String {
    format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    )
}

#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn test_display_carries_variant_tag() {
        let service = Service {
            metadata: ObjectMeta {
                name: Some("foo".into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        let rendered = Event::RemoteServiceCreated { service }.to_string();
        assert_eq!(rendered, "RemoteServiceCreated{service: default/foo}");

        let rendered = Event::ProbeTransition { reachable: false }.to_string();
        assert_eq!(rendered, "ProbeTransition{reachable: false}");

        let rendered = Event::ClusterUnregistered.to_string();
        assert_eq!(rendered, "ClusterUnregistered{}");
    }
}
