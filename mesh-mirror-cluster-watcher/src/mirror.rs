use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use mesh_mirror_common::{
    CLUSTER_NAME_LABEL, EXPORTED_ANNOTATION, GATEWAY_ALIVE_ANNOTATION, GatewaySpec,
    MIRRORED_SERVICE_LABEL, REMOTE_GATEWAY_IDENTITY_ANNOTATION, REMOTE_GATEWAY_NAME_LABEL,
    REMOTE_GATEWAY_NS_LABEL, REMOTE_GATEWAY_RESOURCE_VERSION_ANNOTATION,
    REMOTE_RESOURCE_VERSION_ANNOTATION, REMOTE_SVC_FQ_NAME_ANNOTATION,
};

/// A remote service mirrors locally only when it opted in explicitly
/// and is not itself a mirror. The second check breaks mirror cycles
/// between two clusters mirroring each other.
pub(crate) fn qualifies(service: &Service) -> bool {
    let exported = service
        .annotations()
        .get(EXPORTED_ANNOTATION)
        .is_some_and(|v| v == "true");
    exported && !service.labels().contains_key(MIRRORED_SERVICE_LABEL)
}

pub(crate) fn mirror_name(remote_name: &str, cluster_name: &str) -> String {
    format!("{remote_name}-{cluster_name}")
}

/// Inverse of `mirror_name`. None means the object does not follow the
/// mirror naming scheme for this cluster.
pub(crate) fn remote_service_name(mirror_name: &str, cluster_name: &str) -> Option<String> {
    mirror_name
        .strip_suffix(&format!("-{cluster_name}"))
        .filter(|remote| !remote.is_empty())
        .map(Into::into)
}

/// Label selector matching every mirror owned by one cluster.
pub(crate) fn mirror_selector(cluster_name: &str) -> String {
    format!("{MIRRORED_SERVICE_LABEL}=true,{CLUSTER_NAME_LABEL}={cluster_name}")
}

/// Current availability flag on a mirror. Absent means available: a
/// fresh mirror serves until its gateway is proven dead.
pub(crate) fn alive_annotation(service: &Service) -> bool {
    service
        .annotations()
        .get(GATEWAY_ALIVE_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(true)
}

/// Desired mirror Service for a qualifying remote service. Carries the
/// origin bookkeeping in labels/annotations; never a selector, since
/// its endpoints are written by hand.
pub(crate) fn desired_service(
    remote: &Service,
    gateway: Option<&GatewaySpec>,
    cluster_name: &str,
    alive: bool,
) -> Service {
    let remote_name = remote.name_any();
    let namespace = remote.namespace().unwrap_or_default();

    let mut labels = BTreeMap::new();
    labels.insert(MIRRORED_SERVICE_LABEL.to_string(), "true".to_string());
    labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert(
        REMOTE_RESOURCE_VERSION_ANNOTATION.to_string(),
        remote.resource_version().unwrap_or_default(),
    );
    annotations.insert(
        REMOTE_SVC_FQ_NAME_ANNOTATION.to_string(),
        format!("{remote_name}.{namespace}.svc.cluster.local"),
    );
    annotations.insert(GATEWAY_ALIVE_ANNOTATION.to_string(), alive.to_string());

    if let Some(gateway) = gateway {
        labels.insert(
            REMOTE_GATEWAY_NAME_LABEL.to_string(),
            gateway.gateway_name.clone(),
        );
        labels.insert(
            REMOTE_GATEWAY_NS_LABEL.to_string(),
            gateway.gateway_namespace.clone(),
        );
        annotations.insert(
            REMOTE_GATEWAY_RESOURCE_VERSION_ANNOTATION.to_string(),
            gateway.resource_version.clone(),
        );
        annotations.insert(
            REMOTE_GATEWAY_IDENTITY_ANNOTATION.to_string(),
            gateway.identity.clone(),
        );
    }

    Service {
        metadata: ObjectMeta {
            name: Some(mirror_name(&remote_name, cluster_name)),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: remote.spec.as_ref().and_then(|spec| {
                spec.ports.as_ref().map(|ports| {
                    ports
                        .iter()
                        .map(|port| ServicePort {
                            name: port.name.clone(),
                            port: port.port,
                            protocol: port.protocol.clone(),
                            ..Default::default()
                        })
                        .collect()
                })
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Desired mirror Endpoints. Every subset address resolves through the
/// gateway, never to a remote pod address, which would be unroutable
/// from this cluster. No gateway means no subsets.
pub(crate) fn desired_endpoints(
    mirror: &Service,
    remote: &Service,
    gateway: Option<&GatewaySpec>,
) -> Endpoints {
    let subsets = gateway.filter(|gw| !gw.addresses.is_empty()).map(|gw| {
        let addresses = gw
            .addresses
            .iter()
            .map(|ip| EndpointAddress {
                ip: ip.clone(),
                ..Default::default()
            })
            .collect();
        let ports = remote.spec.as_ref().and_then(|spec| {
            spec.ports.as_ref().map(|ports| {
                ports
                    .iter()
                    .map(|port| EndpointPort {
                        name: port.name.clone(),
                        port: i32::from(gw.incoming_port),
                        protocol: port.protocol.clone(),
                        ..Default::default()
                    })
                    .collect()
            })
        });
        vec![EndpointSubset {
            addresses: Some(addresses),
            ports,
            ..Default::default()
        }]
    });

    Endpoints {
        metadata: ObjectMeta {
            name: mirror.metadata.name.clone(),
            namespace: mirror.metadata.namespace.clone(),
            labels: mirror.metadata.labels.clone(),
            owner_references: Some(vec![owner_reference(mirror)]),
            ..Default::default()
        },
        subsets,
    }
}

/// A mirror needs no write when its bookkeeping and ports already match
/// the desired object. Checked against the cached copy to save a
/// network request.
pub(crate) fn mirror_up_to_date(current: &Service, desired: &Service) -> bool {
    let labels_match = desired
        .labels()
        .iter()
        .all(|(k, v)| current.labels().get(k) == Some(v));
    let annotations_match = desired
        .annotations()
        .iter()
        .all(|(k, v)| current.annotations().get(k) == Some(v));
    let ports_match = current.spec.as_ref().and_then(|spec| spec.ports.as_ref())
        == desired.spec.as_ref().and_then(|spec| spec.ports.as_ref());
    labels_match && annotations_match && ports_match
}

fn owner_reference(service: &Service) -> OwnerReference {
    OwnerReference {
        api_version: "v1".into(),
        block_owner_deletion: Some(true),
        controller: Some(true),
        kind: "Service".into(),
        name: service.name_any(),
        uid: service.uid().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use mesh_mirror_common::ProbeConfig;

    use super::*;

    fn make_gateway() -> GatewaySpec {
        GatewaySpec {
            gateway_name: "gateway".into(),
            gateway_namespace: "mesh-gateway".into(),
            cluster_name: "east".into(),
            addresses: vec!["10.0.0.5".into()],
            incoming_port: 4143,
            resource_version: "41".into(),
            identity: "gateway.mesh-gateway.east".into(),
            probe: ProbeConfig {
                path: "/health".into(),
                port: 4181,
                period_seconds: 3,
            },
        }
    }

    fn make_remote(name: &str, exported: bool) -> Service {
        let mut annotations = BTreeMap::new();
        if exported {
            annotations.insert(EXPORTED_ANNOTATION.into(), "true".into());
        }
        Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                resource_version: Some("7".into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some("http".into()),
                    port: 8080,
                    protocol: Some("TCP".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_qualification_requires_export_annotation() {
        assert!(qualifies(&make_remote("foo", true)));
        assert!(!qualifies(&make_remote("foo", false)));
    }

    #[test]
    fn test_qualification_rejects_existing_mirrors() {
        let mut service = make_remote("foo-west", true);
        let mut labels = BTreeMap::new();
        labels.insert(MIRRORED_SERVICE_LABEL.into(), "true".into());
        service.metadata.labels = Some(labels);
        assert!(!qualifies(&service));
    }

    #[test]
    fn test_mirror_naming_round_trip() {
        assert_eq!(mirror_name("foo", "east"), "foo-east");
        assert_eq!(
            remote_service_name("foo-east", "east").as_deref(),
            Some("foo")
        );
        assert_eq!(remote_service_name("foo-west", "east"), None);
        assert_eq!(remote_service_name("-east", "east"), None);
    }

    #[test]
    fn test_mirror_selector_scopes_to_one_cluster() {
        assert_eq!(
            mirror_selector("east"),
            "mirror.mesh.dev/mirrored-service=true,mirror.mesh.dev/cluster-name=east"
        );
    }

    #[test]
    fn test_mirror_rewrites_endpoints_to_gateway() {
        let remote = make_remote("foo", true);
        let gateway = make_gateway();

        let mirror = desired_service(&remote, Some(&gateway), "east", true);
        assert_eq!(mirror.metadata.name.as_deref(), Some("foo-east"));
        assert_eq!(mirror.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(
            mirror.labels().get(CLUSTER_NAME_LABEL).map(String::as_str),
            Some("east")
        );
        assert_eq!(
            mirror
                .annotations()
                .get(GATEWAY_ALIVE_ANNOTATION)
                .map(String::as_str),
            Some("true")
        );
        assert_eq!(
            mirror
                .annotations()
                .get(REMOTE_SVC_FQ_NAME_ANNOTATION)
                .map(String::as_str),
            Some("foo.default.svc.cluster.local")
        );
        // mirrors never select local pods
        assert!(mirror.spec.as_ref().unwrap().selector.is_none());

        let endpoints = desired_endpoints(&mirror, &remote, Some(&gateway));
        let subsets = endpoints.subsets.expect("subsets");
        assert_eq!(subsets.len(), 1);
        let addresses = subsets[0].addresses.as_ref().expect("addresses");
        assert_eq!(addresses.len(), 1);
        assert_eq!(addresses[0].ip, "10.0.0.5");
        let ports = subsets[0].ports.as_ref().expect("ports");
        assert_eq!(ports[0].port, 4143);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn test_mirror_without_gateway_has_no_subsets() {
        let remote = make_remote("foo", true);
        let mirror = desired_service(&remote, None, "east", false);
        assert_eq!(
            mirror
                .annotations()
                .get(GATEWAY_ALIVE_ANNOTATION)
                .map(String::as_str),
            Some("false")
        );
        let endpoints = desired_endpoints(&mirror, &remote, None);
        assert!(endpoints.subsets.is_none());
    }

    #[test]
    fn test_mirror_up_to_date_ignores_foreign_annotations() {
        let remote = make_remote("foo", true);
        let gateway = make_gateway();
        let desired = desired_service(&remote, Some(&gateway), "east", true);

        let mut current = desired.clone();
        current
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert("unrelated/annotation".into(), "kept".into());
        assert!(mirror_up_to_date(&current, &desired));

        let stale = desired_service(&make_remote("foo", true), None, "east", true);
        assert!(!mirror_up_to_date(&stale, &desired));
    }
}
