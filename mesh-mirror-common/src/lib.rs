pub mod event;
pub mod gateway;
pub mod queue;

pub use event::Event;
pub use gateway::{
    DecodeError, GatewayConfig, GatewaySpec, ProbeConfig, RemoteClusterCredentials,
    decode_credentials_secret,
};
pub use queue::{EventQueue, EventSink, QueueHandle, QueuedEvent, event_queue};

/// Prefix common to all labels and annotations owned by the mirror engine.
pub const MIRROR_PREFIX: &str = "mirror.mesh.dev";

/// Secret type that carries remote cluster credentials and gateway config.
pub const MIRROR_SECRET_TYPE: &str = "mirror.mesh.dev/remote-kubeconfig";

/// Secret data key holding the remote kubeconfig.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Secret data key holding the YAML gateway config document.
pub const GATEWAY_CONFIG_KEY: &str = "config";

/// Annotation on a remote Service opting it into mirroring.
pub const EXPORTED_ANNOTATION: &str = "mirror.mesh.dev/exported";

/// Label marking a local Service as the product of a mirroring operation.
/// Remote services carrying it are never mirrored again, which breaks
/// mirror cycles between two clusters mirroring each other.
pub const MIRRORED_SERVICE_LABEL: &str = "mirror.mesh.dev/mirrored-service";

/// Label associating a mirror with the remote cluster that owns it.
pub const CLUSTER_NAME_LABEL: &str = "mirror.mesh.dev/cluster-name";

/// Labels associating a mirror with its gateway, for reverse lookups.
pub const REMOTE_GATEWAY_NAME_LABEL: &str = "mirror.mesh.dev/remote-gateway-name";
pub const REMOTE_GATEWAY_NS_LABEL: &str = "mirror.mesh.dev/remote-gateway-ns";

/// Last observed resourceVersion of the mirrored remote service.
pub const REMOTE_RESOURCE_VERSION_ANNOTATION: &str = "mirror.mesh.dev/remote-resource-version";

/// Fully qualified name of the remote service behind a mirror.
pub const REMOTE_SVC_FQ_NAME_ANNOTATION: &str = "mirror.mesh.dev/remote-svc-fq-name";

/// Last observed resourceVersion of the gateway bound to a mirror.
pub const REMOTE_GATEWAY_RESOURCE_VERSION_ANNOTATION: &str =
    "mirror.mesh.dev/remote-gateway-resource-version";

/// TLS identity of the gateway bound to a mirror.
pub const REMOTE_GATEWAY_IDENTITY_ANNOTATION: &str = "mirror.mesh.dev/remote-gateway-identity";

/// Availability flag on a mirror, driven solely by gateway probe results.
pub const GATEWAY_ALIVE_ANNOTATION: &str = "mirror.mesh.dev/gateway-alive";
