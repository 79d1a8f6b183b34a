use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::config::{KubeConfigOptions, Kubeconfig};
use mesh_mirror_cluster_watcher::{WatcherArgs, start_cluster_watcher};
use mesh_mirror_common::{
    Event, MIRROR_SECRET_TYPE, RemoteClusterCredentials, decode_credentials_secret,
};
use tracing::{info, warn};

use crate::Result;
use crate::context::{Context, Registration};

#[derive(Debug, PartialEq, Eq)]
enum RegistrationChange {
    Unchanged,
    GatewayChanged,
    CredentialsChanged,
}

fn is_mirror_secret(secret: &Secret) -> bool {
    secret.type_.as_deref() == Some(MIRROR_SECRET_TYPE)
}

/// Same cluster identity, so either nothing moved, only the gateway
/// metadata moved, or the remote credentials themselves were rotated.
fn classify_update(
    current: &Registration,
    credentials: &RemoteClusterCredentials,
) -> RegistrationChange {
    if current.resource_version == credentials.spec.resource_version {
        return RegistrationChange::Unchanged;
    }
    if current.kubeconfig != credentials.kubeconfig {
        return RegistrationChange::CredentialsChanged;
    }
    RegistrationChange::GatewayChanged
}

/// Add-or-update notification for a credentials secret. Malformed
/// input is logged and skipped; this handler must never take the
/// process down.
pub(crate) async fn apply(ctx: &Arc<Context>, secret: &Secret) {
    if !is_mirror_secret(secret) {
        return;
    }
    let credentials = match decode_credentials_secret(secret) {
        Ok(credentials) => credentials,
        Err(e) => {
            warn!(
                secret = %secret.name_any(),
                error = %e,
                "skipping malformed credentials secret"
            );
            return;
        }
    };
    let cluster = credentials.cluster_name().to_string();
    retire_renamed_cluster(ctx, &secret.name_any(), &cluster);

    let change = {
        let registrations = ctx.registrations.lock().expect("registrations lock");
        match registrations.get(&cluster) {
            None => None,
            Some(current) => Some(classify_update(current, &credentials)),
        }
    };

    match change {
        None => register(ctx.clone(), secret.name_any(), credentials).await,
        Some(RegistrationChange::Unchanged) => {}
        Some(RegistrationChange::GatewayChanged) => {
            info!(%cluster, "gateway config changed, updating in place");
            let watcher = {
                let mut registrations = ctx.registrations.lock().expect("registrations lock");
                // the registration can race a teardown between the two
                // lock scopes; a vanished entry means nothing to update
                let Some(current) = registrations.get_mut(&cluster) else {
                    return;
                };
                current.resource_version = credentials.spec.resource_version.clone();
                current.gateway = credentials.spec.clone();
                current.watcher.clone()
            };
            // the existing watcher absorbs the change, no restart
            watcher.send(Event::GatewayUpdated {
                spec: credentials.spec.clone(),
            });
            ctx.probes.update(credentials.spec, watcher.sink());
        }
        Some(RegistrationChange::CredentialsChanged) => {
            info!(%cluster, "remote credentials rotated, replacing watcher");
            let previous = {
                let mut registrations = ctx.registrations.lock().expect("registrations lock");
                registrations.remove(&cluster)
            };
            ctx.probes.deregister(&cluster);
            let ctx = ctx.clone();
            let secret_name = secret.name_any();
            // the old watcher drains in the background so this handler
            // returns without blocking notification delivery
            tokio::spawn(async move {
                if let Some(previous) = previous {
                    previous.watcher.request_shutdown();
                    previous.watcher.stopped().await;
                }
                register(ctx, secret_name, credentials).await;
            });
        }
    }
}

/// A secret whose config now names a different cluster retires the
/// registration it previously backed, mirrors included.
fn retire_renamed_cluster(ctx: &Arc<Context>, secret_name: &str, cluster: &str) {
    let stale = {
        let mut registrations = ctx.registrations.lock().expect("registrations lock");
        let renamed = registrations
            .iter()
            .find(|(name, registration)| {
                registration.secret_name == secret_name && name.as_str() != cluster
            })
            .map(|(name, _)| name.clone());
        renamed.and_then(|name| registrations.remove(&name))
    };
    if let Some(stale) = stale {
        let old_cluster = stale.gateway.cluster_name.clone();
        info!(%old_cluster, new_cluster = %cluster, "cluster renamed, retiring old registration");
        ctx.probes.deregister(&old_cluster);
        tokio::spawn(async move {
            stale.watcher.unregister().await;
        });
    }
}

/// Delete notification: tear the registration down. Mirror deletion
/// happens in the watcher's own queue, the handler only kicks it off.
pub(crate) async fn delete(ctx: &Arc<Context>, secret: &Secret) {
    if !is_mirror_secret(secret) {
        return;
    }
    let secret_name = secret.name_any();
    let removed = {
        let mut registrations = ctx.registrations.lock().expect("registrations lock");
        let cluster = registrations
            .iter()
            .find(|(_, registration)| registration.secret_name == secret_name)
            .map(|(cluster, _)| cluster.clone());
        cluster.and_then(|cluster| registrations.remove(&cluster))
    };
    let Some(registration) = removed else {
        return;
    };

    let cluster = registration.gateway.cluster_name.clone();
    info!(%cluster, secret = %secret_name, "cluster unregistered");
    ctx.probes.deregister(&cluster);
    tokio::spawn(async move {
        registration.watcher.unregister().await;
        info!(%cluster, "cluster watcher drained");
    });
}

/// Builds the remote client and spins up the cluster watcher plus its
/// gateway prober. The initial remote snapshot is primed inside the
/// watcher task, never here.
async fn register(ctx: Arc<Context>, secret_name: String, credentials: RemoteClusterCredentials) {
    let cluster = credentials.cluster_name().to_string();
    let remote_client = match build_remote_client(&credentials.kubeconfig).await {
        Ok(client) => client,
        Err(e) => {
            warn!(%cluster, error = %e, "cannot build remote cluster client, skipping");
            return;
        }
    };

    info!(%cluster, gateway = %credentials.spec, "registering remote cluster");
    let watcher = Arc::new(start_cluster_watcher(WatcherArgs {
        local_client: ctx.local_client.clone(),
        remote_client,
        gateway: credentials.spec.clone(),
        requeue_limit: ctx.requeue_limit,
        gc_period: ctx.gc_period,
        metrics: ctx.metrics.clone(),
    }));
    ctx.probes
        .register(credentials.spec.clone(), watcher.sink());

    let previous = {
        let mut registrations = ctx.registrations.lock().expect("registrations lock");
        registrations.insert(
            cluster.clone(),
            Registration {
                secret_name,
                resource_version: credentials.spec.resource_version.clone(),
                kubeconfig: credentials.kubeconfig,
                gateway: credentials.spec,
                watcher,
            },
        )
    };
    // a replaced registration keeps its mirrors, the new watcher
    // reasserts them from the fresh snapshot
    if let Some(previous) = previous {
        previous.watcher.request_shutdown();
    }
}

async fn build_remote_client(kubeconfig: &str) -> Result<kube::Client> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig)?;
    let config =
        kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(kube::Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use http::Uri;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use kube::config::Config;
    use mesh_mirror_cluster_watcher::QueueMetrics;
    use mesh_mirror_common::{GatewaySpec, ProbeConfig};
    use mesh_mirror_probe::{ProbeManager, ProbeMetrics};

    use super::*;

    fn test_client() -> kube::Client {
        let config = Config::new(Uri::from_static("http://localhost"));
        kube::Client::try_from(config).expect("test client")
    }

    fn make_spec(resource_version: &str) -> GatewaySpec {
        GatewaySpec {
            gateway_name: "gateway".into(),
            gateway_namespace: "mesh-gateway".into(),
            cluster_name: "east".into(),
            addresses: vec!["10.0.0.5".into()],
            incoming_port: 4143,
            resource_version: resource_version.into(),
            identity: "gateway.mesh-gateway.east".into(),
            probe: ProbeConfig {
                path: "/health".into(),
                port: 4181,
                period_seconds: 3,
            },
        }
    }

    fn make_registration(resource_version: &str, kubeconfig: &str) -> Registration {
        let ctx = make_context();
        let watcher = start_cluster_watcher(WatcherArgs {
            local_client: ctx.local_client.clone(),
            remote_client: test_client(),
            gateway: make_spec(resource_version),
            requeue_limit: 3,
            gc_period: std::time::Duration::from_secs(3600),
            metrics: QueueMetrics::default(),
        });
        Registration {
            secret_name: "cluster-east".into(),
            resource_version: resource_version.into(),
            kubeconfig: kubeconfig.into(),
            gateway: make_spec(resource_version),
            watcher: Arc::new(watcher),
        }
    }

    fn make_context() -> Arc<Context> {
        Arc::new(Context::new(
            test_client(),
            Arc::new(ProbeManager::new(3, ProbeMetrics::default()).expect("probes")),
            3,
            std::time::Duration::from_secs(3600),
            QueueMetrics::default(),
        ))
    }

    fn make_credentials(resource_version: &str, kubeconfig: &str) -> RemoteClusterCredentials {
        RemoteClusterCredentials {
            kubeconfig: kubeconfig.into(),
            spec: make_spec(resource_version),
        }
    }

    #[tokio::test]
    async fn test_classify_update() {
        let registration = make_registration("41", "kc-a");
        assert_eq!(
            classify_update(&registration, &make_credentials("41", "kc-a")),
            RegistrationChange::Unchanged
        );
        assert_eq!(
            classify_update(&registration, &make_credentials("42", "kc-a")),
            RegistrationChange::GatewayChanged
        );
        assert_eq!(
            classify_update(&registration, &make_credentials("42", "kc-b")),
            RegistrationChange::CredentialsChanged
        );
        registration.watcher.request_shutdown();
    }

    #[tokio::test]
    async fn test_apply_ignores_foreign_secrets() {
        let ctx = make_context();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("not-ours".into()),
                ..Default::default()
            },
            type_: Some("Opaque".into()),
            ..Default::default()
        };
        apply(&ctx, &secret).await;
        assert!(ctx.registrations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_skips_malformed_secret() {
        let ctx = make_context();
        let mut data = BTreeMap::new();
        data.insert("config".to_string(), ByteString(b"{nope".to_vec()));
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("cluster-east".into()),
                resource_version: Some("41".into()),
                ..Default::default()
            },
            data: Some(data),
            type_: Some(MIRROR_SECRET_TYPE.into()),
            ..Default::default()
        };
        apply(&ctx, &secret).await;
        assert!(ctx.registrations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_secret_is_a_noop() {
        let ctx = make_context();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some("never-registered".into()),
                ..Default::default()
            },
            type_: Some(MIRROR_SECRET_TYPE.into()),
            ..Default::default()
        };
        delete(&ctx, &secret).await;
        assert!(ctx.registrations.lock().unwrap().is_empty());
    }
}
