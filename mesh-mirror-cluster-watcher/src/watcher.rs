use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, ResourceExt};
use mesh_mirror_common::{
    Event, EventQueue, GATEWAY_ALIVE_ANNOTATION, GatewaySpec, QueueHandle, QueuedEvent,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::context::{Context, WatcherLifecycleHandle, WatcherState};
use crate::mirror::{
    alive_annotation, desired_endpoints, desired_service, mirror_name, mirror_selector,
    mirror_up_to_date, qualifies, remote_service_name,
};

const MANAGER: &str = "mesh-mirror-cluster-watcher";

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Unregistered,
}

#[derive(Debug, PartialEq, Eq)]
enum Retry {
    Requeue(u32),
    Drop,
}

/// Bounded retry: an event is attempted at most `limit` times in total,
/// then dropped so one poisoned event cannot grow the queue forever.
fn retry_disposition(attempts: u32, limit: u32) -> Retry {
    let attempts = attempts + 1;
    if attempts >= limit {
        Retry::Drop
    } else {
        Retry::Requeue(attempts)
    }
}

/// Per-cluster reconciler. Consumes its queue strictly FIFO; all mirror
/// mutation for the cluster happens on this task.
pub(crate) struct ClusterWatcher {
    ctx: Context,
    queue: EventQueue,
    queue_handle: QueueHandle,
    gateway: Option<GatewaySpec>,
    /// Last reported gateway reachability. Optimistic until the first
    /// probe transition: a fresh mirror serves until proven otherwise.
    gateway_alive: bool,
}

impl ClusterWatcher {
    pub(crate) fn new(ctx: Context, queue: EventQueue, queue_handle: QueueHandle) -> Self {
        Self {
            ctx,
            queue,
            queue_handle,
            gateway: None,
            gateway_alive: true,
        }
    }

    pub(crate) async fn run(
        mut self,
        cancel: CancellationToken,
        lifecycle: WatcherLifecycleHandle,
    ) {
        let cluster = self.ctx.cluster_name.clone();
        lifecycle.enter(WatcherState::Running);
        info!(%cluster, "cluster watcher running");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    lifecycle.enter(WatcherState::Stopping);
                    self.queue_handle.close();
                    self.drain().await;
                    break;
                }
                queued = self.queue.recv() => match queued {
                    Some(queued) => {
                        if self.step(queued).await == Flow::Unregistered {
                            lifecycle.enter(WatcherState::Stopping);
                            self.queue_handle.close();
                            self.discard_rest();
                            break;
                        }
                    }
                    None => break,
                }
            }
        }

        lifecycle.enter(WatcherState::Stopped);
        info!(%cluster, "cluster watcher stopped");
    }

    /// Processes everything already enqueued, retry policy included,
    /// before shutting down. Never silently discards in-flight work.
    async fn drain(&mut self) {
        while let Some(queued) = self.queue.try_recv() {
            if self.step(queued).await == Flow::Unregistered {
                self.discard_rest();
                return;
            }
        }
    }

    /// Once the cluster is unregistered its mirrors are gone; anything
    /// still queued behind the teardown is meaningless.
    fn discard_rest(&mut self) {
        while let Some(queued) = self.queue.try_recv() {
            debug!(event = %queued.event, "discarding event after unregistration");
        }
    }

    async fn step(&mut self, queued: QueuedEvent) -> Flow {
        match self.handle_event(&queued.event).await {
            Ok(flow) => flow,
            Err(e) => {
                match retry_disposition(queued.attempts, self.ctx.requeue_limit) {
                    Retry::Requeue(attempts) => {
                        self.ctx.metrics.observe_requeue(&self.ctx.cluster_name);
                        warn!(event = %queued.event, error = %e, attempts, "requeueing failed event");
                        self.queue_handle.requeue(QueuedEvent {
                            event: queued.event,
                            attempts,
                        });
                    }
                    Retry::Drop => {
                        self.ctx.metrics.observe_drop(&self.ctx.cluster_name);
                        error!(
                            event = %queued.event,
                            error = %e,
                            limit = self.ctx.requeue_limit,
                            "dropping event, requeue limit exceeded"
                        );
                    }
                }
                Flow::Continue
            }
        }
    }

    async fn handle_event(&mut self, event: &Event) -> Result<Flow> {
        debug!(cluster = %self.ctx.cluster_name, event = %event, "handling event");
        match event {
            Event::RemoteServiceCreated { service } | Event::RemoteServiceUpdated { service } => {
                self.apply_mirror(service, false).await?;
            }
            Event::RemoteServiceDeleted { name, namespace } => {
                self.delete_mirror(name, namespace).await?;
            }
            Event::GatewayCreated { spec } | Event::GatewayUpdated { spec } => {
                self.bind_gateway(spec.clone()).await?;
            }
            Event::GatewayDeleted => {
                self.gateway = None;
                self.set_alive(false).await?;
            }
            Event::ProbeTransition { reachable } => {
                self.set_alive(*reachable).await?;
            }
            Event::LocalMirrorChanged { name, namespace } => {
                self.reassert_mirror(name, namespace).await?;
            }
            Event::ClusterUnregistered => {
                self.unregister().await?;
                return Ok(Flow::Unregistered);
            }
            Event::OrphanSweepTriggered => {
                self.sweep_orphans().await?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Creates or converges the mirror pair for one remote service.
    /// `force` skips the cached no-op check, used when reasserting
    /// after observed drift.
    async fn apply_mirror(&self, remote: &Service, force: bool) -> Result<()> {
        let Some(namespace) = remote.namespace() else {
            warn!(service = %remote.name_any(), "remote service has no namespace, skipping");
            return Ok(());
        };
        let cluster = &self.ctx.cluster_name;
        let name = mirror_name(&remote.name_any(), cluster);

        let current = self
            .ctx
            .local_mirrors
            .get(&ObjectRef::new(&name).within(&namespace));
        let desired = desired_service(remote, self.gateway.as_ref(), cluster, self.gateway_alive);

        if !force
            && let Some(current) = &current
            && mirror_up_to_date(current, &desired)
        {
            return Ok(());
        }

        let params = PatchParams::apply(MANAGER).force();
        let services: Api<Service> = Api::namespaced(self.ctx.client.clone(), &namespace);
        let applied = services.patch(&name, &params, &Patch::Apply(&desired)).await?;

        let endpoints = desired_endpoints(&applied, remote, self.gateway.as_ref());
        let endpoints_api: Api<Endpoints> = Api::namespaced(self.ctx.client.clone(), &namespace);
        endpoints_api
            .patch(&name, &params, &Patch::Apply(&endpoints))
            .await?;

        info!(cluster = %cluster, mirror = %format!("{namespace}/{name}"), "converged mirror");
        Ok(())
    }

    async fn delete_mirror(&self, remote_name: &str, namespace: &str) -> Result<()> {
        let name = mirror_name(remote_name, &self.ctx.cluster_name);
        self.delete_named(&name, namespace).await
    }

    async fn delete_named(&self, name: &str, namespace: &str) -> Result<()> {
        let services: Api<Service> = Api::namespaced(self.ctx.client.clone(), namespace);
        ignore_not_found(services.delete(name, &DeleteParams::default()).await)?;
        let endpoints: Api<Endpoints> = Api::namespaced(self.ctx.client.clone(), namespace);
        ignore_not_found(endpoints.delete(name, &DeleteParams::default()).await)?;
        info!(
            cluster = %self.ctx.cluster_name,
            mirror = %format!("{namespace}/{name}"),
            "deleted mirror"
        );
        Ok(())
    }

    /// Binds a new gateway spec and rewrites every owned mirror's
    /// endpoints to the new addresses and port. Mirrors of other
    /// clusters are untouched: the local store only holds our own.
    async fn bind_gateway(&mut self, spec: GatewaySpec) -> Result<()> {
        info!(cluster = %self.ctx.cluster_name, gateway = %spec, "binding gateway");
        self.gateway = Some(spec);

        for mirror in self.ctx.local_mirrors.state() {
            let Some(remote) = self.remote_origin(&mirror) else {
                // stale mirror, the orphan sweep will collect it
                continue;
            };
            self.apply_mirror(&remote, true).await?;
        }
        Ok(())
    }

    /// Flips the availability annotation on every owned mirror. Never
    /// deletes anything: an unreachable gateway is not a vanished
    /// service.
    async fn set_alive(&mut self, reachable: bool) -> Result<()> {
        info!(cluster = %self.ctx.cluster_name, reachable, "marking mirrors");
        self.gateway_alive = reachable;
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    GATEWAY_ALIVE_ANNOTATION: reachable.to_string(),
                }
            }
        });
        for mirror in self.ctx.local_mirrors.state() {
            if alive_annotation(&mirror) == reachable {
                continue;
            }
            let Some(namespace) = mirror.namespace() else {
                continue;
            };
            let services: Api<Service> = Api::namespaced(self.ctx.client.clone(), &namespace);
            services
                .patch(
                    &mirror.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(&patch),
                )
                .await?;
        }
        Ok(())
    }

    /// A local mirror changed out-of-band: reassert the desired state,
    /// or remove it when no live remote origin backs it.
    async fn reassert_mirror(&self, name: &str, namespace: &str) -> Result<()> {
        let Some(remote_name) = remote_service_name(name, &self.ctx.cluster_name) else {
            // carries our labels but not our naming scheme
            return self.delete_named(name, namespace).await;
        };
        match self.lookup_remote(&remote_name, namespace) {
            Some(remote) if qualifies(&remote) => self.apply_mirror(&remote, true).await,
            _ => self.delete_mirror(&remote_name, namespace).await,
        }
    }

    /// Removes every mirror owned by this cluster. Listed through the
    /// API rather than the cache so nothing is left behind on teardown.
    async fn unregister(&self) -> Result<()> {
        info!(cluster = %self.ctx.cluster_name, "unregistering cluster, removing all mirrors");
        let params = ListParams::default().labels(&mirror_selector(&self.ctx.cluster_name));
        let services: Api<Service> = Api::all(self.ctx.client.clone());
        for mirror in services.list(&params).await? {
            let Some(namespace) = mirror.namespace() else {
                continue;
            };
            self.delete_named(&mirror.name_any(), &namespace).await?;
        }
        Ok(())
    }

    /// Safety net for dropped or reordered notifications: removes any
    /// owned mirror without a live remote origin.
    async fn sweep_orphans(&self) -> Result<()> {
        let orphans = orphaned_mirrors(
            self.ctx.local_mirrors.state(),
            |name, namespace| self.lookup_remote(name, namespace),
            &self.ctx.cluster_name,
        );
        for (name, namespace) in orphans {
            info!(
                cluster = %self.ctx.cluster_name,
                mirror = %format!("{namespace}/{name}"),
                "sweeping orphaned mirror"
            );
            self.delete_named(&name, &namespace).await?;
        }
        Ok(())
    }

    fn remote_origin(&self, mirror: &Service) -> Option<Service> {
        let remote_name = remote_service_name(&mirror.name_any(), &self.ctx.cluster_name)?;
        let namespace = mirror.namespace()?;
        self.lookup_remote(&remote_name, &namespace)
            .filter(qualifies)
    }

    fn lookup_remote(&self, name: &str, namespace: &str) -> Option<Service> {
        self.ctx
            .remote_services
            .get(&ObjectRef::new(name).within(namespace))
            .map(|service| (*service).clone())
    }
}

/// Mirrors to delete: anything whose name does not map back to a live,
/// still-qualifying remote service.
fn orphaned_mirrors(
    mirrors: Vec<Arc<Service>>,
    lookup_remote: impl Fn(&str, &str) -> Option<Service>,
    cluster_name: &str,
) -> Vec<(String, String)> {
    let mut orphans = Vec::new();
    for mirror in mirrors {
        let name = mirror.name_any();
        let Some(namespace) = mirror.namespace() else {
            continue;
        };
        let live = remote_service_name(&name, cluster_name)
            .and_then(|remote_name| lookup_remote(&remote_name, &namespace))
            .is_some_and(|remote| qualifies(&remote));
        if !live {
            orphans.push((name, namespace));
        }
    }
    orphans
}

fn ignore_not_found<T>(result: kube::Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
