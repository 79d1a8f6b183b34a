use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use ahash::{HashSet, HashSetExt};
use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Api, ResourceExt};
use mesh_mirror_common::{Event, EventSink, GatewaySpec, QueueHandle, event_queue};
use mesh_mirror_k8s_utils::{await_store_ready, watch_with_store};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::{Context, WatcherLifecycle, WatcherLifecycleHandle, WatcherState};
use crate::metrics::QueueMetrics;
use crate::mirror::{mirror_selector, qualifies};
use crate::watcher::ClusterWatcher;

const STORE_READY_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WatcherArgs {
    pub local_client: kube::Client,
    pub remote_client: kube::Client,
    pub gateway: GatewaySpec,
    pub requeue_limit: u32,
    pub gc_period: Duration,
    pub metrics: QueueMetrics,
}

/// Registry-facing handle to one running cluster watcher.
pub struct ClusterHandle {
    cluster_name: String,
    queue: QueueHandle,
    lifecycle: WatcherLifecycle,
}

impl ClusterHandle {
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn send(&self, event: Event) -> bool {
        self.queue.send(event)
    }

    /// The sink handed to this cluster's probe worker. Probe tasks
    /// enqueue through it and never touch mirror state directly.
    pub fn sink(&self) -> Arc<dyn EventSink> {
        Arc::new(self.queue.clone())
    }

    /// Tears the registration down: every owned mirror is deleted, the
    /// queue is drained, and the consumer exits. Resolves when done.
    pub async fn unregister(&self) {
        self.queue.send(Event::ClusterUnregistered);
        self.queue.close();
        self.lifecycle.stopped().await;
    }

    /// Stops the watcher without touching its mirrors, for process
    /// shutdown. Idempotent.
    pub fn request_shutdown(&self) {
        self.lifecycle.request_shutdown();
    }

    pub async fn stopped(&self) {
        self.lifecycle.stopped().await;
    }

    pub fn state(&self) -> WatcherState {
        self.lifecycle.state()
    }
}

/// Spawns the whole per-cluster machinery: watch pumps, GC ticker and
/// the queue consumer. Returns immediately; the initial remote
/// snapshot is primed inside the spawned task, never on the caller.
pub fn start_cluster_watcher(args: WatcherArgs) -> ClusterHandle {
    let cluster_name = args.gateway.cluster_name.clone();
    let (queue_handle, queue) = event_queue();
    let (lifecycle, lifecycle_handle) = WatcherLifecycle::new();

    // bind the gateway ahead of any discovery event in the FIFO
    queue_handle.send(Event::GatewayCreated {
        spec: args.gateway.clone(),
    });

    tokio::spawn(run_watcher(
        args,
        queue,
        queue_handle.clone(),
        lifecycle_handle,
    ));

    ClusterHandle {
        cluster_name,
        queue: queue_handle,
        lifecycle,
    }
}

async fn run_watcher(
    args: WatcherArgs,
    queue: mesh_mirror_common::EventQueue,
    queue_handle: QueueHandle,
    lifecycle_handle: WatcherLifecycleHandle,
) {
    let cluster = args.gateway.cluster_name.clone();
    let cancel = lifecycle_handle.cancel_token();
    info!(%cluster, "cluster watcher starting");

    let (remote_services, remote_stream) = watch_with_store(
        Api::<Service>::all(args.remote_client.clone()),
        watcher::Config::default(),
    );
    let selector = mirror_selector(&cluster);
    let (local_mirrors, local_stream) = watch_with_store(
        Api::<Service>::all(args.local_client.clone()),
        watcher::Config::default().labels(&selector),
    );

    tokio::spawn(pump_remote_services(
        remote_stream,
        queue_handle.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(pump_remote_endpoints(
        watcher(
            Api::<Endpoints>::all(args.remote_client.clone()),
            watcher::Config::default(),
        )
        .default_backoff(),
        remote_services.clone(),
        queue_handle.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(pump_local_mirrors(
        local_stream,
        queue_handle.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(pump_local_endpoints(
        watcher(
            Api::<Endpoints>::all(args.local_client.clone()),
            watcher::Config::default().labels(&selector),
        )
        .default_backoff(),
        queue_handle.clone(),
        cancel.child_token(),
    ));
    tokio::spawn(gc_ticker(
        args.gc_period,
        queue_handle.clone(),
        cancel.child_token(),
    ));

    // the watch's initial list primes the queue; consumption starts
    // once both caches are warm
    for (store, what) in [(&remote_services, "remote"), (&local_mirrors, "local")] {
        if let Err(e) = await_store_ready(store, STORE_READY_TIMEOUT).await {
            error!(%cluster, what, error = %e, "store never became ready, stopping watcher");
            cancel.cancel();
            lifecycle_handle.enter(WatcherState::Stopped);
            return;
        }
    }

    let ctx = Context {
        client: args.local_client,
        cluster_name: cluster,
        remote_services,
        local_mirrors,
        requeue_limit: args.requeue_limit,
        metrics: args.metrics,
    };
    ClusterWatcher::new(ctx, queue, queue_handle)
        .run(cancel.clone(), lifecycle_handle)
        .await;

    // consumer is done, take the pumps down with it
    cancel.cancel();
}

/// Translates remote service watch events into queue events. Tracks
/// which services have been announced so the first sighting is a
/// creation, later ones updates, and an unexported service retires its
/// mirror like a deletion would.
fn classify_remote_apply(announced: &mut HashSet<String>, service: Service) -> Option<Event> {
    let key = format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    );
    if qualifies(&service) {
        if announced.insert(key) {
            Some(Event::RemoteServiceCreated { service })
        } else {
            Some(Event::RemoteServiceUpdated { service })
        }
    } else if announced.remove(&key) {
        Some(Event::RemoteServiceDeleted {
            name: service.name_any(),
            namespace: service.namespace().unwrap_or_default(),
        })
    } else {
        None
    }
}

fn classify_remote_delete(announced: &mut HashSet<String>, service: &Service) -> Option<Event> {
    let key = format!(
        "{}/{}",
        service.namespace().unwrap_or_default(),
        service.name_any()
    );
    announced.remove(&key).then(|| Event::RemoteServiceDeleted {
        name: service.name_any(),
        namespace: service.namespace().unwrap_or_default(),
    })
}

async fn pump_remote_services(
    stream: impl Stream<Item = Result<watcher::Event<Service>, watcher::Error>>,
    queue: QueueHandle,
    cancel: CancellationToken,
) {
    let mut announced = HashSet::new();
    let mut stream = pin!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                None => break,
                Some(Err(e)) => error!(error = %e, "unexpected error with remote service stream"),
                Some(Ok(event)) => {
                    let queued = match event {
                        watcher::Event::Apply(service) | watcher::Event::InitApply(service) => {
                            classify_remote_apply(&mut announced, service)
                        }
                        watcher::Event::Delete(service) => {
                            classify_remote_delete(&mut announced, &service)
                        }
                        watcher::Event::Init | watcher::Event::InitDone => None,
                    };
                    if let Some(event) = queued {
                        queue.send(event);
                    }
                }
            }
        }
    }
}

/// Remote endpoint changes surface as updates of the owning service,
/// looked up in the warm remote cache.
async fn pump_remote_endpoints(
    stream: impl Stream<Item = Result<watcher::Event<Endpoints>, watcher::Error>>,
    remote_services: Store<Service>,
    queue: QueueHandle,
    cancel: CancellationToken,
) {
    let mut stream = pin!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                None => break,
                Some(Err(e)) => error!(error = %e, "unexpected error with remote endpoints stream"),
                Some(Ok(watcher::Event::Apply(endpoints))) => {
                    let Some(namespace) = endpoints.namespace() else {
                        continue;
                    };
                    let service = remote_services
                        .get(&ObjectRef::new(&endpoints.name_any()).within(&namespace));
                    if let Some(service) = service
                        && qualifies(&service)
                    {
                        queue.send(Event::RemoteServiceUpdated {
                            service: (*service).clone(),
                        });
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn pump_local_mirrors(
    stream: impl Stream<Item = Result<watcher::Event<Service>, watcher::Error>>,
    queue: QueueHandle,
    cancel: CancellationToken,
) {
    let mut stream = pin!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                None => break,
                Some(Err(e)) => error!(error = %e, "unexpected error with local mirror stream"),
                Some(Ok(event)) => match event {
                    watcher::Event::Apply(service)
                    | watcher::Event::InitApply(service)
                    | watcher::Event::Delete(service) => {
                        if let Some(namespace) = service.namespace() {
                            queue.send(Event::LocalMirrorChanged {
                                name: service.name_any(),
                                namespace,
                            });
                        }
                    }
                    watcher::Event::Init | watcher::Event::InitDone => {}
                }
            }
        }
    }
}

/// Tampering with a mirror's endpoints is drift on the mirror itself.
async fn pump_local_endpoints(
    stream: impl Stream<Item = Result<watcher::Event<Endpoints>, watcher::Error>>,
    queue: QueueHandle,
    cancel: CancellationToken,
) {
    let mut stream = pin!(stream);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                None => break,
                Some(Err(e)) => error!(error = %e, "unexpected error with local endpoints stream"),
                Some(Ok(watcher::Event::Apply(endpoints) | watcher::Event::Delete(endpoints))) => {
                    if let Some(namespace) = endpoints.namespace() {
                        queue.send(Event::LocalMirrorChanged {
                            name: endpoints.name_any(),
                            namespace,
                        });
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    }
}

async fn gc_ticker(period: Duration, queue: QueueHandle, cancel: CancellationToken) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticks.tick() => {
                debug!("triggering orphan sweep");
                queue.send(Event::OrphanSweepTriggered);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;
    use mesh_mirror_common::EXPORTED_ANNOTATION;

    use super::*;

    fn make_remote(name: &str, exported: bool) -> Service {
        let mut annotations = BTreeMap::new();
        if exported {
            annotations.insert(EXPORTED_ANNOTATION.into(), "true".into());
        }
        Service {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_first_sighting_is_a_creation() {
        let mut announced = HashSet::new();
        let event = classify_remote_apply(&mut announced, make_remote("foo", true));
        assert!(matches!(event, Some(Event::RemoteServiceCreated { .. })));
        let event = classify_remote_apply(&mut announced, make_remote("foo", true));
        assert!(matches!(event, Some(Event::RemoteServiceUpdated { .. })));
    }

    #[test]
    fn test_unexported_service_retires_its_mirror() {
        let mut announced = HashSet::new();
        classify_remote_apply(&mut announced, make_remote("foo", true));
        let event = classify_remote_apply(&mut announced, make_remote("foo", false));
        assert!(matches!(
            event,
            Some(Event::RemoteServiceDeleted { name, namespace })
                if name == "foo" && namespace == "default"
        ));
        // never announced, nothing to retire
        let event = classify_remote_apply(&mut announced, make_remote("bar", false));
        assert!(event.is_none());
    }

    #[test]
    fn test_delete_only_announced_services() {
        let mut announced = HashSet::new();
        classify_remote_apply(&mut announced, make_remote("foo", true));
        assert!(classify_remote_delete(&mut announced, &make_remote("bar", true)).is_none());
        assert!(matches!(
            classify_remote_delete(&mut announced, &make_remote("foo", true)),
            Some(Event::RemoteServiceDeleted { .. })
        ));
        // a second delete for the same service is a no-op
        assert!(classify_remote_delete(&mut announced, &make_remote("foo", true)).is_none());
    }
}
