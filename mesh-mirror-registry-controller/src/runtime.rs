use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use kube::runtime::{WatchStreamExt, watcher};
use mesh_mirror_common::MIRROR_SECRET_TYPE;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::context::Context;
use crate::controller;

/// Watches credential secrets and manages one cluster watcher plus one
/// gateway prober per registered remote cluster. Returns after a
/// cancellation once every watcher has drained.
pub async fn start_registry_controller(ctx: Arc<Context>, cancel: CancellationToken) -> Result<()> {
    let api: Api<Secret> = Api::all(ctx.local_client.clone());
    let config = watcher::Config::default().fields(&format!("type={MIRROR_SECRET_TYPE}"));
    let stream = watcher(api, config).default_backoff();
    let mut stream = pin!(stream);

    info!("registry controller watching credentials secrets");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => match item {
                None => break,
                Some(Err(e)) => error!(error = %e, "unexpected error with secret stream"),
                Some(Ok(event)) => match event {
                    watcher::Event::Apply(secret) | watcher::Event::InitApply(secret) => {
                        controller::apply(&ctx, &secret).await;
                    }
                    watcher::Event::Delete(secret) => {
                        controller::delete(&ctx, &secret).await;
                    }
                    watcher::Event::Init | watcher::Event::InitDone => {}
                }
            }
        }
    }

    shutdown_all(&ctx).await;
    Ok(())
}

/// Graceful process shutdown: probers stop, watchers drain their
/// queues. Mirrors are left in place for the next run to reconcile.
async fn shutdown_all(ctx: &Arc<Context>) {
    ctx.probes.stop();
    let watchers: Vec<_> = {
        let mut registrations = ctx.registrations.lock().expect("registrations lock");
        std::mem::take(&mut *registrations)
            .into_values()
            .map(|registration| registration.watcher)
            .collect()
    };
    for watcher in &watchers {
        watcher.request_shutdown();
    }
    for watcher in watchers {
        watcher.stopped().await;
    }
    info!("all cluster watchers drained");
}
