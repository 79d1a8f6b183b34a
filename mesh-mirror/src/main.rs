use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use mesh_mirror::config::{Cli, Commands};
use mesh_mirror::metrics::Metrics;
use mesh_mirror::{Result, http};
use mesh_mirror_probe::ProbeManager;
use mesh_mirror_registry_controller::{Context, start_registry_controller};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Controller(args) => {
            setup_subscriber();

            // no local API client, no process
            let client = local_client(args.kubeconfig.as_deref()).await?;
            let metrics = Metrics::default();
            let probes = Arc::new(ProbeManager::new(
                args.probe_failure_threshold,
                metrics.probe.clone(),
            )?);
            let ctx = Arc::new(Context::new(
                client,
                probes,
                args.event_requeue_limit,
                Duration::from_secs(args.gc_period_seconds),
                metrics.queue.clone(),
            ));

            let cancel = tokio_util::sync::CancellationToken::new();
            let state = Arc::new(http::State::new(metrics));
            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                args.metrics_address,
                state,
                cancel.child_token(),
            ));
            let mut registry_handle =
                tokio::spawn(start_registry_controller(ctx, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut metrics_handle => exit("metrics", h),
                h = &mut registry_handle => exit("registry", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    let (metrics, registry) = tokio::join!(metrics_handle, registry_handle);
                    if let Err(m) = metrics {
                        error!("metrics exited with error: {}", m.to_string());
                    }
                    if let Err(r) = registry {
                        error!("registry exited with error: {}", r.to_string());
                    }
                },
            };
            info!("Exiting...");
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_mirror=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn local_client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            Ok(kube::Client::try_from(config)?)
        }
        None => Ok(kube::Client::try_default().await?),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit<E: std::fmt::Display>(
    task: &str,
    out: std::result::Result<std::result::Result<(), E>, JoinError>,
) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
