use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State as AxumState;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Result;
use crate::http::shutdown;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct State {
    metrics: Metrics,
}

impl State {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    pub fn render(&self) -> String {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        match prometheus_client::encoding::text::encode(&mut buffer, registry) {
            Ok(_) => buffer,
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                "".into()
            }
        }
    }
}

pub(crate) async fn serve(
    addr: SocketAddr,
    state: Arc<State>,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("metrics listening on {}", addr);

    let app = router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown(cancel))
        .await?;
    Ok(())
}

pub fn router(state: Arc<State>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn metrics(AxumState(handler): AxumState<Arc<State>>) -> String {
    handler.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposes_registered_families() {
        let state = State::new(Metrics::default());
        let rendered = state.render();
        assert!(rendered.contains("mesh_mirror_events_requeued"));
        assert!(rendered.contains("mesh_mirror_gateway_transitions"));
    }
}
