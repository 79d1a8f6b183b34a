mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use metrics::State;

pub async fn serve_metrics(addr: SocketAddr, state: Arc<State>, cancel: CancellationToken) -> Result<()> {
    metrics::serve(addr, state, cancel).await
}

pub(crate) async fn shutdown(cancel: CancellationToken) {
    select! {
        _ = cancel.cancelled() => {}
    }
}
