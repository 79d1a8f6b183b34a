use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::Store;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::metrics::QueueMetrics;

/// Lifecycle of one cluster watcher's consumer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Registry-side view of a watcher's lifecycle: request shutdown and
/// observe completion without sharing any mutable state with the task.
#[derive(Debug, Clone)]
pub struct WatcherLifecycle {
    cancel: CancellationToken,
    state: watch::Receiver<WatcherState>,
}

/// Watcher-side half, used by the consumer task to publish transitions.
#[derive(Debug, Clone)]
pub(crate) struct WatcherLifecycleHandle {
    cancel: CancellationToken,
    state: watch::Sender<WatcherState>,
}

impl WatcherLifecycle {
    pub(crate) fn new() -> (Self, WatcherLifecycleHandle) {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(WatcherState::Starting);
        let lifecycle = Self {
            cancel: cancel.clone(),
            state: state_rx,
        };
        let handle = WatcherLifecycleHandle {
            cancel,
            state: state_tx,
        };
        (lifecycle, handle)
    }

    /// Asks the consumer to drain and stop. Idempotent.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Resolves once the consumer has drained its queue and exited.
    pub async fn stopped(&self) {
        let mut state = self.state.clone();
        // an error means the sender task is gone, which is also stopped
        let _ = state
            .wait_for(|state| *state == WatcherState::Stopped)
            .await;
    }
}

impl WatcherLifecycleHandle {
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn enter(&self, state: WatcherState) {
        let _ = self.state.send(state);
    }
}

/// Everything one cluster's consumer needs. Owned exclusively by the
/// consumer task, so no mirror mutation ever races another.
pub(crate) struct Context {
    pub client: kube::Client,
    pub cluster_name: String,
    pub remote_services: Store<Service>,
    pub local_mirrors: Store<Service>,
    pub requeue_limit: u32,
    pub metrics: QueueMetrics,
}
