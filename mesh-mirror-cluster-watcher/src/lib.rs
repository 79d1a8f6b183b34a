mod context;
mod error;
mod metrics;
mod mirror;
mod runtime;
mod watcher;

pub use context::{WatcherLifecycle, WatcherState};
pub use error::{Error, Result};
pub use metrics::QueueMetrics;
pub use runtime::{ClusterHandle, WatcherArgs, start_cluster_watcher};
