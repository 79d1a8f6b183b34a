mod error;
mod manager;
mod metrics;
mod worker;

pub use error::{Error, Result};
pub use manager::ProbeManager;
pub use metrics::ProbeMetrics;
pub use worker::Reachability;
