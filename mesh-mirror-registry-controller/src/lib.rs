mod context;
mod controller;
mod error;
mod runtime;

pub use context::Context;
pub use error::{Error, Result};
pub use runtime::start_registry_controller;
