pub mod config;
pub mod http;
pub mod metrics;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("failed to load kubeconfig: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),

    #[error("probe error: {0}")]
    Probe(#[from] mesh_mirror_probe::Error),

    #[error("registry error: {0}")]
    Registry(#[from] mesh_mirror_registry_controller::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
