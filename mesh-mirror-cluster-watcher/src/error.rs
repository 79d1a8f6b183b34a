use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("store error: {0}")]
    Store(#[from] mesh_mirror_k8s_utils::Error),

    #[error(transparent)]
    JsonConversion(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
