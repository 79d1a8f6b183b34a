use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to build probe http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
