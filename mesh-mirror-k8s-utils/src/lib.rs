use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures::Stream;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::Store;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("store not ready: {0}")]
    StoreNotReady(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builds a cached store plus the raw watch event stream feeding it.
/// The caller owns polling the stream; the store only fills (and
/// `await_store_ready` only resolves) while the stream is driven.
pub fn watch_with_store<K>(
    api: Api<K>,
    config: watcher::Config,
) -> (
    Store<K>,
    impl Stream<Item = Result<watcher::Event<K>, watcher::Error>>,
)
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Hash + Clone,
{
    let (store, writer) = reflector::store();
    let stream = watcher(api, config).default_backoff().reflect(writer);
    (store, stream)
}

/// Waits for the initial list to land in the store, bounded so a dead
/// watch cannot hang its owner indefinitely.
pub async fn await_store_ready<K>(store: &Store<K>, timeout: Duration) -> Result<()>
where
    K: Resource + Clone + 'static,
    <K as Resource>::DynamicType: Eq + Hash + Clone,
{
    tokio::time::timeout(timeout, store.wait_until_ready())
        .await
        .map_err(|_| Error::StoreNotReady("timed out waiting for store".into()))?
        .map_err(|e| Error::StoreNotReady(e.to_string()))
}
