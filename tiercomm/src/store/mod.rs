//! Rendezvous stores: a key/value space shared by every rank, used once per
//! communicator to hand the leader's unique id to its followers.

mod file;
mod memory;
mod tcp;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use tcp::{TcpStore, TcpStoreServer};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::config::{LaunchEnv, MasterAddr, TierCommConfig};
use crate::error::{Result, TierCommError};
use crate::transport::UniqueId;
use crate::types::{CommPurpose, Rank};

/// Key/value space visible to all processes of a job.
///
/// `get` waits until the key has been published; there is no deadline unless
/// the caller imposes one (see [`get_with_timeout`]).
pub trait RendezvousStore: Send + Sync {
    /// Publish `value` under `key`, replacing any previous value.
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Wait for `key` to exist and return its value.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// `get` bounded by `timeout` (`None` waits forever).
pub async fn get_with_timeout(
    store: &dyn RendezvousStore,
    key: &str,
    timeout: Option<Duration>,
) -> Result<Vec<u8>> {
    match timeout {
        None => store.get(key).await,
        Some(limit) => tokio::time::timeout(limit, store.get(key))
            .await
            .map_err(|_| TierCommError::StoreTimeout {
                key: key.to_string(),
                timeout_ms: limit.as_millis() as u64,
            })?,
    }
}

/// Store key under which `leader` publishes the unique id for `purpose`.
///
/// The leader rank is part of the key, so intra-node groups on different
/// nodes never collide.
pub fn unique_id_key(purpose: CommPurpose, leader: Rank) -> String {
    format!("tiercomm/{purpose}/{leader}/unique_id")
}

/// Agree on one unique id among the ranks of a communicator.
///
/// The leader calls `generate` and publishes the result; every other rank
/// waits for it. All callers return byte-identical ids.
pub async fn exchange_unique_id<G>(
    store: &dyn RendezvousStore,
    purpose: CommPurpose,
    leader: Rank,
    my_rank: Rank,
    timeout: Option<Duration>,
    generate: G,
) -> Result<UniqueId>
where
    G: FnOnce() -> Result<UniqueId>,
{
    let key = unique_id_key(purpose, leader);
    if my_rank == leader {
        let id = generate()?;
        store.put(&key, id.as_bytes()).await?;
        tracing::debug!(%purpose, leader, key = %key, "published unique id");
        Ok(id)
    } else {
        let bytes = get_with_timeout(store, &key, timeout).await?;
        tracing::debug!(%purpose, leader, rank = my_rank, "fetched unique id");
        Ok(UniqueId::from_bytes(bytes))
    }
}

/// How processes find their rendezvous store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitMethod {
    /// TCP store hosted by rank 0 at `MASTER_ADDR:MASTER_PORT`.
    Dist,
    /// One file per key under a directory on a shared filesystem.
    File(PathBuf),
}

impl InitMethod {
    /// Parse `dist://` or `file://<dir>`.
    pub fn parse(init_method: &str) -> Result<Self> {
        let (scheme, rest) = init_method
            .split_once("://")
            .ok_or_else(|| TierCommError::InvalidInitMethod(init_method.to_string()))?;
        match scheme {
            "dist" => Ok(InitMethod::Dist),
            "file" if !rest.is_empty() => Ok(InitMethod::File(PathBuf::from(rest))),
            _ => Err(TierCommError::InvalidInitMethod(init_method.to_string())),
        }
    }

    /// Open the store this method describes.
    ///
    /// For `Dist`, rank 0 also starts the server; the returned store keeps it
    /// alive.
    pub async fn connect(
        &self,
        env: &LaunchEnv,
        config: &TierCommConfig,
    ) -> Result<Arc<dyn RendezvousStore>> {
        match self {
            InitMethod::Dist => {
                let master = MasterAddr::from_env()?;
                let store = if env.rank == 0 {
                    let server = TcpStoreServer::bind(("0.0.0.0", master.port)).await?;
                    TcpStore::connect(
                        ("127.0.0.1", server.local_addr().port()),
                        config.store_connect_timeout,
                    )
                    .await?
                    .with_server(server)
                } else {
                    TcpStore::connect(
                        (master.host.as_str(), master.port),
                        config.store_connect_timeout,
                    )
                    .await?
                };
                Ok(Arc::new(store))
            }
            InitMethod::File(dir) => {
                Ok(Arc::new(FileStore::open(dir, config.file_store_poll).await?))
            }
        }
    }
}
