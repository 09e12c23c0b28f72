use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tiercomm::{
    FileStore, LaunchEnv, LocalBackend, LocalFabric, MemoryStore, RendezvousStore, TcpStore,
    TcpStoreServer, TierComm, TierCommConfig, TierCommError,
};

use super::helpers::run_tiers_with_store;

async fn sum_of_ranks(r: Arc<super::helpers::SimRank>) {
    let buf = r.device().upload(&[r.rank() as u32]);
    r.state
        .allreduce(&buf.tensor(vec![1]), false, None)
        .await
        .unwrap();
    assert_eq!(buf.read::<u32>(), vec![6]);
}

#[tokio::test]
async fn test_bootstrap_over_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut stores = Vec::new();
    for _ in 0..4 {
        let store = FileStore::open(dir.path(), Duration::from_millis(5))
            .await
            .unwrap();
        stores.push(Arc::new(store) as Arc<dyn RendezvousStore>);
    }

    run_tiers_with_store(4, 2, move |rank| Arc::clone(&stores[rank as usize]), sum_of_ranks).await;
}

#[tokio::test]
async fn test_bootstrap_over_tcp_store() {
    let server = TcpStoreServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    let mut stores = Vec::new();
    for _ in 0..4 {
        let client = TcpStore::connect(addr, Duration::from_secs(5)).await.unwrap();
        stores.push(Arc::new(client) as Arc<dyn RendezvousStore>);
    }

    run_tiers_with_store(4, 2, move |rank| Arc::clone(&stores[rank as usize]), sum_of_ranks).await;
    drop(server);
}

/// Hands every follower a freshly corrupted id, as if ranks were launched
/// against different rendezvous sessions.
struct CorruptingStore {
    inner: MemoryStore,
}

impl RendezvousStore for CorruptingStore {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> BoxFuture<'a, tiercomm::Result<()>> {
        self.inner.put(key, value)
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, tiercomm::Result<Vec<u8>>> {
        Box::pin(async move {
            let mut v = self.inner.get(key).await?;
            if let Some(b) = v.first_mut() {
                *b ^= 0xff;
            }
            Ok(v)
        })
    }
}

#[tokio::test]
async fn test_unique_id_mismatch_is_an_error_not_a_hang() {
    let config = TierCommConfig {
        formation_timeout: Duration::from_millis(200),
        ..TierCommConfig::default()
    };
    let fabric = LocalFabric::from_config(&config);
    let store: Arc<dyn RendezvousStore> = Arc::new(CorruptingStore {
        inner: MemoryStore::new(),
    });

    let mut handles = Vec::new();
    for rank in 0..2u32 {
        let fabric = Arc::clone(&fabric);
        let store = Arc::clone(&store);
        let config = config.clone();
        handles.push(tokio::spawn(async move {
            TierComm::bootstrap(
                Arc::new(LocalBackend::new(fabric)),
                store,
                LaunchEnv::for_rank(rank, 2, 1),
                config,
                None,
            )
            .await
            .map(|_| ())
        }));
    }

    let results = tokio::time::timeout(Duration::from_secs(10), async {
        let mut out = Vec::new();
        for h in handles {
            out.push(h.await.unwrap());
        }
        out
    })
    .await
    .expect("bootstrap hung on mismatched ids");

    for res in results {
        assert!(matches!(
            res,
            Err(TierCommError::FormationTimeout {
                joined: 1,
                expected: 2
            })
        ));
    }
}

#[tokio::test]
async fn test_follower_store_timeout() {
    let config = TierCommConfig {
        store_timeout: Some(Duration::from_millis(50)),
        ..TierCommConfig::default()
    };
    // Rank 1 alone: the leader never publishes.
    let res = TierComm::bootstrap(
        Arc::new(LocalBackend::new(LocalFabric::from_config(&config))),
        Arc::new(MemoryStore::new()),
        LaunchEnv::for_rank(1, 2, 2),
        config,
        None,
    )
    .await;
    assert!(matches!(res, Err(TierCommError::StoreTimeout { .. })));
}
