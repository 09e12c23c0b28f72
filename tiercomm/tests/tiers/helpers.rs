use std::sync::Arc;
use std::time::Duration;

use tiercomm::device::sim::SimDevice;
use tiercomm::{
    LaunchEnv, LocalBackend, LocalFabric, MemoryStore, RendezvousStore, TierComm, TierCommConfig,
};

/// One simulated rank: its communication state plus its backend, through
/// which the test reaches the simulated device.
pub struct SimRank {
    pub state: TierComm,
    pub backend: Arc<LocalBackend>,
}

impl SimRank {
    pub fn rank(&self) -> u32 {
        self.state.topology().rank()
    }

    pub fn device(&self) -> Arc<SimDevice> {
        self.backend.device(self.state.device_id()).unwrap()
    }
}

pub fn test_config() -> TierCommConfig {
    TierCommConfig {
        formation_timeout: Duration::from_secs(10),
        store_timeout: Some(Duration::from_secs(10)),
        ..TierCommConfig::default()
    }
}

/// Bootstrap `world_size` ranks (`local_size` per node) over one shared
/// store, then run `f` on every rank concurrently.
pub async fn run_tiers<F, Fut>(world_size: u32, local_size: u32, f: F)
where
    F: Fn(Arc<SimRank>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let store: Arc<dyn RendezvousStore> = Arc::new(MemoryStore::new());
    run_tiers_with_store(world_size, local_size, move |_| Arc::clone(&store), f).await;
}

/// Like [`run_tiers`], with a store chosen per rank.
pub async fn run_tiers_with_store<S, F, Fut>(world_size: u32, local_size: u32, store_for: S, f: F)
where
    S: Fn(u32) -> Arc<dyn RendezvousStore>,
    F: Fn(Arc<SimRank>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let config = test_config();
    let fabric = LocalFabric::from_config(&config);
    let f = Arc::new(f);

    let mut handles = Vec::new();
    for rank in 0..world_size {
        let fabric = Arc::clone(&fabric);
        let store = store_for(rank);
        let config = config.clone();
        let f = Arc::clone(&f);
        handles.push(tokio::spawn(async move {
            let backend = Arc::new(LocalBackend::new(fabric));
            let state = TierComm::bootstrap(
                backend.clone(),
                store,
                LaunchEnv::for_rank(rank, world_size, local_size),
                config,
                None,
            )
            .await
            .unwrap_or_else(|e| panic!("rank {rank} bootstrap failed: {e}"));
            f(Arc::new(SimRank { state, backend })).await;
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
}
