//! Process-wide communication state.
//!
//! [`TierComm::bootstrap`] builds the state for callers that pass it around
//! explicitly. [`initialize`] builds it once per process and installs it as
//! a global that [`global_state`] hands out afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use crate::bootstrap::CommunicatorFactory;
use crate::collective;
use crate::comm::Communicator;
use crate::config::{LaunchEnv, TierCommConfig};
use crate::device::{DeviceStream, TensorRef};
use crate::error::{Result, TierCommError};
use crate::store::{InitMethod, RendezvousStore};
use crate::topology::TierTopology;
use crate::transport::Backend;
use crate::types::{DeviceId, Rank};

/// Everything one rank needs to run collectives: the backend, its two
/// streams, the rendezvous store and the three tier communicators.
pub struct TierComm {
    backend: Arc<dyn Backend>,
    store: Arc<dyn RendezvousStore>,
    env: LaunchEnv,
    config: TierCommConfig,
    topology: TierTopology,
    device_id: DeviceId,
    compute_stream: Arc<dyn DeviceStream>,
    comm_stream: Arc<dyn DeviceStream>,
    global: Communicator,
    intra: Communicator,
    inter: Option<Communicator>,
}

impl TierComm {
    /// Build the communication state for this rank. Collective: every rank
    /// of the job must call it with the same store.
    ///
    /// `device_id` defaults to the launcher's local rank.
    pub async fn bootstrap(
        backend: Arc<dyn Backend>,
        store: Arc<dyn RendezvousStore>,
        env: LaunchEnv,
        config: TierCommConfig,
        device_id: Option<DeviceId>,
    ) -> Result<Self> {
        let topology = launch_topology(&env, &config)?;
        if env.local_rank != topology.intra_rank() {
            tracing::warn!(
                rank = env.rank,
                local_rank = env.local_rank,
                local_size = env.local_size,
                "LOCAL_RANK disagrees with node-major rank layout; tiers follow RANK"
            );
        }

        let device_id = device_id.unwrap_or(env.local_rank as DeviceId);
        let compute_stream = backend.compute_stream(device_id)?;
        let comm_stream = backend.create_comm_stream(device_id)?;

        let comms = CommunicatorFactory::new(
            backend.as_ref(),
            store.as_ref(),
            &topology,
            Arc::clone(&comm_stream),
            device_id,
        )
        .with_store_timeout(config.store_timeout)
        .build_all()
        .await?;

        tracing::info!(
            backend = backend.name(),
            rank = env.rank,
            world_size = env.world_size,
            local_size = env.local_size,
            device = device_id,
            inter_member = comms.inter.is_some(),
            "communication state initialized"
        );

        Ok(Self {
            backend,
            store,
            env,
            config,
            topology,
            device_id,
            compute_stream,
            comm_stream,
            global: comms.global,
            intra: comms.intra,
            inter: comms.inter,
        })
    }

    pub fn global_communicator(&self) -> &Communicator {
        &self.global
    }

    pub fn intranode_communicator(&self) -> &Communicator {
        &self.intra
    }

    /// `None` on ranks that do not represent their node.
    pub fn internode_communicator(&self) -> Option<&Communicator> {
        self.inter.as_ref()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn store(&self) -> &Arc<dyn RendezvousStore> {
        &self.store
    }

    pub fn comm_stream(&self) -> &Arc<dyn DeviceStream> {
        &self.comm_stream
    }

    /// The ambient stream collectives are ordered after.
    pub fn compute_stream(&self) -> &Arc<dyn DeviceStream> {
        &self.compute_stream
    }

    pub fn topology(&self) -> &TierTopology {
        &self.topology
    }

    pub fn launch_env(&self) -> &LaunchEnv {
        &self.env
    }

    pub fn config(&self) -> &TierCommConfig {
        &self.config
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn autotune_server_addr(&self) -> Option<&str> {
        self.config.autotune_server_addr.as_deref()
    }

    /// Broadcast from `root` (a rank of `comm`, default global).
    pub async fn broadcast(
        &self,
        tensor: &TensorRef,
        root: Rank,
        comm: Option<&Communicator>,
    ) -> Result<()> {
        collective::broadcast(self.ambient(), comm.unwrap_or(&self.global), tensor, root).await
    }

    pub async fn broadcast_coalesced(
        &self,
        tensors: &[TensorRef],
        root: Rank,
        comm: Option<&Communicator>,
    ) -> Result<()> {
        collective::broadcast_coalesced(
            self.ambient(),
            comm.unwrap_or(&self.global),
            tensors,
            root,
        )
        .await
    }

    /// Sum (or with `average`, mean) over `comm`, default global.
    pub async fn allreduce(
        &self,
        tensor: &TensorRef,
        average: bool,
        comm: Option<&Communicator>,
    ) -> Result<()> {
        collective::allreduce(self.ambient(), comm.unwrap_or(&self.global), tensor, average)
            .await
    }

    pub async fn allreduce_coalesced(
        &self,
        tensors: &[TensorRef],
        average: bool,
        comm: Option<&Communicator>,
    ) -> Result<()> {
        collective::allreduce_coalesced(
            self.ambient(),
            comm.unwrap_or(&self.global),
            tensors,
            average,
        )
        .await
    }

    fn ambient(&self) -> &dyn DeviceStream {
        self.compute_stream.as_ref()
    }
}

fn launch_topology(env: &LaunchEnv, config: &TierCommConfig) -> Result<TierTopology> {
    TierTopology::new(
        env.rank,
        env.world_size,
        env.local_size,
        config.inter_leader_offset,
    )
}

static STATE: OnceLock<TierComm> = OnceLock::new();
static INIT_STARTED: AtomicBool = AtomicBool::new(false);

/// Initialize the process-wide state from the launcher environment.
///
/// `init_method` is `dist://` (TCP store hosted by rank 0 at
/// `MASTER_ADDR:MASTER_PORT`) or `file://<dir>`. May succeed at most once
/// per process; later calls fail with
/// [`TierCommError::RepeatedInitialization`]. A failed call leaves the
/// process uninitialized.
pub async fn initialize(
    backend: Arc<dyn Backend>,
    init_method: &str,
    device_id: Option<DeviceId>,
) -> Result<&'static TierComm> {
    claim()?;
    let built = async {
        let method = InitMethod::parse(init_method)?;
        let env = LaunchEnv::from_env()?;
        let config = TierCommConfig::from_env();
        // A bad launch layout fails here rather than after the store connects.
        launch_topology(&env, &config)?;
        let store = method.connect(&env, &config).await?;
        TierComm::bootstrap(backend, store, env, config, device_id).await
    }
    .await;
    install(built)
}

/// [`initialize`] with an explicit store, environment and config.
pub async fn initialize_with(
    backend: Arc<dyn Backend>,
    store: Arc<dyn RendezvousStore>,
    env: LaunchEnv,
    config: TierCommConfig,
    device_id: Option<DeviceId>,
) -> Result<&'static TierComm> {
    claim()?;
    install(TierComm::bootstrap(backend, store, env, config, device_id).await)
}

pub fn is_initialized() -> bool {
    STATE.get().is_some()
}

/// The state installed by [`initialize`].
pub fn global_state() -> Result<&'static TierComm> {
    STATE.get().ok_or(TierCommError::NotInitialized)
}

fn claim() -> Result<()> {
    INIT_STARTED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .map(|_| ())
        .map_err(|_| TierCommError::RepeatedInitialization)
}

fn install(built: Result<TierComm>) -> Result<&'static TierComm> {
    match built {
        Ok(state) => {
            STATE
                .set(state)
                .map_err(|_| TierCommError::RepeatedInitialization)?;
            global_state()
        }
        Err(e) => {
            INIT_STARTED.store(false, Ordering::Release);
            Err(e)
        }
    }
}
