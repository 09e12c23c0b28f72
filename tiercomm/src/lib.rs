pub mod bootstrap;
pub mod coalesce;
pub mod collective;
mod comm;
pub mod config;
pub mod device;
pub mod error;
pub mod reduce;
pub mod state;
pub mod store;
pub mod sync;
pub mod topology;
pub mod transport;
pub mod types;

pub use bootstrap::{CommunicatorFactory, CommunicatorSet};
pub use coalesce::{flatten, unflatten, CoalescedBuffer};
pub use comm::Communicator;
pub use config::{LaunchEnv, MasterAddr, TierCommConfig};
pub use device::{DeviceMemory, DeviceStream, Location, StreamMarker, TensorRef};
pub use error::{Result, TierCommError};
pub use state::{global_state, initialize, initialize_with, is_initialized, TierComm};
pub use store::{FileStore, InitMethod, MemoryStore, RendezvousStore, TcpStore, TcpStoreServer};
pub use topology::TierTopology;
pub use transport::{
    Backend, BufferDescriptor, LocalBackend, LocalFabric, TransportComm, UniqueId,
};
pub use types::{CommPurpose, DataType, DeviceId, Rank};
