use crate::types::{DataType, DeviceId, Rank};

pub type Result<T> = std::result::Result<T, TierCommError>;

#[derive(Debug, thiserror::Error)]
pub enum TierCommError {
    #[error("topology error: {reason}")]
    Topology { reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("illegal init method: {0}")]
    InvalidInitMethod(String),

    #[error("environment variable {name}={value:?} is not a valid integer")]
    InvalidEnv { name: &'static str, value: String },

    #[error("communication state is already initialized")]
    RepeatedInitialization,

    #[error("communication state is not initialized")]
    NotInitialized,

    #[error("{operation}: input tensors must be device-resident, tensor {index} is on the host")]
    HostResidentTensor {
        operation: &'static str,
        index: usize,
    },

    #[error("{operation}: tensor {index} is on device {actual}, communicator is bound to device {expected}")]
    DeviceMismatch {
        operation: &'static str,
        index: usize,
        expected: DeviceId,
        actual: DeviceId,
    },

    #[error("mixed element types in coalesced call: tensor {index} is {actual}, expected {expected}")]
    MixedDataTypes {
        index: usize,
        expected: DataType,
        actual: DataType,
    },

    #[error("{operation}: tensor list is empty")]
    EmptyTensorList { operation: &'static str },

    #[error("coalesced buffer holds {buffer} elements but tensors sum to {tensors}")]
    CoalesceMismatch { buffer: usize, tensors: usize },

    #[error("invalid root {root}: communicator size is {size}")]
    InvalidRoot { root: Rank, size: u32 },

    #[error("averaging requires a floating-point element type, got {0}")]
    UnsupportedAverage(DataType),

    #[error("rendezvous store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("rendezvous key {key:?} not published after {timeout_ms}ms")]
    StoreTimeout { key: String, timeout_ms: u64 },

    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("communicator formation timed out: {joined}/{expected} ranks joined (mismatched unique id?)")]
    FormationTimeout { joined: u32, expected: u32 },

    #[error("unique id mismatch: rank {rank} joined a {actual}-rank group expecting {expected} ranks")]
    UniqueIdMismatch { rank: Rank, expected: u32, actual: u32 },

    #[error("device error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl TierCommError {
    /// Create a `Store` error with just a message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Store` error with a message and a source error.
    pub fn store_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Store {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}
