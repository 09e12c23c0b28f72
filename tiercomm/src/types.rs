/// Rank of a participant in a communicator group (0-indexed).
pub type Rank = u32;

/// Ordinal of a compute device on the local host.
pub type DeviceId = usize;

/// Element types supported by the collectives.
///
/// The set is closed; backends map each variant to their own type code
/// (see `tiercomm_nccl::to_nccl_dtype`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }

    /// True for the floating-point variants.
    pub const fn is_float(self) -> bool {
        matches!(
            self,
            DataType::F32 | DataType::F64 | DataType::F16 | DataType::BF16
        )
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which tier of the topology a communicator spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommPurpose {
    /// Every rank in the job.
    Global,
    /// Ranks sharing one physical node.
    IntraNode,
    /// One leader rank per node.
    InterNode,
}

impl CommPurpose {
    /// Short name used in rendezvous keys and logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            CommPurpose::Global => "global",
            CommPurpose::IntraNode => "intra",
            CommPurpose::InterNode => "inter",
        }
    }
}

impl std::fmt::Display for CommPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
