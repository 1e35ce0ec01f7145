/// Rank of a participant in a communicator (0-indexed).
pub type Rank = u32;

/// Transport library backing one level of the hierarchy.
///
/// The planner never touches a wire itself; it tags every lowered edge set
/// with the library the backend should service it with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Library {
    /// Intra-node peer access (shared memory / device IPC).
    Ipc = 0,
    /// Inter-node point-to-point message library.
    Msg = 1,
    /// Vendor collective library.
    Xccl = 2,
    /// Host staging (device-host-device bounce).
    Stage = 3,
}

impl Library {
    pub const fn name(self) -> &'static str {
        match self {
            Library::Ipc => "ipc",
            Library::Msg => "msg",
            Library::Xccl => "xccl",
            Library::Stage => "stage",
        }
    }
}

impl std::fmt::Display for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Library {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ipc" => Ok(Library::Ipc),
            "msg" => Ok(Library::Msg),
            "xccl" => Ok(Library::Xccl),
            "stage" => Ok(Library::Stage),
            other => Err(format!("unknown library tag: {other}")),
        }
    }
}

/// Element types the planner can size buffers for and reduce over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    I8 = 2,
    I32 = 3,
    I64 = 4,
    U8 = 5,
    U32 = 6,
    U64 = 7,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for reduce primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across contributors.
    Sum,
    /// Element-wise product across contributors.
    Prod,
    /// Element-wise minimum across contributors.
    Min,
    /// Element-wise maximum across contributors.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Element types a `Communicator` can be instantiated over.
///
/// The element type only matters for buffer sizing and for dispatching the
/// reduction kernel; everything else in the planner is byte-agnostic.
pub trait Scalar: Copy + Send + Sync + 'static {
    const DTYPE: DataType;
}

macro_rules! impl_scalar {
    ($($ty:ty => $dt:ident),* $(,)?) => {
        $(
            impl Scalar for $ty {
                const DTYPE: DataType = DataType::$dt;
            }
        )*
    };
}

impl_scalar!(
    f32 => F32,
    f64 => F64,
    i8 => I8,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u32 => U32,
    u64 => U64,
);
