use thiserror::Error;

/// All ways execution can fail.
///
/// Traps are plain values threaded through every operation's return path.
/// The only place one is consumed is `Instance::call`, which hands it to
/// the embedding host; nothing in between retries or swallows it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Trap {
    #[error("out-of-bounds memory access (offset {offset}, len {len}, memory size {size})")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("allocation failure: {0}")]
    AllocationFailed(&'static str),
    #[error("integer divide by zero")]
    DivisionByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversion,
    #[error("unreachable executed")]
    Unreachable,
    #[error("stack overflow")]
    StackOverflow,
    #[error("undefined element: table index out of range")]
    TableIndexOutOfRange,
    #[error("uninitialized element: null table entry")]
    NullTableElement,
    #[error("indirect call type mismatch")]
    IndirectCallTypeMismatch,
    #[error("unsupported instruction executed")]
    Unsupported,
    #[error("function {0} is not compiled and no compile hook is installed")]
    NotCompiled(String),
    #[error("page-in failure for segment {0}")]
    PageInFailed(u32),
    #[error("undefined export: {0}")]
    UndefinedExport(String),
    #[error("unlinked import: {0}")]
    UnlinkedImport(String),
    #[error("import signature mismatch for {name}: declared {declared}, registered {registered}")]
    ImportSignatureMismatch {
        name: String,
        declared: String,
        registered: String,
    },
    #[error("invalid signature string: {0}")]
    InvalidSignature(String),
    #[error("type mismatch")]
    TypeMismatch,
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("host error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, Trap>;
