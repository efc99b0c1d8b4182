use thiserror::Error;

/// Runtime failures. Every variant aborts the current `eval_module` call as a
/// trap; `memory.grow` failure is reported as a value (a sentinel result),
/// never as one of these.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("unreachable instruction executed")]
    Unreachable,

    #[error("integer divide by zero")]
    DivideByZero,

    #[error("signed integer overflow in division (i32::MIN / -1 or i64::MIN / -1)")]
    SignedDivideOverflow,

    #[error("out-of-range or NaN float in non-saturating truncation")]
    InvalidTruncation,

    #[error("memory instruction executed but the module has no memory")]
    NoMemory,

    #[error("memory access out of bounds: address range {addr:?}, memory size {size}")]
    MemoryOutOfBounds { addr: std::ops::Range<usize>, size: usize },

    #[error("function index {index} out of bounds for {len} functions")]
    FunctionIndexOutOfBounds { index: usize, len: usize },

    #[error("call_indirect type mismatch: expected type index {expected}, table held {actual}")]
    IndirectCallTypeMismatch { expected: usize, actual: usize },

    #[error("call_indirect table index {index} out of bounds for {len} entries")]
    TableIndexOutOfBounds { index: usize, len: usize },

    #[error("call_indirect addressed table slot {index} with no function installed")]
    UninitializedElement { index: usize },

    #[error("module has no exported function named \"_start\"")]
    MissingEntrypoint,

    #[error("called an import that was never resolved to a host function: {module}.{field}")]
    UnresolvedImport { module: String, field: String },

    #[error("value stack exhausted (requested capacity {requested}, limit {limit})")]
    StackOverflow { requested: usize, limit: usize },
}
