//! Errors raised while decoding and translating a module. Every variant is a
//! refusal to trust a malformed byte stream; no variant here reports a
//! runtime trap (see `crate::vm::ExecutionError` for those).

use crate::leb::LebError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("not enough bytes remaining to decode the next field")]
    UnexpectedEnd,

    #[error("invalid LEB128 integer: {0}")]
    Leb(#[from] LebError),

    #[error("bad magic number or version: this is not a WebAssembly module")]
    BadHeader,

    #[error("malformed module: {0}")]
    MalformedModule(&'static str),

    #[error("unknown opcode byte 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("operand stack underflow while translating a function body")]
    OperandStackUnderflow,

    #[error("branch label {label} has no enclosing block")]
    InvalidBranchLabel { label: u32 },

    #[error("`else` with no matching `if`")]
    UnmatchedElse,

    #[error("`end` with no matching block")]
    UnmatchedEnd,

    #[error("type index {index} is out of bounds")]
    TypeIndexOutOfBounds { index: u32 },

    #[error("function index {index} is out of bounds")]
    FunctionIndexOutOfBounds { index: u32 },

    #[error("a function type may declare at most {max} combined params and results, found {found}")]
    TooManySignatureSlots { max: u32, found: u32 },

    #[error("section {section} has a length that does not match its contents")]
    SectionLengthMismatch { section: u8 },

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(&'static str),

    #[error("invalid UTF-8 in a name")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}
