//! Decodes a WebAssembly binary module and translates it into the
//! register-form internal representation the `vm` module executes.

pub mod code;
pub mod decoder;
pub mod error;
pub mod module;
pub mod opcode;
pub mod translate;
pub mod types;

pub use decoder::Decoder;
pub use error::ParseError;
pub use module::{Callable, DataSegment, Function, Module};
pub use types::{ExportKind, FunctionType, GlobalType, Import, ImportDesc, LimitKind, MemArg, MemoryType, Name, SectionId, ValueType};
