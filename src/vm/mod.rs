//! The register-based virtual machine: executes a module's translated
//! code over one shared operand/local/frame stack.

mod error;
mod frame;
mod machine;
mod memory;
mod value;

pub use error::ExecutionError;
pub use frame::Frame;
pub use machine::{eval_module, virtual_machine_init, DispatchMode, Vm, VmConfig};
pub use memory::{Memory, PAGE_SIZE};
pub use value::Cell;
