//! An embeddable WebAssembly 1.0 core runtime: a decoder that translates the
//! binary module format into a register-style internal opcode stream, and a
//! virtual machine that executes it.
//!
//! The embedding surface is small on purpose: [`load_module`] parses a
//! module image, [`eval_module`] runs its `_start` export, and
//! [`module_dispose`] releases what the module owns. Everything else —
//! individual opcodes, the label-stack branch wiring, the call-frame
//! protocol — lives in [`parse`] and [`vm`].

pub mod byte_reader;
pub mod host;
pub mod leb;
pub mod parse;
pub mod vm;

pub use host::Host;
pub use parse::{Module, ParseError};
pub use vm::{eval_module as run_module, virtual_machine_init, Cell, DispatchMode, ExecutionError, VmConfig};

/// Decodes `bytes` into a [`Module`], logging allocation accounting against
/// `host`. Mirrors the abstract embedding API's `load_module`, but returns
/// the module rather than writing through an out-parameter.
pub fn load_module(bytes: &[u8], host: &Host) -> Result<Module, ParseError> {
    parse::Decoder::decode(bytes, host)
}

/// Runs `module`'s global initializer and its exported `_start`, returning
/// `_start`'s result values. `args` supplies `_start`'s arguments, if its
/// signature declares any. Mirrors the abstract embedding API's
/// `eval_module`.
pub fn eval_module(module: &Module, host: &Host, config: VmConfig, args: &[Cell]) -> Result<Vec<Cell>, ExecutionError> {
    vm::eval_module(module, host, config, args)
}

/// Releases everything `module` owns, recording the frees against `host`'s
/// allocation accounting so [`host::AllocStats::assert_balanced`] holds at
/// teardown.
pub fn module_dispose(module: Module, host: &Host) {
    module.dispose(host)
}
