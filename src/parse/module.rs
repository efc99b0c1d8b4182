//! The in-memory module container: types, the function index space, the
//! optional linear memory and indirect-call table, and the data/element
//! segments that populate them at load time. Populated by the decoder in
//! section order and disposed of by a single teardown call.

use crate::parse::code::{Instr, JumpTable};
use crate::parse::types::{FunctionType, GlobalType, MemoryType, Name};
use crate::host::Host;

/// One function body, sealed after translation.
#[derive(Debug, Default)]
pub struct Function {
    pub type_index: u32,
    pub code: Vec<Instr>,
    pub jump_tables: Vec<JumpTable>,
    pub export_name: Option<Name>,
    /// Declared local count, not counting arguments.
    pub local_count: u32,
    /// Total distinct registers the translator allocated for this body.
    /// Sizes the stack window the machine reserves for a call frame.
    pub register_count: u32,
}

impl Function {
    pub fn arg_count(&self, module: &Module) -> usize {
        module.types[self.type_index as usize].arg_count()
    }

    pub fn result_count(&self, module: &Module) -> usize {
        module.types[self.type_index as usize].result_count()
    }
}

/// Either a decoded Wasm function or a host-backed import, resolved against
/// `Host::lookup` the first time it is called.
#[derive(Debug)]
pub enum Callable {
    Wasm(Function),
    /// An imported function. Resolved against `Host::lookup` the first time
    /// it is called; traps with `UnresolvedImport` if the host never
    /// registered a matching function.
    Import { module: Name, field: Name, type_index: u32 },
}

impl Callable {
    pub fn type_index(&self) -> u32 {
        match self {
            Callable::Wasm(f) => f.type_index,
            Callable::Import { type_index, .. } => *type_index,
        }
    }

    pub fn export_name(&self) -> Option<&str> {
        match self {
            Callable::Wasm(f) => f.export_name.as_deref(),
            Callable::Import { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Module {
    pub types: Vec<FunctionType>,
    /// Function index space: imports first, then locally defined functions,
    /// matching the binary format's own convention.
    pub functions: Vec<Callable>,
    /// Runs once at instantiation to populate `globals` before `_start`
    /// executes; each global's initializer ends by storing into its slot
    /// instead of returning.
    pub global_init: Function,
    /// Register count for `global_init`'s frame: the largest count any one
    /// global's (independently translated, then concatenated) initializer
    /// needed, since they run sequentially and never share live registers.
    pub global_init_registers: u32,
    pub global_types: Vec<GlobalType>,
    pub memory: Option<MemoryType>,
    /// The indirect-call table `call_indirect` addresses. `None` entries are
    /// holes the element section never filled.
    pub table: Vec<Option<u32>>,
    pub data_segments: Vec<DataSegment>,
}

#[derive(Debug, Clone)]
pub struct DataSegment {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl Module {
    /// Finds the exported function named `_start`.
    pub fn start_function_index(&self) -> Option<usize> {
        self.functions
            .iter()
            .position(|f| f.export_name() == Some("_start"))
    }

    /// Releases all owned allocations and records the frees against `host`'s
    /// allocation accounting.
    ///
    /// Scope note: only the sealed code arrays are tracked here, since their
    /// size is fixed at load time. The growable linear-memory block lives on
    /// the `Machine` created by `eval_module`, not on `Module`, and is freed
    /// by `Vec`'s own RAII when that `Machine` drops — threading `Host`
    /// through every `memory.grow` call just to keep a byte counter in sync
    /// with something `Vec` already manages safely isn't worth the plumbing.
    pub fn dispose(self, host: &Host) {
        for callable in &self.functions {
            if let Callable::Wasm(f) = callable {
                host.alloc
                    .record_free((f.code.len() * std::mem::size_of::<Instr>()) as u64);
            }
        }
        drop(self);
    }
}
