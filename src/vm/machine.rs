//! The register machine: executes a module's translated code over one
//! shared `Vec<Cell>` that simultaneously backs locals, operand scratch,
//! and call-frame linkage. This is the seam where `parse::Instr` records
//! become observable effects (memory writes, trap errors, return values).

use std::collections::HashMap;

use tracing::{instrument, trace};

use crate::host::Host;
use crate::parse::code::{Instr, IrOp, JumpTable, Operand};
use crate::parse::module::{Callable, Module};
use crate::vm::error::ExecutionError;
use crate::vm::frame::Frame;
use crate::vm::memory::Memory;
use crate::vm::value::Cell;

/// Sentinel used in two unrelated-but-analogous spots: as `Vm::current_func`
/// while running the module's global initializer (which isn't one of
/// `module.functions`), and as a pushed `Frame::return_func` marking "there
/// is no caller to resume — exit with these results" for the outermost call
/// into `_start`. Both mean the same thing: execution is not inside any
/// function from the module's own index space.
const OUTER: usize = usize::MAX;

/// Selects how `Vm::run` walks the code array. Both must produce identical
/// observable effects (§8 "Dispatch equivalence"); they share every opcode's
/// semantics in `Vm::execute` and differ only in how the next cell's handler
/// is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// A loop over `instr.op` matched directly — the straightforward
    /// "switch" dispatcher.
    #[default]
    Switched,
    /// A loop that instead calls through a lazily-built table of function
    /// pointers, one per code cell, standing in for the computed-goto
    /// handler-table technique in a language without label addresses (see
    /// spec.md §9 "Computed-goto threaded dispatch").
    Threaded,
}

#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    pub dispatch: DispatchMode,
    /// Upper bound, in `Cell`s, on how large the shared stack may grow
    /// before a call is refused with `ExecutionError::StackOverflow`.
    pub stack_capacity: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self { dispatch: DispatchMode::Switched, stack_capacity: 1 << 20 }
    }
}

/// What executing one code cell did to control flow. Straight-line opcodes
/// return `Next`; anything that moves `pc` itself (jumps, calls, returns)
/// returns `Jumped` so the dispatch loop knows not to also increment it.
enum Signal {
    Next,
    Jumped,
    Exit(Vec<Cell>),
}

type Handler<'m> = fn(&mut Vm<'m>) -> Result<Signal, ExecutionError>;

/// One running instance of a `Module`. Holds everything the register
/// machine needs that isn't already owned by the (immutable, sealed)
/// `Module`: the register file, call-frame linkage, globals, and linear
/// memory.
pub struct Vm<'m> {
    module: &'m Module,
    host: &'m Host,
    config: VmConfig,
    stack: Vec<Cell>,
    frames: Vec<Frame>,
    globals: Vec<Cell>,
    memory: Option<Memory>,
    /// Absolute stack index of the active frame's register 0.
    base: usize,
    /// Index into `module.functions`, or `OUTER` while running the global
    /// initializer.
    current_func: usize,
    pc: usize,
    /// Threaded-dispatch handler tables, built lazily the first time a
    /// function is entered under `DispatchMode::Threaded`. Keyed the same
    /// way as `current_func`.
    threaded_tables: HashMap<usize, Vec<Handler<'m>>>,
}

impl<'m> Vm<'m> {
    fn code(&self) -> &'m [Instr] {
        if self.current_func == OUTER {
            &self.module.global_init.code
        } else {
            match &self.module.functions[self.current_func] {
                Callable::Wasm(f) => &f.code,
                Callable::Import { .. } => unreachable!("imports never have their own code executed"),
            }
        }
    }

    fn jump_tables(&self) -> &'m [JumpTable] {
        if self.current_func == OUTER {
            &self.module.global_init.jump_tables
        } else {
            match &self.module.functions[self.current_func] {
                Callable::Wasm(f) => &f.jump_tables,
                Callable::Import { .. } => unreachable!(),
            }
        }
    }

    fn reg(&self, r: u32) -> Cell {
        self.stack[self.base + r as usize]
    }

    fn set_reg(&mut self, r: u32, v: Cell) {
        self.stack[self.base + r as usize] = v;
    }

    /// Grows the shared stack so register window `[abs_base, abs_base+len)`
    /// is valid, refusing if that would exceed `config.stack_capacity`.
    fn reserve(&mut self, abs_base: usize, len: usize) -> Result<(), ExecutionError> {
        let needed = abs_base + len;
        if needed > self.config.stack_capacity {
            return Err(ExecutionError::StackOverflow { requested: needed, limit: self.config.stack_capacity });
        }
        if needed > self.stack.len() {
            self.stack.resize(needed, Cell::default());
        }
        Ok(())
    }

    fn memory_mut(&mut self) -> Result<&mut Memory, ExecutionError> {
        self.memory.as_mut().ok_or(ExecutionError::NoMemory)
    }

    /// Effective linear-memory address for a load/store: the operand's
    /// register holds the dynamic part, `offset` is the `memarg`'s static
    /// displacement baked in at translate time.
    fn effective_addr(&self, reg: u32, offset: u32) -> usize {
        self.reg(reg).as_u32() as usize + offset as usize
    }

    // --- calling convention -------------------------------------------------

    /// Invokes `func_index` whose marshaled arguments already sit at
    /// registers `[base_local, base_local+arg_count)` of the *current*
    /// frame. Shared by `StaticCall` (callee known at translate time) and
    /// `DynamicCall` (callee resolved at runtime, either via `call_indirect`
    /// or a just-resolved import).
    fn invoke(&mut self, func_index: usize, base_local: u32, result_count: u32) -> Result<Signal, ExecutionError> {
        let abs_base = self.base + base_local as usize;
        let callable = self.module.functions.get(func_index).ok_or(ExecutionError::FunctionIndexOutOfBounds {
            index: func_index,
            len: self.module.functions.len(),
        })?;
        match callable {
            Callable::Wasm(f) => {
                self.reserve(abs_base, f.register_count as usize)?;
                self.frames.push(Frame {
                    return_func: self.current_func,
                    return_pc: self.pc + 1,
                    caller_base: self.base,
                    callee_base: abs_base,
                    result_count,
                });
                self.base = abs_base;
                self.current_func = func_index;
                self.pc = 0;
                Ok(Signal::Jumped)
            }
            Callable::Import { module, field, type_index } => {
                let arg_count = self.module.types[*type_index as usize].arg_count();
                let host_fn = self
                    .host
                    .lookup(module, field)
                    .ok_or_else(|| ExecutionError::UnresolvedImport { module: module.clone(), field: field.clone() })?;
                let args: Vec<u64> = (0..arg_count).map(|i| self.stack[abs_base + i].0).collect();
                let results = host_fn(&mut self.memory, &args)?;
                for (i, value) in results.into_iter().take(result_count as usize).enumerate() {
                    self.stack[abs_base + i] = Cell(value);
                }
                self.pc += 1;
                Ok(Signal::Jumped)
            }
        }
    }

    fn exec_return(&mut self, base_local: u32, result_count: u32) -> Result<Signal, ExecutionError> {
        let abs_src = self.base + base_local as usize;
        match self.frames.pop() {
            None => {
                let results = self.stack[abs_src..abs_src + result_count as usize].to_vec();
                Ok(Signal::Exit(results))
            }
            Some(frame) if frame.return_func == OUTER => {
                let results = self.stack[abs_src..abs_src + result_count as usize].to_vec();
                Ok(Signal::Exit(results))
            }
            Some(frame) => {
                self.stack.copy_within(abs_src..abs_src + result_count as usize, frame.callee_base);
                self.base = frame.caller_base;
                self.current_func = frame.return_func;
                self.pc = frame.return_pc;
                Ok(Signal::Jumped)
            }
        }
    }

    fn exec_dynamic_call(&mut self, base_local: u32, type_index: u32, result_count: u32) -> Result<Signal, ExecutionError> {
        let ty = &self.module.types[type_index as usize];
        let arg_count = ty.arg_count();
        let index_cell = self.reg(base_local + arg_count as u32);
        let index = index_cell.as_u32() as usize;

        // The table itself is immutable after instantiation, but the index
        // read above comes from a register and can differ on every
        // execution of this same call site (a loop, or a recursive call
        // whose argument drives the index) — so the resolution is never
        // cached, only looked up fresh each time.
        let len = self.module.table.len();
        let slot = self.module.table.get(index).ok_or(ExecutionError::TableIndexOutOfBounds { index, len })?;
        let func_index = slot.ok_or(ExecutionError::UninitializedElement { index })?;
        let actual = self
            .module
            .functions
            .get(func_index as usize)
            .ok_or(ExecutionError::FunctionIndexOutOfBounds { index: func_index as usize, len: self.module.functions.len() })?
            .type_index() as usize;
        if actual != type_index as usize {
            return Err(ExecutionError::IndirectCallTypeMismatch { expected: type_index as usize, actual });
        }
        self.invoke(func_index as usize, base_local, result_count)
    }

    // --- the dispatcher ------------------------------------------------------

    /// Executes one code cell. Shared verbatim by both dispatch modes —
    /// that sharing is what makes "dispatch equivalence" true by
    /// construction rather than by coincidence.
    fn execute(&mut self, instr: Instr) -> Result<Signal, ExecutionError> {
        use IrOp::*;
        match instr.op {
            ThreadedCode | Nop | Drop => Ok(Signal::Next),
            Exit => Ok(Signal::Exit(Vec::new())),
            Unreachable => Err(ExecutionError::Unreachable),

            Return => {
                let count = instr.c.as_count() as u32;
                self.exec_return(instr.a.as_reg(), count)
            }
            Jump => {
                self.pc = instr.b.as_target();
                Ok(Signal::Jumped)
            }
            JumpIfZero => {
                if self.reg(instr.a.as_reg()).as_u32() == 0 {
                    self.pc = instr.b.as_target();
                } else {
                    self.pc += 1;
                }
                Ok(Signal::Jumped)
            }
            JumpIfNonZero => {
                if self.reg(instr.a.as_reg()).as_u32() != 0 {
                    self.pc = instr.b.as_target();
                } else {
                    self.pc += 1;
                }
                Ok(Signal::Jumped)
            }
            JumpTable => {
                let index = self.reg(instr.a.as_reg()).as_u32() as usize;
                let table = match instr.b {
                    Operand::Table(t) => &self.jump_tables()[t as usize],
                    _ => unreachable!("JumpTable.b is always Operand::Table"),
                };
                self.pc = if index < table.targets.len() { table.targets[index] as usize } else { table.default as usize };
                Ok(Signal::Jumped)
            }
            Move => {
                let v = self.reg(instr.b.as_reg());
                self.set_reg(instr.a.as_reg(), v);
                Ok(Signal::Next)
            }
            Select => {
                if self.reg(instr.c.as_reg()).as_u32() == 0 {
                    let v = self.reg(instr.b.as_reg());
                    self.set_reg(instr.a.as_reg(), v);
                }
                Ok(Signal::Next)
            }
            StaticCall => {
                let func_index = match instr.b {
                    Operand::Func(f) => f as usize,
                    _ => unreachable!("StaticCall.b is always Operand::Func"),
                };
                self.invoke(func_index, instr.a.as_reg(), instr.c.as_count() as u32)
            }
            DynamicCall => {
                let type_index = match instr.b {
                    Operand::Type(t) => t,
                    _ => unreachable!("DynamicCall.b is always Operand::Type"),
                };
                self.exec_dynamic_call(instr.a.as_reg(), type_index, instr.c.as_count() as u32)
            }

            LocalGet => {
                let v = self.reg(instr.b.as_reg());
                self.set_reg(instr.a.as_reg(), v);
                Ok(Signal::Next)
            }
            LocalSet | LocalTee => {
                let v = self.reg(instr.b.as_reg());
                self.set_reg(instr.a.as_reg(), v);
                Ok(Signal::Next)
            }
            GlobalGet => {
                let index = instr.c.as_count();
                let v = self.globals[index];
                self.set_reg(instr.a.as_reg(), v);
                Ok(Signal::Next)
            }
            GlobalSet => {
                let index = instr.c.as_count();
                self.globals[index] = self.reg(instr.a.as_reg());
                Ok(Signal::Next)
            }

            I32Load => self.load(instr, |m, a| Ok(Cell::from_i32(i32::from_le_bytes(m.slice(a..a + 4)?.try_into().unwrap())))),
            I64Load => self.load(instr, |m, a| Ok(Cell::from_i64(i64::from_le_bytes(m.slice(a..a + 8)?.try_into().unwrap())))),
            F32Load => self.load(instr, |m, a| Ok(Cell::from_f32(f32::from_le_bytes(m.slice(a..a + 4)?.try_into().unwrap())))),
            F64Load => self.load(instr, |m, a| Ok(Cell::from_f64(f64::from_le_bytes(m.slice(a..a + 8)?.try_into().unwrap())))),
            I32Load8S => self.load(instr, |m, a| Ok(Cell::from_i32(m.slice(a..a + 1)?[0] as i8 as i32))),
            I32Load8U => self.load(instr, |m, a| Ok(Cell::from_i32(m.slice(a..a + 1)?[0] as i32))),
            I32Load16S => self.load(instr, |m, a| Ok(Cell::from_i32(i16::from_le_bytes(m.slice(a..a + 2)?.try_into().unwrap()) as i32))),
            I32Load16U => self.load(instr, |m, a| Ok(Cell::from_i32(u16::from_le_bytes(m.slice(a..a + 2)?.try_into().unwrap()) as i32))),
            I64Load8S => self.load(instr, |m, a| Ok(Cell::from_i64(m.slice(a..a + 1)?[0] as i8 as i64))),
            I64Load8U => self.load(instr, |m, a| Ok(Cell::from_i64(m.slice(a..a + 1)?[0] as i64))),
            I64Load16S => self.load(instr, |m, a| Ok(Cell::from_i64(i16::from_le_bytes(m.slice(a..a + 2)?.try_into().unwrap()) as i64))),
            I64Load16U => self.load(instr, |m, a| Ok(Cell::from_i64(u16::from_le_bytes(m.slice(a..a + 2)?.try_into().unwrap()) as i64))),
            I64Load32S => self.load(instr, |m, a| Ok(Cell::from_i64(i32::from_le_bytes(m.slice(a..a + 4)?.try_into().unwrap()) as i64))),
            I64Load32U => self.load(instr, |m, a| Ok(Cell::from_i64(u32::from_le_bytes(m.slice(a..a + 4)?.try_into().unwrap()) as i64))),

            I32Store => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 4)?.copy_from_slice(&v.as_i32().to_le_bytes());
                Ok(())
            }),
            I64Store => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 8)?.copy_from_slice(&v.as_i64().to_le_bytes());
                Ok(())
            }),
            F32Store => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 4)?.copy_from_slice(&v.as_f32().to_le_bytes());
                Ok(())
            }),
            F64Store => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 8)?.copy_from_slice(&v.as_f64().to_le_bytes());
                Ok(())
            }),
            I32Store8 => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 1)?.copy_from_slice(&[v.as_i32() as u8]);
                Ok(())
            }),
            I32Store16 => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 2)?.copy_from_slice(&(v.as_i32() as u16).to_le_bytes());
                Ok(())
            }),
            I64Store8 => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 1)?.copy_from_slice(&[v.as_i64() as u8]);
                Ok(())
            }),
            I64Store16 => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 2)?.copy_from_slice(&(v.as_i64() as u16).to_le_bytes());
                Ok(())
            }),
            I64Store32 => self.store(instr, |m, a, v: Cell| {
                m.slice_mut(a..a + 4)?.copy_from_slice(&(v.as_i64() as u32).to_le_bytes());
                Ok(())
            }),

            MemorySize => {
                let pages = self.memory.as_ref().ok_or(ExecutionError::NoMemory)?.page_count();
                self.set_reg(instr.a.as_reg(), Cell::from_i32(pages as i32));
                Ok(Signal::Next)
            }
            MemoryGrow => {
                let delta = self.reg(instr.a.as_reg()).as_u32();
                let prev = self.memory_mut()?.grow(delta);
                self.set_reg(instr.b.as_reg(), Cell::from_i32(prev as i32));
                Ok(Signal::Next)
            }

            LoadConstI32 => {
                let v = match instr.b {
                    Operand::ImmI32(v) => v,
                    _ => unreachable!(),
                };
                self.set_reg(instr.a.as_reg(), Cell::from_i32(v));
                Ok(Signal::Next)
            }
            LoadConstI64 => {
                let v = match instr.b {
                    Operand::ImmI64(v) => v,
                    _ => unreachable!(),
                };
                self.set_reg(instr.a.as_reg(), Cell::from_i64(v));
                Ok(Signal::Next)
            }
            LoadConstF32 => {
                let bits = match instr.b {
                    Operand::ImmF32Bits(b) => b,
                    _ => unreachable!(),
                };
                self.set_reg(instr.a.as_reg(), Cell::from_f32(f32::from_bits(bits)));
                Ok(Signal::Next)
            }
            LoadConstF64 => {
                let bits = match instr.b {
                    Operand::ImmF64Bits(b) => b,
                    _ => unreachable!(),
                };
                self.set_reg(instr.a.as_reg(), Cell::from_f64(f64::from_bits(bits)));
                Ok(Signal::Next)
            }

            I32Eqz => self.unary(instr, |v| Cell::from_bool(v.as_i32() == 0)),
            I32Eq => self.binary(instr, |a, b| Cell::from_bool(a.as_i32() == b.as_i32())),
            I32Ne => self.binary(instr, |a, b| Cell::from_bool(a.as_i32() != b.as_i32())),
            I32LtS => self.binary(instr, |a, b| Cell::from_bool(a.as_i32() < b.as_i32())),
            I32LtU => self.binary(instr, |a, b| Cell::from_bool(a.as_u32() < b.as_u32())),
            I32GtS => self.binary(instr, |a, b| Cell::from_bool(a.as_i32() > b.as_i32())),
            I32GtU => self.binary(instr, |a, b| Cell::from_bool(a.as_u32() > b.as_u32())),
            I32LeS => self.binary(instr, |a, b| Cell::from_bool(a.as_i32() <= b.as_i32())),
            I32LeU => self.binary(instr, |a, b| Cell::from_bool(a.as_u32() <= b.as_u32())),
            I32GeS => self.binary(instr, |a, b| Cell::from_bool(a.as_i32() >= b.as_i32())),
            I32GeU => self.binary(instr, |a, b| Cell::from_bool(a.as_u32() >= b.as_u32())),
            I64Eqz => self.unary(instr, |v| Cell::from_bool(v.as_i64() == 0)),
            I64Eq => self.binary(instr, |a, b| Cell::from_bool(a.as_i64() == b.as_i64())),
            I64Ne => self.binary(instr, |a, b| Cell::from_bool(a.as_i64() != b.as_i64())),
            I64LtS => self.binary(instr, |a, b| Cell::from_bool(a.as_i64() < b.as_i64())),
            I64LtU => self.binary(instr, |a, b| Cell::from_bool(a.as_u64() < b.as_u64())),
            I64GtS => self.binary(instr, |a, b| Cell::from_bool(a.as_i64() > b.as_i64())),
            I64GtU => self.binary(instr, |a, b| Cell::from_bool(a.as_u64() > b.as_u64())),
            I64LeS => self.binary(instr, |a, b| Cell::from_bool(a.as_i64() <= b.as_i64())),
            I64LeU => self.binary(instr, |a, b| Cell::from_bool(a.as_u64() <= b.as_u64())),
            I64GeS => self.binary(instr, |a, b| Cell::from_bool(a.as_i64() >= b.as_i64())),
            I64GeU => self.binary(instr, |a, b| Cell::from_bool(a.as_u64() >= b.as_u64())),
            F32Eq => self.binary(instr, |a, b| Cell::from_bool(a.as_f32() == b.as_f32())),
            F32Ne => self.binary(instr, |a, b| Cell::from_bool(a.as_f32() != b.as_f32())),
            F32Lt => self.binary(instr, |a, b| Cell::from_bool(a.as_f32() < b.as_f32())),
            F32Gt => self.binary(instr, |a, b| Cell::from_bool(a.as_f32() > b.as_f32())),
            F32Le => self.binary(instr, |a, b| Cell::from_bool(a.as_f32() <= b.as_f32())),
            F32Ge => self.binary(instr, |a, b| Cell::from_bool(a.as_f32() >= b.as_f32())),
            F64Eq => self.binary(instr, |a, b| Cell::from_bool(a.as_f64() == b.as_f64())),
            F64Ne => self.binary(instr, |a, b| Cell::from_bool(a.as_f64() != b.as_f64())),
            F64Lt => self.binary(instr, |a, b| Cell::from_bool(a.as_f64() < b.as_f64())),
            F64Gt => self.binary(instr, |a, b| Cell::from_bool(a.as_f64() > b.as_f64())),
            F64Le => self.binary(instr, |a, b| Cell::from_bool(a.as_f64() <= b.as_f64())),
            F64Ge => self.binary(instr, |a, b| Cell::from_bool(a.as_f64() >= b.as_f64())),

            I32Clz => self.unary(instr, |v| Cell::from_i32(v.as_u32().leading_zeros() as i32)),
            I32Ctz => self.unary(instr, |v| Cell::from_i32(v.as_u32().trailing_zeros() as i32)),
            I32Popcnt => self.unary(instr, |v| Cell::from_i32(v.as_u32().count_ones() as i32)),
            I32Add => self.binary(instr, |a, b| Cell::from_i32(a.as_i32().wrapping_add(b.as_i32()))),
            I32Sub => self.binary(instr, |a, b| Cell::from_i32(a.as_i32().wrapping_sub(b.as_i32()))),
            I32Mul => self.binary(instr, |a, b| Cell::from_i32(a.as_i32().wrapping_mul(b.as_i32()))),
            I32DivS => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_i32(), b.as_i32());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                if a == i32::MIN && b == -1 {
                    return Err(ExecutionError::SignedDivideOverflow);
                }
                Ok(Cell::from_i32(a / b))
            }),
            I32DivU => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_u32(), b.as_u32());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                Ok(Cell::from_i32((a / b) as i32))
            }),
            I32RemS => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_i32(), b.as_i32());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                Ok(Cell::from_i32(a.wrapping_rem(b)))
            }),
            I32RemU => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_u32(), b.as_u32());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                Ok(Cell::from_i32((a % b) as i32))
            }),
            I32And => self.binary(instr, |a, b| Cell::from_i32(a.as_i32() & b.as_i32())),
            I32Or => self.binary(instr, |a, b| Cell::from_i32(a.as_i32() | b.as_i32())),
            I32Xor => self.binary(instr, |a, b| Cell::from_i32(a.as_i32() ^ b.as_i32())),
            I32Shl => self.binary(instr, |a, b| Cell::from_i32(a.as_i32().wrapping_shl(b.as_u32() & 31))),
            I32ShrS => self.binary(instr, |a, b| Cell::from_i32(a.as_i32().wrapping_shr(b.as_u32() & 31))),
            I32ShrU => self.binary(instr, |a, b| Cell::from_i32(a.as_u32().wrapping_shr(b.as_u32() & 31) as i32)),
            I32Rotl => self.binary(instr, |a, b| Cell::from_i32(a.as_u32().rotate_left(b.as_u32() & 31) as i32)),
            I32Rotr => self.binary(instr, |a, b| Cell::from_i32(a.as_u32().rotate_right(b.as_u32() & 31) as i32)),

            I64Clz => self.unary(instr, |v| Cell::from_i64(v.as_u64().leading_zeros() as i64)),
            I64Ctz => self.unary(instr, |v| Cell::from_i64(v.as_u64().trailing_zeros() as i64)),
            I64Popcnt => self.unary(instr, |v| Cell::from_i64(v.as_u64().count_ones() as i64)),
            I64Add => self.binary(instr, |a, b| Cell::from_i64(a.as_i64().wrapping_add(b.as_i64()))),
            I64Sub => self.binary(instr, |a, b| Cell::from_i64(a.as_i64().wrapping_sub(b.as_i64()))),
            I64Mul => self.binary(instr, |a, b| Cell::from_i64(a.as_i64().wrapping_mul(b.as_i64()))),
            I64DivS => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_i64(), b.as_i64());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                if a == i64::MIN && b == -1 {
                    return Err(ExecutionError::SignedDivideOverflow);
                }
                Ok(Cell::from_i64(a / b))
            }),
            I64DivU => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_u64(), b.as_u64());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                Ok(Cell::from_i64((a / b) as i64))
            }),
            I64RemS => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_i64(), b.as_i64());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                Ok(Cell::from_i64(a.wrapping_rem(b)))
            }),
            I64RemU => self.checked_binary(instr, |a, b| {
                let (a, b) = (a.as_u64(), b.as_u64());
                if b == 0 {
                    return Err(ExecutionError::DivideByZero);
                }
                Ok(Cell::from_i64((a % b) as i64))
            }),
            I64And => self.binary(instr, |a, b| Cell::from_i64(a.as_i64() & b.as_i64())),
            I64Or => self.binary(instr, |a, b| Cell::from_i64(a.as_i64() | b.as_i64())),
            I64Xor => self.binary(instr, |a, b| Cell::from_i64(a.as_i64() ^ b.as_i64())),
            I64Shl => self.binary(instr, |a, b| Cell::from_i64(a.as_i64().wrapping_shl((b.as_u64() & 63) as u32))),
            I64ShrS => self.binary(instr, |a, b| Cell::from_i64(a.as_i64().wrapping_shr((b.as_u64() & 63) as u32))),
            I64ShrU => self.binary(instr, |a, b| Cell::from_i64(a.as_u64().wrapping_shr((b.as_u64() & 63) as u32) as i64)),
            I64Rotl => self.binary(instr, |a, b| Cell::from_i64(a.as_u64().rotate_left((b.as_u64() & 63) as u32) as i64)),
            I64Rotr => self.binary(instr, |a, b| Cell::from_i64(a.as_u64().rotate_right((b.as_u64() & 63) as u32) as i64)),

            F32Abs => self.unary(instr, |v| Cell::from_f32(v.as_f32().abs())),
            F32Neg => self.unary(instr, |v| Cell::from_f32(-v.as_f32())),
            F32Ceil => self.unary(instr, |v| Cell::from_f32(v.as_f32().ceil())),
            F32Floor => self.unary(instr, |v| Cell::from_f32(v.as_f32().floor())),
            F32Trunc => self.unary(instr, |v| Cell::from_f32(v.as_f32().trunc())),
            F32Nearest => self.unary(instr, |v| Cell::from_f32(round_ties_even_f32(v.as_f32()))),
            F32Sqrt => self.unary(instr, |v| Cell::from_f32(v.as_f32().sqrt())),
            F32Add => self.binary(instr, |a, b| Cell::from_f32(a.as_f32() + b.as_f32())),
            F32Sub => self.binary(instr, |a, b| Cell::from_f32(a.as_f32() - b.as_f32())),
            F32Mul => self.binary(instr, |a, b| Cell::from_f32(a.as_f32() * b.as_f32())),
            F32Div => self.binary(instr, |a, b| Cell::from_f32(a.as_f32() / b.as_f32())),
            F32Min => self.binary(instr, |a, b| Cell::from_f32(wasm_fmin(a.as_f32(), b.as_f32()))),
            F32Max => self.binary(instr, |a, b| Cell::from_f32(wasm_fmax(a.as_f32(), b.as_f32()))),
            F32Copysign => self.binary(instr, |a, b| Cell::from_f32(a.as_f32().copysign(b.as_f32()))),
            F64Abs => self.unary(instr, |v| Cell::from_f64(v.as_f64().abs())),
            F64Neg => self.unary(instr, |v| Cell::from_f64(-v.as_f64())),
            F64Ceil => self.unary(instr, |v| Cell::from_f64(v.as_f64().ceil())),
            F64Floor => self.unary(instr, |v| Cell::from_f64(v.as_f64().floor())),
            F64Trunc => self.unary(instr, |v| Cell::from_f64(v.as_f64().trunc())),
            F64Nearest => self.unary(instr, |v| Cell::from_f64(round_ties_even_f64(v.as_f64()))),
            F64Sqrt => self.unary(instr, |v| Cell::from_f64(v.as_f64().sqrt())),
            F64Add => self.binary(instr, |a, b| Cell::from_f64(a.as_f64() + b.as_f64())),
            F64Sub => self.binary(instr, |a, b| Cell::from_f64(a.as_f64() - b.as_f64())),
            F64Mul => self.binary(instr, |a, b| Cell::from_f64(a.as_f64() * b.as_f64())),
            F64Div => self.binary(instr, |a, b| Cell::from_f64(a.as_f64() / b.as_f64())),
            F64Min => self.binary(instr, |a, b| Cell::from_f64(wasm_fmin(a.as_f64(), b.as_f64()))),
            F64Max => self.binary(instr, |a, b| Cell::from_f64(wasm_fmax(a.as_f64(), b.as_f64()))),
            F64Copysign => self.binary(instr, |a, b| Cell::from_f64(a.as_f64().copysign(b.as_f64()))),

            I32WrapI64 => self.unary(instr, |v| Cell::from_i32(v.as_i64() as i32)),
            I32TruncF32S => self.checked_unary(instr, |v| trunc_f32_to_i32(v.as_f32(), true).map(Cell::from_i32)),
            I32TruncF32U => self.checked_unary(instr, |v| trunc_f32_to_i32(v.as_f32(), false).map(|n| Cell::from_i32(n as u32 as i32))),
            I32TruncF64S => self.checked_unary(instr, |v| trunc_f64_to_i32(v.as_f64(), true).map(Cell::from_i32)),
            I32TruncF64U => self.checked_unary(instr, |v| trunc_f64_to_i32(v.as_f64(), false).map(|n| Cell::from_i32(n as u32 as i32))),
            I64ExtendI32S => self.unary(instr, |v| Cell::from_i64(v.as_i32() as i64)),
            I64ExtendI32U => self.unary(instr, |v| Cell::from_i64(v.as_u32() as i64)),
            I64TruncF32S => self.checked_unary(instr, |v| trunc_f32_to_i64(v.as_f32(), true).map(Cell::from_i64)),
            I64TruncF32U => self.checked_unary(instr, |v| trunc_f32_to_i64(v.as_f32(), false).map(|n| Cell::from_i64(n as u64 as i64))),
            I64TruncF64S => self.checked_unary(instr, |v| trunc_f64_to_i64(v.as_f64(), true).map(Cell::from_i64)),
            I64TruncF64U => self.checked_unary(instr, |v| trunc_f64_to_i64(v.as_f64(), false).map(|n| Cell::from_i64(n as u64 as i64))),
            F32ConvertI32S => self.unary(instr, |v| Cell::from_f32(v.as_i32() as f32)),
            F32ConvertI32U => self.unary(instr, |v| Cell::from_f32(v.as_u32() as f32)),
            F32ConvertI64S => self.unary(instr, |v| Cell::from_f32(v.as_i64() as f32)),
            F32ConvertI64U => self.unary(instr, |v| Cell::from_f32(v.as_u64() as f32)),
            F32DemoteF64 => self.unary(instr, |v| Cell::from_f32(v.as_f64() as f32)),
            F64ConvertI32S => self.unary(instr, |v| Cell::from_f64(v.as_i32() as f64)),
            F64ConvertI32U => self.unary(instr, |v| Cell::from_f64(v.as_u32() as f64)),
            F64ConvertI64S => self.unary(instr, |v| Cell::from_f64(v.as_i64() as f64)),
            F64ConvertI64U => self.unary(instr, |v| Cell::from_f64(v.as_u64() as f64)),
            F64PromoteF32 => self.unary(instr, |v| Cell::from_f64(v.as_f32() as f64)),
            I32ReinterpretF32 => self.unary(instr, |v| Cell::from_i32(v.as_f32().to_bits() as i32)),
            I64ReinterpretF64 => self.unary(instr, |v| Cell::from_i64(v.as_f64().to_bits() as i64)),
            F32ReinterpretI32 => self.unary(instr, |v| Cell::from_f32(f32::from_bits(v.as_u32()))),
            F64ReinterpretI64 => self.unary(instr, |v| Cell::from_f64(f64::from_bits(v.as_u64()))),
            I32Extend8S => self.unary(instr, |v| Cell::from_i32(v.as_i32() as i8 as i32)),
            I32Extend16S => self.unary(instr, |v| Cell::from_i32(v.as_i32() as i16 as i32)),
            I64Extend8S => self.unary(instr, |v| Cell::from_i64(v.as_i64() as i8 as i64)),
            I64Extend16S => self.unary(instr, |v| Cell::from_i64(v.as_i64() as i16 as i64)),
            I64Extend32S => self.unary(instr, |v| Cell::from_i64(v.as_i64() as i32 as i64)),

            I32TruncSatF32S => self.unary(instr, |v| Cell::from_i32(sat_f32_to_i32(v.as_f32(), true) as i32)),
            I32TruncSatF32U => self.unary(instr, |v| Cell::from_i32(sat_f32_to_i32(v.as_f32(), false) as u32 as i32)),
            I32TruncSatF64S => self.unary(instr, |v| Cell::from_i32(sat_f64_to_i32(v.as_f64(), true) as i32)),
            I32TruncSatF64U => self.unary(instr, |v| Cell::from_i32(sat_f64_to_i32(v.as_f64(), false) as u32 as i32)),
            I64TruncSatF32S => self.unary(instr, |v| Cell::from_i64(sat_f32_to_i64(v.as_f32(), true))),
            I64TruncSatF32U => self.unary(instr, |v| Cell::from_i64(sat_f32_to_i64(v.as_f32(), false) as u64 as i64)),
            I64TruncSatF64S => self.unary(instr, |v| Cell::from_i64(sat_f64_to_i64(v.as_f64(), true))),
            I64TruncSatF64U => self.unary(instr, |v| Cell::from_i64(sat_f64_to_i64(v.as_f64(), false) as u64 as i64)),
        }
    }

    fn unary(&mut self, instr: Instr, f: impl FnOnce(Cell) -> Cell) -> Result<Signal, ExecutionError> {
        let v = f(self.reg(instr.b.as_reg()));
        self.set_reg(instr.a.as_reg(), v);
        Ok(Signal::Next)
    }

    fn checked_unary(&mut self, instr: Instr, f: impl FnOnce(Cell) -> Result<Cell, ExecutionError>) -> Result<Signal, ExecutionError> {
        let v = f(self.reg(instr.b.as_reg()))?;
        self.set_reg(instr.a.as_reg(), v);
        Ok(Signal::Next)
    }

    fn binary(&mut self, instr: Instr, f: impl FnOnce(Cell, Cell) -> Cell) -> Result<Signal, ExecutionError> {
        let v = f(self.reg(instr.b.as_reg()), self.reg(instr.c.as_reg()));
        self.set_reg(instr.a.as_reg(), v);
        Ok(Signal::Next)
    }

    fn checked_binary(&mut self, instr: Instr, f: impl FnOnce(Cell, Cell) -> Result<Cell, ExecutionError>) -> Result<Signal, ExecutionError> {
        let v = f(self.reg(instr.b.as_reg()), self.reg(instr.c.as_reg()))?;
        self.set_reg(instr.a.as_reg(), v);
        Ok(Signal::Next)
    }

    fn load(&mut self, instr: Instr, f: impl FnOnce(&Memory, usize) -> Result<Cell, ExecutionError>) -> Result<Signal, ExecutionError> {
        let addr = self.effective_addr(instr.a.as_reg(), instr.c.as_count() as u32);
        let mem = self.memory.as_ref().ok_or(ExecutionError::NoMemory)?;
        let v = f(mem, addr)?;
        self.set_reg(instr.b.as_reg(), v);
        Ok(Signal::Next)
    }

    fn store(&mut self, instr: Instr, f: impl FnOnce(&mut Memory, usize, Cell) -> Result<(), ExecutionError>) -> Result<Signal, ExecutionError> {
        let addr = self.effective_addr(instr.a.as_reg(), instr.c.as_count() as u32);
        let value = self.reg(instr.b.as_reg());
        let mem = self.memory_mut()?;
        f(mem, addr, value)?;
        Ok(Signal::Next)
    }

    /// Builds (once per function) a handler table standing in for the
    /// computed-goto label table: one function-pointer entry per code cell,
    /// all currently pointing at the same dispatch-through-`execute` thunk.
    /// What changes between switched and threaded mode is the indirection
    /// used to reach a cell's handler, not the cell's semantics — those live
    /// in `execute` and are therefore provably shared.
    fn threaded_table(&mut self) -> &[Handler<'m>] {
        let key = self.current_func;
        let len = self.code().len();
        self.threaded_tables
            .entry(key)
            .or_insert_with(|| vec![Self::dispatch_cell as Handler<'m>; len])
            .as_slice()
    }

    fn dispatch_cell(&mut self) -> Result<Signal, ExecutionError> {
        let instr = self.code()[self.pc];
        self.execute(instr)
    }

    fn step(&mut self) -> Result<Signal, ExecutionError> {
        let signal = match self.config.dispatch {
            DispatchMode::Switched => self.dispatch_cell(),
            DispatchMode::Threaded => {
                let table = self.threaded_table();
                let handler = table[self.pc];
                handler(self)
            }
        }?;
        if matches!(signal, Signal::Next) {
            self.pc += 1;
        }
        Ok(signal)
    }

    fn run(&mut self) -> Result<Vec<Cell>, ExecutionError> {
        loop {
            trace!(func = self.current_func, pc = self.pc, "step");
            match self.step()? {
                Signal::Exit(results) => return Ok(results),
                Signal::Next | Signal::Jumped => {}
            }
        }
    }

    fn run_global_init(&mut self) -> Result<(), ExecutionError> {
        self.current_func = OUTER;
        self.base = 0;
        self.pc = 0;
        self.reserve(0, self.module.global_init_registers as usize)?;
        let len = self.module.global_init.code.len();
        while self.pc < len {
            self.step()?;
        }
        Ok(())
    }
}

/// Idempotently materializes whatever the selected dispatch mode needs
/// before the first `eval_module` call. Under `Switched` there is nothing to
/// build; under `Threaded` this simply documents the contract the real
/// spec's `virtual_machine_init` names — the handler tables themselves are
/// built lazily, per function, the first time each is entered.
pub fn virtual_machine_init(_module: &Module) {}

/// Runs `module`'s global initializer then its exported `_start`, returning
/// `_start`'s result values. `host` supplies allocation accounting and any
/// registered host functions imports may resolve against. `args` supplies
/// `_start`'s arguments (if its signature declares any) — the caller writes
/// them into the callee's argument slots, exactly as a `StaticCall` site
/// would for an ordinary direct call.
#[instrument(skip(module, host, args), fields(dispatch = ?config.dispatch))]
pub fn eval_module(module: &Module, host: &Host, config: VmConfig, args: &[Cell]) -> Result<Vec<Cell>, ExecutionError> {
    let memory = module.memory.as_ref().map(Memory::from);
    let mut vm = Vm {
        module,
        host,
        config,
        stack: Vec::new(),
        frames: Vec::new(),
        globals: vec![Cell::default(); module.global_types.len()],
        memory,
        base: 0,
        current_func: OUTER,
        pc: 0,
        threaded_tables: HashMap::new(),
    };

    vm.run_global_init()?;
    apply_data_segments(&mut vm)?;

    let start_index = module.start_function_index().ok_or(ExecutionError::MissingEntrypoint)?;
    let ty = &module.types[module.functions[start_index].type_index() as usize];
    let result_count = ty.result_count() as u32;
    let arg_count = ty.arg_count();

    vm.frames.clear();
    vm.base = 0;
    vm.current_func = OUTER;
    vm.pc = 0;
    vm.reserve(0, arg_count.max(result_count as usize))?;
    for (i, arg) in args.iter().take(arg_count).enumerate() {
        vm.stack[i] = *arg;
    }
    match vm.invoke(start_index, 0, result_count)? {
        Signal::Exit(results) => Ok(results),
        _ => vm.run(),
    }
}

fn apply_data_segments(vm: &mut Vm<'_>) -> Result<(), ExecutionError> {
    let module = vm.module;
    for segment in &module.data_segments {
        let mem = vm.memory_mut()?;
        let start = segment.offset as usize;
        mem.slice_mut(start..start + segment.bytes.len())?.copy_from_slice(&segment.bytes);
    }
    Ok(())
}

fn wasm_fmin(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_negative() || b.is_sign_negative() { -0.0 } else { 0.0 };
    }
    a.min(b)
}

fn wasm_fmax(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        return f32::NAN;
    }
    if a == 0.0 && b == 0.0 {
        return if a.is_sign_positive() || b.is_sign_positive() { 0.0 } else { -0.0 };
    }
    a.max(b)
}

fn round_ties_even_f32(v: f32) -> f32 {
    let r = v.round();
    if (v - v.trunc()).abs() == 0.5 && (r as i64) % 2 != 0 { r - v.signum() } else { r }
}

fn round_ties_even_f64(v: f64) -> f64 {
    let r = v.round();
    if (v - v.trunc()).abs() == 0.5 && (r as i64) % 2 != 0 { r - v.signum() } else { r }
}

fn trunc_f32_to_i32(v: f32, signed: bool) -> Result<i32, ExecutionError> {
    if v.is_nan() {
        return Err(ExecutionError::InvalidTruncation);
    }
    let t = v.trunc();
    let (lo, hi) = if signed { (i32::MIN as f32, 2147483648.0f32) } else { (-1.0f32, 4294967296.0f32) };
    if t <= lo || t >= hi {
        return Err(ExecutionError::InvalidTruncation);
    }
    Ok(t as i32)
}

fn trunc_f64_to_i32(v: f64, signed: bool) -> Result<i32, ExecutionError> {
    if v.is_nan() {
        return Err(ExecutionError::InvalidTruncation);
    }
    let t = v.trunc();
    let (lo, hi) = if signed { (i32::MIN as f64 - 1.0, 2147483648.0f64) } else { (-1.0f64, 4294967296.0f64) };
    if t <= lo || t >= hi {
        return Err(ExecutionError::InvalidTruncation);
    }
    Ok(t as i32)
}

fn trunc_f32_to_i64(v: f32, signed: bool) -> Result<i64, ExecutionError> {
    if v.is_nan() {
        return Err(ExecutionError::InvalidTruncation);
    }
    let t = v.trunc();
    let (lo, hi) = if signed { (-9223372036854775808.0f32, 9223372036854775808.0f32) } else { (-1.0f32, 18446744073709551616.0f32) };
    if t <= lo || t >= hi {
        return Err(ExecutionError::InvalidTruncation);
    }
    Ok(t as i64)
}

fn trunc_f64_to_i64(v: f64, signed: bool) -> Result<i64, ExecutionError> {
    if v.is_nan() {
        return Err(ExecutionError::InvalidTruncation);
    }
    let t = v.trunc();
    let (lo, hi) = if signed { (-9223372036854775808.0f64, 9223372036854775808.0f64) } else { (-1.0f64, 18446744073709551616.0f64) };
    if t <= lo || t >= hi {
        return Err(ExecutionError::InvalidTruncation);
    }
    Ok(t as i64)
}

fn sat_f32_to_i32(v: f32, signed: bool) -> i32 {
    if v.is_nan() {
        return 0;
    }
    if signed {
        if v <= i32::MIN as f32 { i32::MIN } else if v >= 2147483648.0f32 { i32::MAX } else { v.trunc() as i32 }
    } else if v <= -1.0 {
        0
    } else if v >= 4294967296.0f32 {
        u32::MAX as i32
    } else {
        v.trunc() as u32 as i32
    }
}

fn sat_f64_to_i32(v: f64, signed: bool) -> i32 {
    if v.is_nan() {
        return 0;
    }
    if signed {
        if v <= i32::MIN as f64 { i32::MIN } else if v >= 2147483648.0f64 { i32::MAX } else { v.trunc() as i32 }
    } else if v <= -1.0 {
        0
    } else if v >= 4294967296.0f64 {
        u32::MAX as i32
    } else {
        v.trunc() as u32 as i32
    }
}

fn sat_f32_to_i64(v: f32, signed: bool) -> i64 {
    if v.is_nan() {
        return 0;
    }
    if signed {
        if v <= -9223372036854775808.0f32 { i64::MIN } else if v >= 9223372036854775808.0f32 { i64::MAX } else { v.trunc() as i64 }
    } else if v <= -1.0 {
        0
    } else if v >= 18446744073709551616.0f32 {
        u64::MAX as i64
    } else {
        v.trunc() as u64 as i64
    }
}

fn sat_f64_to_i64(v: f64, signed: bool) -> i64 {
    if v.is_nan() {
        return 0;
    }
    if signed {
        if v <= -9223372036854775808.0f64 { i64::MIN } else if v >= 9223372036854775808.0f64 { i64::MAX } else { v.trunc() as i64 }
    } else if v <= -1.0 {
        0
    } else if v >= 18446744073709551616.0f64 {
        u64::MAX as i64
    } else {
        v.trunc() as u64 as i64
    }
}
