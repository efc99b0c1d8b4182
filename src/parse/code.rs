//! The register-form internal code record: a fixed-width cell holding an
//! opcode discriminator plus three operand slots, produced by the translator
//! and consumed by the VM dispatcher. This is the seam between the decoder
//! and the VM.

/// Internal opcodes: the WebAssembly 1.0 numeric/memory/variable-access set,
/// renamed to the register machine's own naming, plus the control-flow and
/// call-plumbing opcodes the translator emits (`Exit`, `Return`, `Jump`,
/// `JumpIfZero`/`JumpIfNonZero`, `JumpTable`, `Move`, `DynamicCall`,
/// `StaticCall`, `ThreadedCode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub enum IrOp {
    // --- internal control / call plumbing ---
    /// One-shot prelude cell; populates the threaded dispatch label table.
    ThreadedCode,
    /// Returns control to the embedder.
    Exit,
    /// `a` = register of first result, `c` = result count.
    Return,
    /// Unconditional jump to `target` (patched by the translator).
    Jump,
    /// Jumps to `target` (`b`) if register `a` is zero — used for `if`,
    /// where the fallthrough is the taken-branch path and a zero condition
    /// means "skip to the else/end".
    JumpIfZero,
    /// Jumps to `target` (`b`) if register `a` is nonzero — used for
    /// `br_if`, where a nonzero condition is the one that branches.
    JumpIfNonZero,
    /// `a` is an index register; jumps through the function's `b`-th jump
    /// table, or to the table's trailing default entry if out of range.
    JumpTable,
    /// Copies the cell at register `b` into register `a`.
    Move,
    /// Resolved call to a function known at translate time (direct `call`).
    StaticCall,
    /// Call resolved at runtime against the module's function table, used
    /// for `call_indirect` where the callee index is a runtime value.
    DynamicCall,
    Unreachable,
    Nop,
    Drop,
    /// `a` = destination, `b`/`c` = the two values, condition popped from `a`
    /// beforehand is encoded via a dedicated condition register in `extra`.
    Select,

    LocalGet,
    LocalSet,
    LocalTee,
    GlobalGet,
    GlobalSet,

    I32Load,
    I64Load,
    F32Load,
    F64Load,
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I64Load8S,
    I64Load8U,
    I64Load16S,
    I64Load16U,
    I64Load32S,
    I64Load32U,
    I32Store,
    I64Store,
    F32Store,
    F64Store,
    I32Store8,
    I32Store16,
    I64Store8,
    I64Store16,
    I64Store32,

    MemorySize,
    MemoryGrow,

    LoadConstI32,
    LoadConstI64,
    LoadConstF32,
    LoadConstF64,

    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,
    I64Eqz,
    I64Eq,
    I64Ne,
    I64LtS,
    I64LtU,
    I64GtS,
    I64GtU,
    I64LeS,
    I64LeU,
    I64GeS,
    I64GeU,
    F32Eq,
    F32Ne,
    F32Lt,
    F32Gt,
    F32Le,
    F32Ge,
    F64Eq,
    F64Ne,
    F64Lt,
    F64Gt,
    F64Le,
    F64Ge,

    I32Clz,
    I32Ctz,
    I32Popcnt,
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32DivU,
    I32RemS,
    I32RemU,
    I32And,
    I32Or,
    I32Xor,
    I32Shl,
    I32ShrS,
    I32ShrU,
    I32Rotl,
    I32Rotr,
    I64Clz,
    I64Ctz,
    I64Popcnt,
    I64Add,
    I64Sub,
    I64Mul,
    I64DivS,
    I64DivU,
    I64RemS,
    I64RemU,
    I64And,
    I64Or,
    I64Xor,
    I64Shl,
    I64ShrS,
    I64ShrU,
    I64Rotl,
    I64Rotr,

    F32Abs,
    F32Neg,
    F32Ceil,
    F32Floor,
    F32Trunc,
    F32Nearest,
    F32Sqrt,
    F32Add,
    F32Sub,
    F32Mul,
    F32Div,
    F32Min,
    F32Max,
    F32Copysign,
    F64Abs,
    F64Neg,
    F64Ceil,
    F64Floor,
    F64Trunc,
    F64Nearest,
    F64Sqrt,
    F64Add,
    F64Sub,
    F64Mul,
    F64Div,
    F64Min,
    F64Max,
    F64Copysign,

    I32WrapI64,
    I32TruncF32S,
    I32TruncF32U,
    I32TruncF64S,
    I32TruncF64U,
    I64ExtendI32S,
    I64ExtendI32U,
    I64TruncF32S,
    I64TruncF32U,
    I64TruncF64S,
    I64TruncF64U,
    F32ConvertI32S,
    F32ConvertI32U,
    F32ConvertI64S,
    F32ConvertI64U,
    F32DemoteF64,
    F64ConvertI32S,
    F64ConvertI32U,
    F64ConvertI64S,
    F64ConvertI64U,
    F64PromoteF32,
    I32ReinterpretF32,
    I64ReinterpretF64,
    F32ReinterpretI32,
    F64ReinterpretI64,
    I32Extend8S,
    I32Extend16S,
    I64Extend8S,
    I64Extend16S,
    I64Extend32S,

    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
}

/// One of an instruction's three operand slots. Which variant is valid for a
/// given slot is dictated entirely by the opcode that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// A stack-slot index, relative to the active frame's register window.
    Reg(u32),
    ImmI32(i32),
    ImmI64(i64),
    /// `f32`/`f64` bit patterns; kept as bits so `Operand` can derive `Eq`.
    ImmF32Bits(u32),
    ImmF64Bits(u64),
    /// A patched branch target: an index into the owning function's `code`.
    Target(u32),
    /// An index into the module's function table.
    Func(u32),
    /// An index into the module's type table (`call_indirect`).
    Type(u32),
    /// An index into the owning function's `jump_tables`.
    Table(u32),
    /// A small immediate count (e.g. a `Return`'s result count).
    Count(u32),
}

impl Operand {
    pub fn as_reg(self) -> u32 {
        match self {
            Operand::Reg(r) => r,
            other => panic!("expected Operand::Reg, found {other:?}"),
        }
    }

    pub fn as_target(self) -> usize {
        match self {
            Operand::Target(t) => t as usize,
            other => panic!("expected Operand::Target, found {other:?}"),
        }
    }

    pub fn as_count(self) -> usize {
        match self {
            Operand::Count(c) => c as usize,
            other => panic!("expected Operand::Count, found {other:?}"),
        }
    }
}

/// A fixed-width instruction cell: one opcode discriminator, three operand
/// slots, and (only meaningful once threaded dispatch has run at least once)
/// a cached handler index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub op: IrOp,
    pub a: Operand,
    pub b: Operand,
    pub c: Operand,
}

impl Instr {
    pub fn new(op: IrOp) -> Self {
        Self { op, a: Operand::None, b: Operand::None, c: Operand::None }
    }

    pub fn with_a(mut self, a: Operand) -> Self {
        self.a = a;
        self
    }

    pub fn with_b(mut self, b: Operand) -> Self {
        self.b = b;
        self
    }

    pub fn with_c(mut self, c: Operand) -> Self {
        self.c = c;
        self
    }
}

/// A `br_table` jump table: `targets[i]` for an in-range index, `default`
/// otherwise. Bound-checked as `index < targets.len()`.
#[derive(Debug, Clone, Default)]
pub struct JumpTable {
    pub targets: Vec<u32>,
    pub default: u32,
}
