//! Instruction translation: turns the stack-oriented source opcode stream
//! into the register-form internal code, wiring up branch targets as it
//! goes.
//!
//! Registers are never reused within a function: `next_reg` is a
//! monotonically increasing allocator, and `val_stack` is a separate
//! compile-time stack of register ids that models the *source* operand
//! stack. Because a register is only ever written once, any register id
//! already sitting in `val_stack` can be read again later without fear of
//! aliasing — `local.get`/`global.get` still copy into a fresh register
//! because the *source* local can be reassigned while a stale copy is still
//! live on the operand stack.

use crate::parse::code::{Instr, IrOp, JumpTable, Operand};
use crate::parse::error::ParseError;
use crate::parse::opcode::{Opcode, TruncSatOpcode};
use crate::parse::types::{FunctionType, MemArg, ValueType};
use crate::leb;

/// A block's MVP blocktype carries at most one result value (the multi-value
/// proposal's function-type blocktypes are out of scope). `result_reg` is
/// the merge register exiting the block writes into — whichever path is
/// taken (fallthrough, or a `br`/`br_if` to this label), the value lands in
/// the same register, so code after the block can read it without caring
/// which path ran. `loop`'s branch label refers to its *start*, which in the
/// MVP always has empty params, so branching to a loop never merges a value
/// — only falling off its `end` does. A `br_table` target carrying a block
/// result is not merged into a shared register; no produced module is
/// expected to rely on that.
enum BlockKind {
    Block,
    Loop { start: usize },
    If { else_seen: bool, cond_jump_cell: usize, val_stack_entry_len: usize },
    FunctionBody,
}

struct BlockCtx {
    kind: BlockKind,
    end_fixups: Vec<Fixup>,
    result_reg: Option<u32>,
}

enum Fixup {
    Cell(usize),
    TableEntry { table: u32, slot: Option<usize> },
}

pub struct Translator<'m> {
    bytes: &'m [u8],
    cursor: usize,
    end: usize,
    types: &'m [FunctionType],
    /// Function index -> type index, spanning imports then local functions,
    /// so a direct `call` can resolve its callee's signature without a
    /// second pass over the module.
    func_types: &'m [u32],
    next_reg: u32,
    val_stack: Vec<u32>,
    blocks: Vec<BlockCtx>,
    code: Vec<Instr>,
    jump_tables: Vec<JumpTable>,
}

/// What a top-level `end` (closing the function body's implicit block)
/// should emit. Regular function bodies return their declared results; a
/// global initializer expression instead stores its single produced value
/// into a global slot.
pub enum BodyTerminal {
    Return { result_count: u32 },
    StoreGlobal { global_index: u32 },
}

impl<'m> Translator<'m> {
    pub fn new(
        bytes: &'m [u8],
        start: usize,
        end: usize,
        types: &'m [FunctionType],
        func_types: &'m [u32],
        next_reg: u32,
    ) -> Self {
        Self {
            bytes,
            cursor: start,
            end,
            types,
            func_types,
            next_reg,
            val_stack: Vec::new(),
            blocks: vec![BlockCtx { kind: BlockKind::FunctionBody, end_fixups: Vec::new(), result_reg: None }],
            code: Vec::new(),
            jump_tables: Vec::new(),
        }
    }

    pub fn next_reg(&self) -> u32 {
        self.next_reg
    }

    /// Translates one function body (or one global initializer expression)
    /// and returns its code, any jump tables it built, the byte position just
    /// past the closing `end` (callers with no separate length prefix, i.e.
    /// global initializers, need it to resume decoding), and the total
    /// register count the machine must reserve for this frame.
    pub fn translate(mut self, terminal: BodyTerminal) -> Result<(Vec<Instr>, Vec<JumpTable>, usize, u32), ParseError> {
        self.run(terminal)?;
        Ok((self.code, self.jump_tables, self.cursor, self.next_reg))
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn emit(&mut self, instr: Instr) -> usize {
        self.code.push(instr);
        self.code.len() - 1
    }

    fn push_fresh(&mut self) -> u32 {
        let reg = self.next_reg;
        self.next_reg += 1;
        self.val_stack.push(reg);
        reg
    }

    fn pop_reg(&mut self) -> Result<u32, ParseError> {
        self.val_stack.pop().ok_or(ParseError::OperandStackUnderflow)
    }

    fn alloc_reg(&mut self) -> u32 {
        let reg = self.next_reg;
        self.next_reg += 1;
        reg
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        let byte = self.bytes.get(self.cursor).copied().ok_or(ParseError::UnexpectedEnd)?;
        self.cursor += 1;
        Ok(byte)
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        Ok(leb::decode_unsigned(self.bytes, &mut self.cursor, self.end)? as u32)
    }

    fn read_i32(&mut self) -> Result<i32, ParseError> {
        Ok(leb::decode_signed(self.bytes, &mut self.cursor, self.end)? as i32)
    }

    fn read_i64(&mut self) -> Result<i64, ParseError> {
        Ok(leb::decode_signed(self.bytes, &mut self.cursor, self.end)?)
    }

    fn read_f32(&mut self) -> Result<f32, ParseError> {
        let bytes: [u8; 4] = self
            .bytes
            .get(self.cursor..self.cursor + 4)
            .ok_or(ParseError::UnexpectedEnd)?
            .try_into()
            .unwrap();
        self.cursor += 4;
        Ok(f32::from_le_bytes(bytes))
    }

    fn read_f64(&mut self) -> Result<f64, ParseError> {
        let bytes: [u8; 8] = self
            .bytes
            .get(self.cursor..self.cursor + 8)
            .ok_or(ParseError::UnexpectedEnd)?
            .try_into()
            .unwrap();
        self.cursor += 8;
        Ok(f64::from_le_bytes(bytes))
    }

    /// Reads a `blocktype`: `0x40` for no result, a single valtype byte for
    /// one result. Function-type-indexed blocktypes (multi-value) are
    /// rejected — they never appear in a pre-multi-value module.
    fn decode_blocktype(&mut self) -> Result<Option<ValueType>, ParseError> {
        match self.read_u8()? {
            0x40 => Ok(None),
            0x7F => Ok(Some(ValueType::I32)),
            0x7E => Ok(Some(ValueType::I64)),
            0x7D => Ok(Some(ValueType::F32)),
            0x7C => Ok(Some(ValueType::F64)),
            0x70 => Ok(Some(ValueType::FuncRef)),
            0x6F => Ok(Some(ValueType::ExternRef)),
            _ => Err(ParseError::UnsupportedFeature("multi-value block types")),
        }
    }

    fn read_memarg(&mut self) -> Result<MemArg, ParseError> {
        Ok(MemArg { align: self.read_u32()?, offset: self.read_u32()? })
    }

    /// Resolves a relative branch label to its `BlockCtx` and records a
    /// forward-jump fixup (block/if) or an immediate target (loop).
    fn branch_target(&mut self, label: u32, cell: usize) -> Result<(), ParseError> {
        let idx = self
            .blocks
            .len()
            .checked_sub(1 + label as usize)
            .ok_or(ParseError::InvalidBranchLabel { label })?;
        match self.blocks[idx].kind {
            BlockKind::Loop { start } => {
                self.code[cell].b = Operand::Target(start as u32);
            }
            _ => {
                self.blocks[idx].end_fixups.push(Fixup::Cell(cell));
            }
        }
        Ok(())
    }

    fn branch_table_target(&mut self, label: u32, table: u32, slot: Option<usize>) -> Result<(), ParseError> {
        let idx = self
            .blocks
            .len()
            .checked_sub(1 + label as usize)
            .ok_or(ParseError::InvalidBranchLabel { label })?;
        match self.blocks[idx].kind {
            BlockKind::Loop { start } => {
                let entry = start as u32;
                match slot {
                    Some(i) => self.jump_tables[table as usize].targets[i] = entry,
                    None => self.jump_tables[table as usize].default = entry,
                }
            }
            _ => self.blocks[idx].end_fixups.push(Fixup::TableEntry { table, slot }),
        }
        Ok(())
    }

    /// Called when a block/loop/if falls off its `end` without branching
    /// out: if the block declared a result, moves the value currently on
    /// top of the operand stack into the block's merge register so code
    /// after the block reads the same register regardless of which path
    /// (fallthrough or an earlier `br` to this label) produced the value.
    fn merge_block_result(&mut self, result_reg: Option<u32>) -> Result<(), ParseError> {
        if let Some(result_reg) = result_reg {
            let src = self.pop_reg()?;
            self.emit(Instr::new(IrOp::Move).with_a(Operand::Reg(result_reg)).with_b(Operand::Reg(src)));
            self.val_stack.push(result_reg);
        }
        Ok(())
    }

    /// The register a `br`/`br_if` to `label` must write its value into
    /// before jumping, or `None` if that label carries no result. A branch
    /// to a `loop` label targets its start, which always has empty params
    /// in the pre-multi-value encoding, so it never merges a value.
    fn branch_result_reg(&self, label: u32) -> Result<Option<u32>, ParseError> {
        let idx = self
            .blocks
            .len()
            .checked_sub(1 + label as usize)
            .ok_or(ParseError::InvalidBranchLabel { label })?;
        match self.blocks[idx].kind {
            BlockKind::Loop { .. } => Ok(None),
            _ => Ok(self.blocks[idx].result_reg),
        }
    }

    fn resolve_fixups(&mut self, fixups: Vec<Fixup>) {
        let here = self.here() as u32;
        for fixup in fixups {
            match fixup {
                Fixup::Cell(idx) => self.code[idx].b = Operand::Target(here),
                Fixup::TableEntry { table, slot } => match slot {
                    Some(i) => self.jump_tables[table as usize].targets[i] = here,
                    None => self.jump_tables[table as usize].default = here,
                },
            }
        }
    }

    /// Marshals a call's arguments (and, for `call_indirect`, its table
    /// index) into a contiguous register run so the callee frame can be
    /// built with one base register, regardless of how scattered the
    /// argument sub-expressions' result registers were.
    fn marshal_call_args(&mut self, arg_count: usize) -> Result<u32, ParseError> {
        let mut args = Vec::with_capacity(arg_count);
        for _ in 0..arg_count {
            args.push(self.pop_reg()?);
        }
        args.reverse();
        let base = self.next_reg;
        self.next_reg += arg_count as u32;
        for (i, reg) in args.into_iter().enumerate() {
            self.emit(Instr::new(IrOp::Move).with_a(Operand::Reg(base + i as u32)).with_b(Operand::Reg(reg)));
        }
        Ok(base)
    }

    fn run(&mut self, terminal: BodyTerminal) -> Result<(), ParseError> {
        loop {
            let opcode_byte = self.read_u8()?;
            let opcode = Opcode::try_from_primitive(opcode_byte)
                .map_err(|_| ParseError::UnknownOpcode(opcode_byte))?;
            match opcode {
                Opcode::Unreachable => {
                    self.emit(Instr::new(IrOp::Unreachable));
                }
                Opcode::Nop => {
                    self.emit(Instr::new(IrOp::Nop));
                }
                Opcode::Block => {
                    let result = self.decode_blocktype()?;
                    let result_reg = result.map(|_| self.alloc_reg());
                    self.blocks.push(BlockCtx { kind: BlockKind::Block, end_fixups: Vec::new(), result_reg });
                }
                Opcode::Loop => {
                    let result = self.decode_blocktype()?;
                    let result_reg = result.map(|_| self.alloc_reg());
                    let start = self.here();
                    self.blocks.push(BlockCtx { kind: BlockKind::Loop { start }, end_fixups: Vec::new(), result_reg });
                }
                Opcode::If => {
                    let result = self.decode_blocktype()?;
                    let result_reg = result.map(|_| self.alloc_reg());
                    let cond = self.pop_reg()?;
                    let cell = self.emit(
                        Instr::new(IrOp::JumpIfZero).with_a(Operand::Reg(cond)).with_b(Operand::Target(u32::MAX)),
                    );
                    let val_stack_entry_len = self.val_stack.len();
                    self.blocks.push(BlockCtx {
                        kind: BlockKind::If { else_seen: false, cond_jump_cell: cell, val_stack_entry_len },
                        end_fixups: Vec::new(),
                        result_reg,
                    });
                }
                Opcode::Else => {
                    let top = self.blocks.last_mut().ok_or(ParseError::UnmatchedElse)?;
                    let (cond_jump_cell, val_stack_entry_len) = match &mut top.kind {
                        BlockKind::If { else_seen, cond_jump_cell, val_stack_entry_len } => {
                            *else_seen = true;
                            (*cond_jump_cell, *val_stack_entry_len)
                        }
                        _ => return Err(ParseError::UnmatchedElse),
                    };
                    let skip_cell =
                        self.emit(Instr::new(IrOp::Jump).with_b(Operand::Target(u32::MAX)));
                    self.blocks.last_mut().unwrap().end_fixups.push(Fixup::Cell(skip_cell));
                    self.code[cond_jump_cell].b = Operand::Target(self.here() as u32);
                    // The then-branch's produced value (if any) never executes
                    // when the else-branch runs; drop it from the compile-time
                    // operand stack so the else-branch starts at the same
                    // height the then-branch did, instead of leaking a stale
                    // register that corrupts later `pop_reg` calls.
                    self.val_stack.truncate(val_stack_entry_len);
                }
                Opcode::End => {
                    let block = self.blocks.pop().ok_or(ParseError::UnmatchedEnd)?;
                    match block.kind {
                        BlockKind::FunctionBody => {
                            match terminal {
                                BodyTerminal::Return { result_count } => {
                                    let mut regs = Vec::with_capacity(result_count as usize);
                                    for _ in 0..result_count {
                                        regs.push(self.pop_reg()?);
                                    }
                                    regs.reverse();
                                    let base = self.marshal_contiguous(&regs);
                                    self.emit(
                                        Instr::new(IrOp::Return)
                                            .with_a(Operand::Reg(base))
                                            .with_c(Operand::Count(result_count)),
                                    );
                                }
                                BodyTerminal::StoreGlobal { global_index } => {
                                    let reg = self.pop_reg()?;
                                    self.emit(
                                        Instr::new(IrOp::GlobalSet)
                                            .with_a(Operand::Reg(reg))
                                            .with_c(Operand::Count(global_index)),
                                    );
                                }
                            }
                            return Ok(());
                        }
                        BlockKind::If { else_seen, cond_jump_cell, .. } => {
                            // An `if` with a result and no `else` is only
                            // well-formed when its result types match its
                            // param types (pass-through); we don't track
                            // block params, so that case's not-taken path
                            // merges whatever register last sat on the
                            // operand stack rather than truly passing
                            // through the pre-if value.
                            if !else_seen {
                                self.code[cond_jump_cell].b = Operand::Target(self.here() as u32);
                            }
                            self.merge_block_result(block.result_reg)?;
                            self.resolve_fixups(block.end_fixups);
                        }
                        BlockKind::Block | BlockKind::Loop { .. } => {
                            self.merge_block_result(block.result_reg)?;
                            self.resolve_fixups(block.end_fixups);
                        }
                    }
                }
                Opcode::Br => {
                    let label = self.read_u32()?;
                    if let Some(result_reg) = self.branch_result_reg(label)? {
                        let src = *self.val_stack.last().ok_or(ParseError::OperandStackUnderflow)?;
                        self.emit(Instr::new(IrOp::Move).with_a(Operand::Reg(result_reg)).with_b(Operand::Reg(src)));
                    }
                    let cell = self.emit(Instr::new(IrOp::Jump).with_b(Operand::Target(u32::MAX)));
                    self.branch_target(label, cell)?;
                }
                Opcode::BrIf => {
                    let label = self.read_u32()?;
                    let cond = self.pop_reg()?;
                    // The branch value, if any, stays on `val_stack` even when
                    // taken: when not taken, execution falls through with it
                    // still there; when taken, it has already been copied into
                    // the label's merge register below.
                    if let Some(result_reg) = self.branch_result_reg(label)? {
                        let src = *self.val_stack.last().ok_or(ParseError::OperandStackUnderflow)?;
                        self.emit(Instr::new(IrOp::Move).with_a(Operand::Reg(result_reg)).with_b(Operand::Reg(src)));
                    }
                    let cell = self.emit(
                        Instr::new(IrOp::JumpIfNonZero).with_a(Operand::Reg(cond)).with_b(Operand::Target(u32::MAX)),
                    );
                    self.branch_target(label, cell)?;
                }
                Opcode::BrTable => {
                    let count = self.read_u32()?;
                    let mut labels = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        labels.push(self.read_u32()?);
                    }
                    let default_label = self.read_u32()?;
                    let index_reg = self.pop_reg()?;
                    let table_idx = self.jump_tables.len() as u32;
                    self.jump_tables.push(JumpTable { targets: vec![u32::MAX; labels.len()], default: u32::MAX });
                    for (i, label) in labels.into_iter().enumerate() {
                        self.branch_table_target(label, table_idx, Some(i))?;
                    }
                    self.branch_table_target(default_label, table_idx, None)?;
                    self.emit(
                        Instr::new(IrOp::JumpTable)
                            .with_a(Operand::Reg(index_reg))
                            .with_b(Operand::Table(table_idx)),
                    );
                }
                Opcode::Return => {
                    // Mirrors the function-level `end` handling but can occur
                    // at any nesting depth.
                    let result_count = match terminal {
                        BodyTerminal::Return { result_count } => result_count,
                        BodyTerminal::StoreGlobal { .. } => 0,
                    };
                    let mut regs = Vec::with_capacity(result_count as usize);
                    for _ in 0..result_count {
                        regs.push(self.pop_reg()?);
                    }
                    regs.reverse();
                    let base = self.marshal_contiguous(&regs);
                    self.emit(
                        Instr::new(IrOp::Return).with_a(Operand::Reg(base)).with_c(Operand::Count(result_count)),
                    );
                }
                Opcode::Call => {
                    let func_index = self.read_u32()?;
                    // Resolved eagerly: the callee's signature is already
                    // known from the function/type sections, decoded before
                    // any code body runs.
                    let type_index = *self
                        .func_types
                        .get(func_index as usize)
                        .ok_or(ParseError::FunctionIndexOutOfBounds { index: func_index })?;
                    let ty = self
                        .types
                        .get(type_index as usize)
                        .ok_or(ParseError::TypeIndexOutOfBounds { index: type_index })?
                        .clone();
                    self.emit_call_with_type(func_index, &ty)?;
                }
                Opcode::CallIndirect => {
                    let type_index = self.read_u32()?;
                    let table_tag = self.read_u8()?;
                    if table_tag != 0 {
                        return Err(ParseError::MalformedModule("call_indirect table index must be 0"));
                    }
                    self.emit_call_indirect(type_index)?;
                }
                Opcode::Drop => {
                    self.pop_reg()?;
                    self.emit(Instr::new(IrOp::Drop));
                }
                Opcode::Select => {
                    let cond = self.pop_reg()?;
                    let b = self.pop_reg()?;
                    let a = self.pop_reg()?;
                    self.emit(
                        Instr::new(IrOp::Select).with_a(Operand::Reg(a)).with_b(Operand::Reg(b)).with_c(Operand::Reg(cond)),
                    );
                    self.val_stack.push(a);
                }
                Opcode::LocalGet => {
                    let index = self.read_u32()?;
                    let dest = self.push_fresh();
                    self.emit(Instr::new(IrOp::LocalGet).with_a(Operand::Reg(dest)).with_b(Operand::Reg(index)));
                }
                Opcode::LocalSet => {
                    let index = self.read_u32()?;
                    let src = self.pop_reg()?;
                    self.emit(Instr::new(IrOp::LocalSet).with_a(Operand::Reg(index)).with_b(Operand::Reg(src)));
                }
                Opcode::LocalTee => {
                    let index = self.read_u32()?;
                    let src = *self.val_stack.last().ok_or(ParseError::OperandStackUnderflow)?;
                    self.emit(Instr::new(IrOp::LocalTee).with_a(Operand::Reg(index)).with_b(Operand::Reg(src)));
                }
                Opcode::GlobalGet => {
                    let index = self.read_u32()?;
                    let dest = self.push_fresh();
                    self.emit(Instr::new(IrOp::GlobalGet).with_a(Operand::Reg(dest)).with_c(Operand::Count(index)));
                }
                Opcode::GlobalSet => {
                    let index = self.read_u32()?;
                    let src = self.pop_reg()?;
                    self.emit(Instr::new(IrOp::GlobalSet).with_a(Operand::Reg(src)).with_c(Operand::Count(index)));
                }
                Opcode::I32Load => self.emit_load(IrOp::I32Load)?,
                Opcode::I64Load => self.emit_load(IrOp::I64Load)?,
                Opcode::F32Load => self.emit_load(IrOp::F32Load)?,
                Opcode::F64Load => self.emit_load(IrOp::F64Load)?,
                Opcode::I32Load8S => self.emit_load(IrOp::I32Load8S)?,
                Opcode::I32Load8U => self.emit_load(IrOp::I32Load8U)?,
                Opcode::I32Load16S => self.emit_load(IrOp::I32Load16S)?,
                Opcode::I32Load16U => self.emit_load(IrOp::I32Load16U)?,
                Opcode::I64Load8S => self.emit_load(IrOp::I64Load8S)?,
                Opcode::I64Load8U => self.emit_load(IrOp::I64Load8U)?,
                Opcode::I64Load16S => self.emit_load(IrOp::I64Load16S)?,
                Opcode::I64Load16U => self.emit_load(IrOp::I64Load16U)?,
                Opcode::I64Load32S => self.emit_load(IrOp::I64Load32S)?,
                Opcode::I64Load32U => self.emit_load(IrOp::I64Load32U)?,
                Opcode::I32Store => self.emit_store(IrOp::I32Store)?,
                Opcode::I64Store => self.emit_store(IrOp::I64Store)?,
                Opcode::F32Store => self.emit_store(IrOp::F32Store)?,
                Opcode::F64Store => self.emit_store(IrOp::F64Store)?,
                Opcode::I32Store8 => self.emit_store(IrOp::I32Store8)?,
                Opcode::I32Store16 => self.emit_store(IrOp::I32Store16)?,
                Opcode::I64Store8 => self.emit_store(IrOp::I64Store8)?,
                Opcode::I64Store16 => self.emit_store(IrOp::I64Store16)?,
                Opcode::I64Store32 => self.emit_store(IrOp::I64Store32)?,
                Opcode::MemorySize => {
                    let tag = self.read_u8()?;
                    if tag != 0 {
                        return Err(ParseError::MalformedModule("memory.size reserved byte must be 0"));
                    }
                    let dest = self.push_fresh();
                    self.emit(Instr::new(IrOp::MemorySize).with_a(Operand::Reg(dest)));
                }
                Opcode::MemoryGrow => {
                    let tag = self.read_u8()?;
                    if tag != 0 {
                        return Err(ParseError::MalformedModule("memory.grow reserved byte must be 0"));
                    }
                    let delta = self.pop_reg()?;
                    let dest = self.push_fresh();
                    self.emit(Instr::new(IrOp::MemoryGrow).with_a(Operand::Reg(delta)).with_b(Operand::Reg(dest)));
                }
                Opcode::I32Const => {
                    let value = self.read_i32()?;
                    let dest = self.push_fresh();
                    self.emit(Instr::new(IrOp::LoadConstI32).with_a(Operand::Reg(dest)).with_b(Operand::ImmI32(value)));
                }
                Opcode::I64Const => {
                    let value = self.read_i64()?;
                    let dest = self.push_fresh();
                    self.emit(Instr::new(IrOp::LoadConstI64).with_a(Operand::Reg(dest)).with_b(Operand::ImmI64(value)));
                }
                Opcode::F32Const => {
                    let value = self.read_f32()?;
                    let dest = self.push_fresh();
                    self.emit(
                        Instr::new(IrOp::LoadConstF32).with_a(Operand::Reg(dest)).with_b(Operand::ImmF32Bits(value.to_bits())),
                    );
                }
                Opcode::F64Const => {
                    let value = self.read_f64()?;
                    let dest = self.push_fresh();
                    self.emit(
                        Instr::new(IrOp::LoadConstF64).with_a(Operand::Reg(dest)).with_b(Operand::ImmF64Bits(value.to_bits())),
                    );
                }
                Opcode::TruncSatPrefix => {
                    let sub = self.read_u32()? as u8;
                    let sub = TruncSatOpcode::try_from_primitive(sub)
                        .map_err(|_| ParseError::UnknownOpcode(sub))?;
                    self.emit_unary(match sub {
                        TruncSatOpcode::I32TruncSatF32S => IrOp::I32TruncSatF32S,
                        TruncSatOpcode::I32TruncSatF32U => IrOp::I32TruncSatF32U,
                        TruncSatOpcode::I32TruncSatF64S => IrOp::I32TruncSatF64S,
                        TruncSatOpcode::I32TruncSatF64U => IrOp::I32TruncSatF64U,
                        TruncSatOpcode::I64TruncSatF32S => IrOp::I64TruncSatF32S,
                        TruncSatOpcode::I64TruncSatF32U => IrOp::I64TruncSatF32U,
                        TruncSatOpcode::I64TruncSatF64S => IrOp::I64TruncSatF64S,
                        TruncSatOpcode::I64TruncSatF64U => IrOp::I64TruncSatF64U,
                    });
                }
                other => self.emit_numeric(other)?,
            }
        }
    }

    /// Copies `regs` into a freshly allocated contiguous run, the same
    /// marshaling `Return` needs so its `a` operand can be a single base
    /// register plus a count.
    fn marshal_contiguous(&mut self, regs: &[u32]) -> u32 {
        if regs.is_empty() {
            return 0;
        }
        let base = self.next_reg;
        self.next_reg += regs.len() as u32;
        for (i, reg) in regs.iter().enumerate() {
            self.emit(Instr::new(IrOp::Move).with_a(Operand::Reg(base + i as u32)).with_b(Operand::Reg(*reg)));
        }
        base
    }

    fn emit_numeric(&mut self, opcode: Opcode) -> Result<(), ParseError> {
        use Opcode::*;
        let op = match opcode {
            I32Eqz => return self.emit_unary(IrOp::I32Eqz),
            I32Eq => IrOp::I32Eq,
            I32Ne => IrOp::I32Ne,
            I32LtS => IrOp::I32LtS,
            I32LtU => IrOp::I32LtU,
            I32GtS => IrOp::I32GtS,
            I32GtU => IrOp::I32GtU,
            I32LeS => IrOp::I32LeS,
            I32LeU => IrOp::I32LeU,
            I32GeS => IrOp::I32GeS,
            I32GeU => IrOp::I32GeU,
            I64Eqz => return self.emit_unary(IrOp::I64Eqz),
            I64Eq => IrOp::I64Eq,
            I64Ne => IrOp::I64Ne,
            I64LtS => IrOp::I64LtS,
            I64LtU => IrOp::I64LtU,
            I64GtS => IrOp::I64GtS,
            I64GtU => IrOp::I64GtU,
            I64LeS => IrOp::I64LeS,
            I64LeU => IrOp::I64LeU,
            I64GeS => IrOp::I64GeS,
            I64GeU => IrOp::I64GeU,
            F32Eq => IrOp::F32Eq,
            F32Ne => IrOp::F32Ne,
            F32Lt => IrOp::F32Lt,
            F32Gt => IrOp::F32Gt,
            F32Le => IrOp::F32Le,
            F32Ge => IrOp::F32Ge,
            F64Eq => IrOp::F64Eq,
            F64Ne => IrOp::F64Ne,
            F64Lt => IrOp::F64Lt,
            F64Gt => IrOp::F64Gt,
            F64Le => IrOp::F64Le,
            F64Ge => IrOp::F64Ge,
            I32Clz => return self.emit_unary(IrOp::I32Clz),
            I32Ctz => return self.emit_unary(IrOp::I32Ctz),
            I32Popcnt => return self.emit_unary(IrOp::I32Popcnt),
            I32Add => IrOp::I32Add,
            I32Sub => IrOp::I32Sub,
            I32Mul => IrOp::I32Mul,
            I32DivS => IrOp::I32DivS,
            I32DivU => IrOp::I32DivU,
            I32RemS => IrOp::I32RemS,
            I32RemU => IrOp::I32RemU,
            I32And => IrOp::I32And,
            I32Or => IrOp::I32Or,
            I32Xor => IrOp::I32Xor,
            I32Shl => IrOp::I32Shl,
            I32ShrS => IrOp::I32ShrS,
            I32ShrU => IrOp::I32ShrU,
            I32Rotl => IrOp::I32Rotl,
            I32Rotr => IrOp::I32Rotr,
            I64Clz => return self.emit_unary(IrOp::I64Clz),
            I64Ctz => return self.emit_unary(IrOp::I64Ctz),
            I64Popcnt => return self.emit_unary(IrOp::I64Popcnt),
            I64Add => IrOp::I64Add,
            I64Sub => IrOp::I64Sub,
            I64Mul => IrOp::I64Mul,
            I64DivS => IrOp::I64DivS,
            I64DivU => IrOp::I64DivU,
            I64RemS => IrOp::I64RemS,
            I64RemU => IrOp::I64RemU,
            I64And => IrOp::I64And,
            I64Or => IrOp::I64Or,
            I64Xor => IrOp::I64Xor,
            I64Shl => IrOp::I64Shl,
            I64ShrS => IrOp::I64ShrS,
            I64ShrU => IrOp::I64ShrU,
            I64Rotl => IrOp::I64Rotl,
            I64Rotr => IrOp::I64Rotr,
            F32Abs => return self.emit_unary(IrOp::F32Abs),
            F32Neg => return self.emit_unary(IrOp::F32Neg),
            F32Ceil => return self.emit_unary(IrOp::F32Ceil),
            F32Floor => return self.emit_unary(IrOp::F32Floor),
            F32Trunc => return self.emit_unary(IrOp::F32Trunc),
            F32Nearest => return self.emit_unary(IrOp::F32Nearest),
            F32Sqrt => return self.emit_unary(IrOp::F32Sqrt),
            F32Add => IrOp::F32Add,
            F32Sub => IrOp::F32Sub,
            F32Mul => IrOp::F32Mul,
            F32Div => IrOp::F32Div,
            F32Min => IrOp::F32Min,
            F32Max => IrOp::F32Max,
            F32Copysign => IrOp::F32Copysign,
            F64Abs => return self.emit_unary(IrOp::F64Abs),
            F64Neg => return self.emit_unary(IrOp::F64Neg),
            F64Ceil => return self.emit_unary(IrOp::F64Ceil),
            F64Floor => return self.emit_unary(IrOp::F64Floor),
            F64Trunc => return self.emit_unary(IrOp::F64Trunc),
            F64Nearest => return self.emit_unary(IrOp::F64Nearest),
            F64Sqrt => return self.emit_unary(IrOp::F64Sqrt),
            F64Add => IrOp::F64Add,
            F64Sub => IrOp::F64Sub,
            F64Mul => IrOp::F64Mul,
            F64Div => IrOp::F64Div,
            F64Min => IrOp::F64Min,
            F64Max => IrOp::F64Max,
            F64Copysign => IrOp::F64Copysign,
            I32WrapI64 => return self.emit_unary(IrOp::I32WrapI64),
            I32TruncF32S => return self.emit_unary(IrOp::I32TruncF32S),
            I32TruncF32U => return self.emit_unary(IrOp::I32TruncF32U),
            I32TruncF64S => return self.emit_unary(IrOp::I32TruncF64S),
            I32TruncF64U => return self.emit_unary(IrOp::I32TruncF64U),
            I64ExtendI32S => return self.emit_unary(IrOp::I64ExtendI32S),
            I64ExtendI32U => return self.emit_unary(IrOp::I64ExtendI32U),
            I64TruncF32S => return self.emit_unary(IrOp::I64TruncF32S),
            I64TruncF32U => return self.emit_unary(IrOp::I64TruncF32U),
            I64TruncF64S => return self.emit_unary(IrOp::I64TruncF64S),
            I64TruncF64U => return self.emit_unary(IrOp::I64TruncF64U),
            F32ConvertI32S => return self.emit_unary(IrOp::F32ConvertI32S),
            F32ConvertI32U => return self.emit_unary(IrOp::F32ConvertI32U),
            F32ConvertI64S => return self.emit_unary(IrOp::F32ConvertI64S),
            F32ConvertI64U => return self.emit_unary(IrOp::F32ConvertI64U),
            F32DemoteF64 => return self.emit_unary(IrOp::F32DemoteF64),
            F64ConvertI32S => return self.emit_unary(IrOp::F64ConvertI32S),
            F64ConvertI32U => return self.emit_unary(IrOp::F64ConvertI32U),
            F64ConvertI64S => return self.emit_unary(IrOp::F64ConvertI64S),
            F64ConvertI64U => return self.emit_unary(IrOp::F64ConvertI64U),
            F64PromoteF32 => return self.emit_unary(IrOp::F64PromoteF32),
            I32ReinterpretF32 => return self.emit_unary(IrOp::I32ReinterpretF32),
            I64ReinterpretF64 => return self.emit_unary(IrOp::I64ReinterpretF64),
            F32ReinterpretI32 => return self.emit_unary(IrOp::F32ReinterpretI32),
            F64ReinterpretI64 => return self.emit_unary(IrOp::F64ReinterpretI64),
            I32Extend8S => return self.emit_unary(IrOp::I32Extend8S),
            I32Extend16S => return self.emit_unary(IrOp::I32Extend16S),
            I64Extend8S => return self.emit_unary(IrOp::I64Extend8S),
            I64Extend16S => return self.emit_unary(IrOp::I64Extend16S),
            I64Extend32S => return self.emit_unary(IrOp::I64Extend32S),
            other => return Err(ParseError::UnknownOpcode(other as u8)),
        };
        self.emit_binary(op)
    }

    fn emit_unary(&mut self, op: IrOp) -> Result<(), ParseError> {
        let src = self.pop_reg()?;
        let dest = self.push_fresh();
        self.emit(Instr::new(op).with_a(Operand::Reg(dest)).with_b(Operand::Reg(src)));
        Ok(())
    }

    fn emit_binary(&mut self, op: IrOp) -> Result<(), ParseError> {
        let rhs = self.pop_reg()?;
        let lhs = self.pop_reg()?;
        let dest = self.push_fresh();
        self.emit(Instr::new(op).with_a(Operand::Reg(dest)).with_b(Operand::Reg(lhs)).with_c(Operand::Reg(rhs)));
        Ok(())
    }

    fn emit_load(&mut self, op: IrOp) -> Result<(), ParseError> {
        let memarg = self.read_memarg()?;
        let addr = self.pop_reg()?;
        let dest = self.push_fresh();
        self.emit(Instr::new(op).with_a(Operand::Reg(addr)).with_b(Operand::Reg(dest)).with_c(Operand::Count(memarg.offset)));
        Ok(())
    }

    fn emit_store(&mut self, op: IrOp) -> Result<(), ParseError> {
        let memarg = self.read_memarg()?;
        let value = self.pop_reg()?;
        let addr = self.pop_reg()?;
        self.emit(
            Instr::new(op).with_a(Operand::Reg(addr)).with_b(Operand::Reg(value)).with_c(Operand::Count(memarg.offset)),
        );
        Ok(())
    }

    fn emit_call_indirect(&mut self, type_index: u32) -> Result<(), ParseError> {
        let ty = self.types.get(type_index as usize).ok_or(ParseError::TypeIndexOutOfBounds { index: type_index })?;
        let arg_count = ty.arg_count();
        let result_count = ty.result_count() as u32;
        let index_reg = self.pop_reg()?;
        let base = self.marshal_call_args(arg_count)?;
        let index_slot = self.next_reg;
        self.next_reg += 1;
        self.emit(Instr::new(IrOp::Move).with_a(Operand::Reg(index_slot)).with_b(Operand::Reg(index_reg)));
        self.emit(
            Instr::new(IrOp::DynamicCall)
                .with_a(Operand::Reg(base))
                .with_b(Operand::Type(type_index))
                .with_c(Operand::Count(result_count)),
        );
        self.next_reg = self.next_reg.max(base + result_count);
        for i in 0..result_count {
            self.val_stack.push(base + i);
        }
        Ok(())
    }

    pub fn emit_call_with_type(&mut self, func_index: u32, ty: &FunctionType) -> Result<(), ParseError> {
        let arg_count = ty.arg_count();
        let result_count = ty.result_count() as u32;
        let base = self.marshal_call_args(arg_count)?;
        self.emit(
            Instr::new(IrOp::StaticCall)
                .with_a(Operand::Reg(base))
                .with_b(Operand::Func(func_index))
                .with_c(Operand::Count(result_count)),
        );
        self.next_reg = self.next_reg.max(base + result_count);
        for i in 0..result_count {
            self.val_stack.push(base + i);
        }
        Ok(())
    }
}
