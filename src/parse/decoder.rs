//! Top-level module decoder: validates the magic header, walks the section
//! table, and drives `translate::Translator` over each function body and
//! global initializer.

use tracing::{debug, trace};

use crate::host::Host;
use crate::leb;
use crate::parse::code::{Instr, JumpTable, Operand};
use crate::parse::error::ParseError;
use crate::parse::module::{Callable, DataSegment, Function, Module};
use crate::parse::translate::{BodyTerminal, Translator};
use crate::parse::types::{ExportKind, FunctionType, GlobalType, Import, ImportDesc, LimitKind, MemoryType, SectionId, TableType, ValueType};

const MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
const VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// A function type's params and results together may not exceed this many
/// slots — a sanity bound the binary format itself doesn't impose, kept here
/// to reject degenerate/adversarial inputs rather than allocate unbounded
/// vectors from a malformed length prefix.
const MAX_SIGNATURE_SLOTS: u32 = 16;

pub struct Decoder<'a> {
    bytes: &'a [u8],
    cursor: usize,
    module: Module,
    table_type: Option<TableType>,
}

impl<'a> Decoder<'a> {
    pub fn decode(bytes: &'a [u8], host: &Host) -> Result<Module, ParseError> {
        let mut decoder = Decoder { bytes, cursor: 0, module: Module::default(), table_type: None };
        decoder.run(host)?;
        Ok(decoder.module)
    }

    fn read_u8(&mut self) -> Result<u8, ParseError> {
        let byte = self.bytes.get(self.cursor).copied().ok_or(ParseError::UnexpectedEnd)?;
        self.cursor += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let slice = self.bytes.get(self.cursor..self.cursor + len).ok_or(ParseError::UnexpectedEnd)?;
        self.cursor += len;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, ParseError> {
        Ok(leb::decode_unsigned(self.bytes, &mut self.cursor, self.bytes.len())? as u32)
    }

    fn read_i32(&mut self) -> Result<i32, ParseError> {
        Ok(leb::decode_signed(self.bytes, &mut self.cursor, self.bytes.len())? as i32)
    }

    fn read_name(&mut self) -> Result<String, ParseError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    fn read_value_type(&mut self) -> Result<ValueType, ParseError> {
        let byte = self.read_u8()?;
        ValueType::try_from_primitive(byte).map_err(|_| ParseError::MalformedModule("invalid value type"))
    }

    fn read_limits(&mut self) -> Result<(u32, Option<u32>), ParseError> {
        let kind = LimitKind::try_from_primitive(self.read_u8()?)
            .map_err(|_| ParseError::MalformedModule("invalid limit kind"))?;
        let min = self.read_u32()?;
        let max = match kind {
            LimitKind::Min => None,
            LimitKind::MinMax => Some(self.read_u32()?),
        };
        Ok((min, max))
    }

    fn run(&mut self, host: &Host) -> Result<(), ParseError> {
        if self.read_bytes(4)? != MAGIC {
            return Err(ParseError::BadHeader);
        }
        if self.read_bytes(4)? != VERSION {
            return Err(ParseError::BadHeader);
        }

        let mut global_init_code: Vec<Instr> = Vec::new();
        let mut global_init_tables: Vec<JumpTable> = Vec::new();

        while self.cursor < self.bytes.len() {
            let section_id_byte = self.read_u8()?;
            let section_id = crate::parse::types::SectionId::try_from_primitive(section_id_byte)
                .map_err(|_| ParseError::MalformedModule("unknown section id"))?;
            let size = self.read_u32()? as usize;
            let section_end = self.cursor + size;
            trace!(section = ?section_id, size, "decoding section");
            match section_id {
                SectionId::Custom => {
                    self.cursor = section_end;
                }
                SectionId::Type => self.decode_type_section()?,
                SectionId::Import => self.decode_import_section()?,
                SectionId::Function => self.decode_function_section()?,
                SectionId::Table => self.decode_table_section()?,
                SectionId::Memory => self.decode_memory_section()?,
                SectionId::Global => self.decode_global_section(&mut global_init_code, &mut global_init_tables)?,
                SectionId::Export => self.decode_export_section()?,
                SectionId::Start => {
                    // Read and discard: the entrypoint is resolved by export
                    // name ("_start"), not by this section.
                    self.read_u32()?;
                }
                SectionId::Element => self.decode_element_section()?,
                SectionId::Code => self.decode_code_section()?,
                SectionId::Data => self.decode_data_section()?,
            }
            if self.cursor != section_end {
                return Err(ParseError::SectionLengthMismatch { section: section_id_byte });
            }
        }

        self.module.global_init = Function {
            type_index: u32::MAX,
            code: global_init_code,
            jump_tables: global_init_tables,
            export_name: None,
            local_count: 0,
            register_count: self.module.global_init_registers,
        };

        for callable in &self.module.functions {
            if let Callable::Wasm(f) = callable {
                host.alloc.record_alloc((f.code.len() * std::mem::size_of::<Instr>()) as u64);
            }
        }

        debug!(
            functions = self.module.functions.len(),
            types = self.module.types.len(),
            "module decoded"
        );
        Ok(())
    }

    fn decode_type_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        self.module.types.reserve(count as usize);
        for _ in 0..count {
            let tag = self.read_u8()?;
            if tag != 0x60 {
                return Err(ParseError::MalformedModule("function type must start with 0x60"));
            }
            let param_count = self.read_u32()?;
            let mut params = Vec::with_capacity(param_count as usize);
            for _ in 0..param_count {
                params.push(self.read_value_type()?);
            }
            let result_count = self.read_u32()?;
            let mut results = Vec::with_capacity(result_count as usize);
            for _ in 0..result_count {
                results.push(self.read_value_type()?);
            }
            let total = param_count + result_count;
            if total > MAX_SIGNATURE_SLOTS {
                return Err(ParseError::TooManySignatureSlots { max: MAX_SIGNATURE_SLOTS, found: total });
            }
            self.module.types.push(FunctionType { params, results });
        }
        Ok(())
    }

    fn decode_import_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        for _ in 0..count {
            let module = self.read_name()?;
            let field = self.read_name()?;
            let kind = ExportKind::try_from_primitive(self.read_u8()?)
                .map_err(|_| ParseError::MalformedModule("invalid import kind"))?;
            let desc = match kind {
                ExportKind::Function => ImportDesc::Function { type_index: self.read_u32()? },
                ExportKind::Table => {
                    let elem_kind = self.read_u8()?;
                    if elem_kind != 0x70 {
                        return Err(ParseError::UnsupportedFeature("only funcref tables are supported"));
                    }
                    let (min, max) = self.read_limits()?;
                    ImportDesc::Table(TableType { min, max })
                }
                ExportKind::Memory => {
                    let (min, max) = self.read_limits()?;
                    ImportDesc::Memory(MemoryType { min, max })
                }
                ExportKind::Global => {
                    let value_type = self.read_value_type()?;
                    let mutable = self.read_u8()? != 0;
                    ImportDesc::Global { value_type, mutable }
                }
            };
            match &desc {
                ImportDesc::Function { type_index } => {
                    self.module.functions.push(Callable::Import { module: module.clone(), field: field.clone(), type_index: *type_index });
                }
                ImportDesc::Memory(memory_type) => {
                    self.module.memory = Some(*memory_type);
                }
                ImportDesc::Table(table_type) => {
                    self.table_type = Some(*table_type);
                }
                ImportDesc::Global { value_type, mutable } => {
                    self.module.global_types.push(GlobalType { value_type: *value_type, mutable: *mutable });
                }
            }
            let _ = Import { module, field, desc };
        }
        Ok(())
    }

    fn decode_function_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        for _ in 0..count {
            let type_index = self.read_u32()?;
            self.module.functions.push(Callable::Wasm(Function { type_index, ..Function::default() }));
        }
        Ok(())
    }

    fn decode_table_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        if count == 0 {
            return Ok(());
        }
        if count > 1 {
            return Err(ParseError::UnsupportedFeature("only a single table is supported"));
        }
        let elem_kind = self.read_u8()?;
        if elem_kind != 0x70 {
            return Err(ParseError::UnsupportedFeature("only funcref tables are supported"));
        }
        let (min, max) = self.read_limits()?;
        self.table_type = Some(TableType { min, max });
        Ok(())
    }

    fn decode_memory_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        if count == 0 {
            return Ok(());
        }
        if count > 1 {
            return Err(ParseError::UnsupportedFeature("only a single memory is supported"));
        }
        let (min, max) = self.read_limits()?;
        self.module.memory = Some(MemoryType { min, max });
        Ok(())
    }

    fn decode_global_section(
        &mut self,
        acc_code: &mut Vec<Instr>,
        acc_tables: &mut Vec<JumpTable>,
    ) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        for _ in 0..count {
            let value_type = self.read_value_type()?;
            let mutable = self.read_u8()? != 0;
            let global_index = self.module.global_types.len() as u32;
            self.module.global_types.push(GlobalType { value_type, mutable });

            let func_types: Vec<u32> = Vec::new();
            let translator = Translator::new(self.bytes, self.cursor, self.bytes.len(), &self.module.types, &func_types, 0);
            let (code, tables, cursor, register_count) = translator.translate(BodyTerminal::StoreGlobal { global_index })?;
            self.cursor = cursor;
            self.module.global_init_registers = self.module.global_init_registers.max(register_count);
            append_rebased(acc_code, acc_tables, code, tables);
        }
        Ok(())
    }

    fn decode_export_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        for _ in 0..count {
            let name = self.read_name()?;
            let kind = ExportKind::try_from_primitive(self.read_u8()?)
                .map_err(|_| ParseError::MalformedModule("invalid export kind"))?;
            let index = self.read_u32()?;
            if kind == ExportKind::Function {
                match self.module.functions.get_mut(index as usize) {
                    Some(Callable::Wasm(f)) => f.export_name = Some(name),
                    Some(Callable::Import { .. }) => {
                        return Err(ParseError::UnsupportedFeature("re-exporting an imported function"));
                    }
                    None => return Err(ParseError::FunctionIndexOutOfBounds { index }),
                }
            }
        }
        Ok(())
    }

    fn decode_element_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        let table_min = self.table_type.map(|t| t.min).unwrap_or(0);
        self.module.table.resize(table_min as usize, None);
        for _ in 0..count {
            let tag = self.read_u32()?;
            if tag != 0 {
                return Err(ParseError::UnsupportedFeature("only active element segments for table 0 are supported"));
            }
            let offset = self.decode_const_i32_expr()? as u32;
            let func_count = self.read_u32()?;
            let needed = offset as usize + func_count as usize;
            if needed > self.module.table.len() {
                self.module.table.resize(needed, None);
            }
            for i in 0..func_count {
                let func_index = self.read_u32()?;
                self.module.table[offset as usize + i as usize] = Some(func_index);
            }
        }
        Ok(())
    }

    /// Decodes the restricted constant-expression form real toolchains emit
    /// for element/data offsets: a single `i32.const` immediate followed by
    /// `end`. Global-initialized offsets (`global.get`) are not supported.
    fn decode_const_i32_expr(&mut self) -> Result<i32, ParseError> {
        let opcode = self.read_u8()?;
        if opcode != 0x41 {
            return Err(ParseError::UnsupportedFeature("offset expressions must be a plain i32.const"));
        }
        let value = self.read_i32()?;
        let end = self.read_u8()?;
        if end != 0x0B {
            return Err(ParseError::MalformedModule("offset expression missing end"));
        }
        Ok(value)
    }

    fn decode_code_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        let func_types: Vec<u32> = self.module.functions.iter().map(|c| c.type_index()).collect();
        let import_count = self.module.functions.iter().filter(|c| matches!(c, Callable::Import { .. })).count();
        for i in 0..count as usize {
            let body_size = self.read_u32()? as usize;
            let body_start = self.cursor;
            let body_end = body_start + body_size;
            let wasm_index = import_count + i;

            let arg_count = self
                .module
                .types
                .get(func_types[wasm_index] as usize)
                .ok_or(ParseError::TypeIndexOutOfBounds { index: func_types[wasm_index] })?
                .arg_count() as u32;
            let result_count = self.module.types[func_types[wasm_index] as usize].result_count() as u32;

            let local_group_count = self.read_u32()?;
            let mut local_count = 0u32;
            for _ in 0..local_group_count {
                let n = self.read_u32()?;
                let _value_type = self.read_value_type()?;
                local_count += n;
            }

            let translator = Translator::new(
                self.bytes,
                self.cursor,
                body_end,
                &self.module.types,
                &func_types,
                arg_count + local_count,
            );
            let (code, jump_tables, _cursor, register_count) = translator.translate(BodyTerminal::Return { result_count })?;

            match &mut self.module.functions[wasm_index] {
                Callable::Wasm(f) => {
                    f.code = code;
                    f.jump_tables = jump_tables;
                    f.local_count = local_count;
                    f.register_count = register_count;
                }
                Callable::Import { .. } => {
                    return Err(ParseError::MalformedModule("code section entry for an imported function"));
                }
            }
            self.cursor = body_end;
        }
        Ok(())
    }

    fn decode_data_section(&mut self) -> Result<(), ParseError> {
        let count = self.read_u32()?;
        for _ in 0..count {
            let tag = self.read_u32()?;
            if tag != 0 {
                return Err(ParseError::UnsupportedFeature("only active data segments for memory 0 are supported"));
            }
            let offset = self.decode_const_i32_expr()? as u32;
            let len = self.read_u32()? as usize;
            let bytes = self.read_bytes(len)?.to_vec();
            self.module.data_segments.push(DataSegment { offset, bytes });
        }
        Ok(())
    }
}

use num_enum::TryFromPrimitive;

fn append_rebased(acc_code: &mut Vec<Instr>, acc_tables: &mut Vec<JumpTable>, code: Vec<Instr>, tables: Vec<JumpTable>) {
    let code_offset = acc_code.len() as u32;
    let table_offset = acc_tables.len() as u32;
    for mut instr in code {
        rebase_operand(&mut instr.b, code_offset, table_offset, &instr.op);
        acc_code.push(instr);
    }
    for mut table in tables {
        for target in &mut table.targets {
            if *target != u32::MAX {
                *target += code_offset;
            }
        }
        if table.default != u32::MAX {
            table.default += code_offset;
        }
        acc_tables.push(table);
    }
}

fn rebase_operand(operand: &mut Operand, code_offset: u32, table_offset: u32, op: &crate::parse::code::IrOp) {
    use crate::parse::code::IrOp;
    match (op, operand) {
        (IrOp::Jump | IrOp::JumpIfZero | IrOp::JumpIfNonZero, Operand::Target(t)) => *t += code_offset,
        (IrOp::JumpTable, Operand::Table(t)) => *t += table_offset,
        _ => {}
    }
}
