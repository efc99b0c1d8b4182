//! Hand-assembles minimal `.wasm` byte images for the end-to-end scenarios
//! in `tests/end_to_end.rs`, without any filesystem fixtures or a WAT
//! assembler dependency — exactly the "minimal .wasm byte arrays" the spec's
//! testable-properties section calls for.

use rwasm::leb;

pub const I32: u8 = 0x7F;
pub const I64: u8 = 0x7E;
pub const F32: u8 = 0x7D;
pub const F64: u8 = 0x7C;
pub const FUNCREF: u8 = 0x70;

#[derive(Default)]
pub struct ModuleBuilder {
    types: Vec<(Vec<u8>, Vec<u8>)>,
    functions: Vec<u32>,
    memory: Option<(u32, Option<u32>)>,
    table: Option<(u32, Option<u32>)>,
    elements: Vec<(u32, Vec<u32>)>,
    exports: Vec<(String, u32)>,
    codes: Vec<Vec<u8>>,
    globals: Vec<(u8, bool, Vec<u8>)>,
    data: Vec<(u32, Vec<u8>)>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, params: &[u8], results: &[u8]) -> u32 {
        self.types.push((params.to_vec(), results.to_vec()));
        (self.types.len() - 1) as u32
    }

    /// `locals` names one value type per extra local (beyond the function's
    /// arguments); `body` is the instruction stream with no trailing `end` —
    /// this appends the function-closing `0x0B` itself.
    pub fn add_function(&mut self, type_index: u32, locals: &[u8], body: &[u8]) -> u32 {
        self.functions.push(type_index);
        let mut code = Vec::new();
        code.extend(leb::encode_unsigned(locals.len() as u64));
        for &ty in locals {
            code.extend(leb::encode_unsigned(1));
            code.push(ty);
        }
        code.extend_from_slice(body);
        code.push(0x0B);
        self.codes.push(code);
        (self.functions.len() - 1) as u32
    }

    pub fn set_memory(&mut self, min: u32, max: Option<u32>) -> &mut Self {
        self.memory = Some((min, max));
        self
    }

    pub fn set_table(&mut self, min: u32, max: Option<u32>) -> &mut Self {
        self.table = Some((min, max));
        self
    }

    pub fn add_element(&mut self, offset: u32, func_indices: &[u32]) -> &mut Self {
        self.elements.push((offset, func_indices.to_vec()));
        self
    }

    pub fn add_global(&mut self, value_type: u8, mutable: bool, init: &[u8]) -> u32 {
        self.globals.push((value_type, mutable, init.to_vec()));
        (self.globals.len() - 1) as u32
    }

    pub fn add_data(&mut self, offset: u32, bytes: &[u8]) -> &mut Self {
        self.data.push((offset, bytes.to_vec()));
        self
    }

    pub fn export_func(&mut self, name: &str, func_index: u32) -> &mut Self {
        self.exports.push((name.to_string(), func_index));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut out = vec![0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

        if !self.types.is_empty() {
            let mut body = leb::encode_unsigned(self.types.len() as u64);
            for (params, results) in &self.types {
                body.push(0x60);
                body.extend(leb::encode_unsigned(params.len() as u64));
                body.extend_from_slice(params);
                body.extend(leb::encode_unsigned(results.len() as u64));
                body.extend_from_slice(results);
            }
            push_section(&mut out, 1, body);
        }

        if !self.functions.is_empty() {
            let mut body = leb::encode_unsigned(self.functions.len() as u64);
            for &t in &self.functions {
                body.extend(leb::encode_unsigned(t as u64));
            }
            push_section(&mut out, 3, body);
        }

        if let Some((min, max)) = self.table {
            let mut body = leb::encode_unsigned(1);
            body.push(FUNCREF);
            body.extend(limits(min, max));
            push_section(&mut out, 4, body);
        }

        if let Some((min, max)) = self.memory {
            let mut body = leb::encode_unsigned(1);
            body.extend(limits(min, max));
            push_section(&mut out, 5, body);
        }

        if !self.globals.is_empty() {
            let mut body = leb::encode_unsigned(self.globals.len() as u64);
            for (ty, mutable, init) in &self.globals {
                body.push(*ty);
                body.push(u8::from(*mutable));
                body.extend_from_slice(init);
                body.push(0x0B);
            }
            push_section(&mut out, 6, body);
        }

        if !self.exports.is_empty() {
            let mut body = leb::encode_unsigned(self.exports.len() as u64);
            for (name, idx) in &self.exports {
                body.extend(leb::encode_unsigned(name.len() as u64));
                body.extend_from_slice(name.as_bytes());
                body.push(0x00);
                body.extend(leb::encode_unsigned(*idx as u64));
            }
            push_section(&mut out, 7, body);
        }

        if !self.elements.is_empty() {
            let mut body = leb::encode_unsigned(self.elements.len() as u64);
            for (offset, funcs) in &self.elements {
                body.extend(leb::encode_unsigned(0)); // active segment, table 0
                body.push(0x41); // i32.const
                body.extend(leb::encode_signed(*offset as i64));
                body.push(0x0B);
                body.extend(leb::encode_unsigned(funcs.len() as u64));
                for f in funcs {
                    body.extend(leb::encode_unsigned(*f as u64));
                }
            }
            push_section(&mut out, 9, body);
        }

        if !self.codes.is_empty() {
            let mut body = leb::encode_unsigned(self.codes.len() as u64);
            for code in &self.codes {
                body.extend(leb::encode_unsigned(code.len() as u64));
                body.extend_from_slice(code);
            }
            push_section(&mut out, 10, body);
        }

        if !self.data.is_empty() {
            let mut body = leb::encode_unsigned(self.data.len() as u64);
            for (offset, bytes) in &self.data {
                body.extend(leb::encode_unsigned(0)); // active segment, memory 0
                body.push(0x41); // i32.const
                body.extend(leb::encode_signed(*offset as i64));
                body.push(0x0B);
                body.extend(leb::encode_unsigned(bytes.len() as u64));
                body.extend_from_slice(bytes);
            }
            push_section(&mut out, 11, body);
        }

        out
    }
}

fn limits(min: u32, max: Option<u32>) -> Vec<u8> {
    let mut out = Vec::new();
    match max {
        None => {
            out.push(0x00);
            out.extend(leb::encode_unsigned(min as u64));
        }
        Some(max) => {
            out.push(0x01);
            out.extend(leb::encode_unsigned(min as u64));
            out.extend(leb::encode_unsigned(max as u64));
        }
    }
    out
}

fn push_section(out: &mut Vec<u8>, id: u8, body: Vec<u8>) {
    out.push(id);
    out.extend(leb::encode_unsigned(body.len() as u64));
    out.extend(body);
}

// --- instruction builders --------------------------------------------------

pub fn i32_const(n: i32) -> Vec<u8> {
    let mut v = vec![0x41];
    v.extend(leb::encode_signed(n as i64));
    v
}

pub fn i64_const(n: i64) -> Vec<u8> {
    let mut v = vec![0x42];
    v.extend(leb::encode_signed(n));
    v
}

pub fn f32_const(n: f32) -> Vec<u8> {
    let mut v = vec![0x43];
    v.extend_from_slice(&n.to_le_bytes());
    v
}

pub fn f64_const(n: f64) -> Vec<u8> {
    let mut v = vec![0x44];
    v.extend_from_slice(&n.to_le_bytes());
    v
}

fn with_index(op: u8, i: u32) -> Vec<u8> {
    let mut v = vec![op];
    v.extend(leb::encode_unsigned(i as u64));
    v
}

pub fn local_get(i: u32) -> Vec<u8> {
    with_index(0x20, i)
}
pub fn local_set(i: u32) -> Vec<u8> {
    with_index(0x21, i)
}
pub fn call(i: u32) -> Vec<u8> {
    with_index(0x10, i)
}

pub fn call_indirect(type_index: u32) -> Vec<u8> {
    let mut v = vec![0x11];
    v.extend(leb::encode_unsigned(type_index as u64));
    v.push(0x00);
    v
}

pub fn mem_op(op: u8, align: u32, offset: u32) -> Vec<u8> {
    let mut v = vec![op];
    v.extend(leb::encode_unsigned(align as u64));
    v.extend(leb::encode_unsigned(offset as u64));
    v
}

pub const I32_EQZ: u8 = 0x45;
pub const I32_LT_S: u8 = 0x48;
pub const I32_LT_U: u8 = 0x49;
pub const I32_LE_S: u8 = 0x4C;
pub const I32_ADD: u8 = 0x6A;
pub const I32_SUB: u8 = 0x6B;
pub const I32_MUL: u8 = 0x6C;
pub const I32_REINTERPRET_F32: u8 = 0xBC;
pub const I32_LOAD: u8 = 0x28;
pub const I32_STORE: u8 = 0x36;
pub const MEMORY_GROW: u8 = 0x40;
pub const MEMORY_SIZE: u8 = 0x3F;
pub const IF_I32: [u8; 2] = [0x04, I32];
pub const ELSE: u8 = 0x05;
pub const END: u8 = 0x0B;

pub fn memory_grow() -> Vec<u8> {
    vec![MEMORY_GROW, 0x00]
}

pub fn memory_size() -> Vec<u8> {
    vec![MEMORY_SIZE, 0x00]
}
