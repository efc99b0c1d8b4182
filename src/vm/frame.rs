//! Call-frame linkage: a small side stack of return addresses, kept separate
//! from the register file itself (`Machine::stack`). Registers are addressed
//! as offsets from a frame's `base` into that one shared `Vec<Cell>`, so a
//! callee's argument registers can alias the caller's without a copy — only
//! `base` changes between frames, not the backing storage.

/// One activation record. `callee_base` is the absolute stack offset the
/// popped frame's register 0 sat at; since `callee_base == caller_base +
/// result_base`, a `Return` only needs to shift its result registers down to
/// `callee_base` (register 0 of the frame being torn down) for them to land
/// exactly where the caller expects its call's results.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub return_func: usize,
    pub return_pc: usize,
    pub caller_base: usize,
    pub callee_base: usize,
    pub result_count: u32,
}
