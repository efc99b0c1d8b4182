//! Host context: allocation accounting and registered host functions.
//! Bundled into one value passed into `eval_module` instead of living behind
//! process-global statics, so multiple modules can be instantiated
//! independently in the same process.

use std::cell::Cell as StdCell;
use std::collections::HashMap;

use tracing::{debug, warn};

use crate::vm::{ExecutionError, Memory};

/// Process-wide-in-spirit, but instance-owned, allocation bookkeeping.
///
/// Rust's `Vec`/`Box` already manage the underlying memory safely; this
/// exists to make the "allocated == freed at teardown" property testable for
/// the handful of allocations the runtime tracks explicitly — a module's
/// sealed function code arrays.
#[derive(Debug, Default)]
pub struct AllocStats {
    allocated: StdCell<u64>,
    freed: StdCell<u64>,
}

impl AllocStats {
    pub fn record_alloc(&self, bytes: u64) {
        self.allocated.set(self.allocated.get() + bytes);
    }

    pub fn record_free(&self, bytes: u64) {
        self.freed.set(self.freed.get() + bytes);
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.get()
    }

    pub fn freed(&self) -> u64 {
        self.freed.get()
    }

    /// Asserts that, at teardown, every tracked allocation has a matching
    /// free.
    pub fn assert_balanced(&self) {
        assert_eq!(
            self.allocated.get(),
            self.freed.get(),
            "allocation accounting out of balance: {} allocated, {} freed",
            self.allocated.get(),
            self.freed.get()
        );
    }
}

/// A host (WASI-flavored) function. Receives the module's first memory (if
/// any) and the raw argument cells already copied into the call's argument
/// window; returns the values to place in the call's result window.
pub type HostFn = fn(&mut Option<Memory>, &[u64]) -> Result<Vec<u64>, ExecutionError>;

/// Bundles allocation accounting and the table of importable host functions.
pub struct Host {
    pub alloc: AllocStats,
    functions: HashMap<(String, String), HostFn>,
}

impl Default for Host {
    fn default() -> Self {
        let mut functions: HashMap<(String, String), HostFn> = HashMap::new();
        functions.insert(("env".to_string(), "print".to_string()), wasi_print as HostFn);
        functions.insert(
            ("wasi_snapshot_preview1".to_string(), "fd_write".to_string()),
            wasi_fd_write as HostFn,
        );
        Self {
            alloc: AllocStats::default(),
            functions,
        }
    }
}

impl Host {
    pub fn lookup(&self, module: &str, field: &str) -> Option<HostFn> {
        self.functions.get(&(module.to_string(), field.to_string())).copied()
    }

    pub fn register(&mut self, module: impl Into<String>, field: impl Into<String>, f: HostFn) {
        self.functions.insert((module.into(), field.into()), f);
    }
}

/// `env.print(addr: i32, len: i32)`: writes the given memory range to
/// stdout.
fn wasi_print(memory: &mut Option<Memory>, args: &[u64]) -> Result<Vec<u64>, ExecutionError> {
    let addr = args.first().copied().unwrap_or(0) as usize;
    let len = args.get(1).copied().unwrap_or(0) as usize;
    let mem = memory.as_ref().ok_or(ExecutionError::NoMemory)?;
    let data = mem.slice(addr..addr + len)?;
    debug!(bytes = len, "env.print");
    use std::io::Write;
    std::io::stdout().write_all(data).ok();
    Ok(vec![])
}

/// `wasi_snapshot_preview1.fd_write(fd, iovec_ptr, iovec_len, result_ptr) -> errno`,
/// simplified to a single buffer (no vectored I/O) — enough to make `_start`
/// be able to write output without pulling in a complete WASI surface.
fn wasi_fd_write(memory: &mut Option<Memory>, args: &[u64]) -> Result<Vec<u64>, ExecutionError> {
    let _fd = args.first().copied().unwrap_or(0);
    let iovec_ptr = args.get(1).copied().unwrap_or(0) as usize;
    let iovec_len = args.get(2).copied().unwrap_or(0) as usize;
    let result_ptr = args.get(3).copied().unwrap_or(0) as usize;
    let mem = memory.as_mut().ok_or(ExecutionError::NoMemory)?;

    let mut total_written = 0u32;
    let mut cursor = iovec_ptr;
    for _ in 0..iovec_len {
        let buf_addr = u32::from_le_bytes(mem.slice(cursor..cursor + 4)?.try_into().unwrap()) as usize;
        let buf_len = u32::from_le_bytes(mem.slice(cursor + 4..cursor + 8)?.try_into().unwrap()) as usize;
        cursor += 8;
        let data = mem.slice(buf_addr..buf_addr + buf_len)?;
        use std::io::Write;
        if std::io::stdout().write_all(data).is_ok() {
            total_written += buf_len as u32;
        }
    }
    mem.slice_mut(result_ptr..result_ptr + 4)?
        .copy_from_slice(&total_written.to_le_bytes());
    warn!(total_written, "wasi_snapshot_preview1.fd_write stub invoked");
    Ok(vec![0])
}
