//! Command-line harness: `rwasm <module.wasm> [--threaded] [-v]`.
//!
//! Loads a module, installs the host functions, runs `_start` under the
//! selected dispatcher, and prints its result values. Plays the role the
//! teacher's hardcoded `locals.wasm` loader played, parameterized over argv
//! instead.

use std::process::ExitCode;

use rwasm::vm::DispatchMode;
use rwasm::{Host, VmConfig};
use tracing_subscriber::prelude::*;

struct Args {
    path: String,
    threaded: bool,
    verbose: bool,
    /// Positional arguments after the module path, passed to `_start` as
    /// `i32`s in order.
    start_args: Vec<i32>,
}

const USAGE: &str = "usage: rwasm <module.wasm> [--threaded] [-v] [i32-arg...]";

fn parse_args() -> Result<Args, String> {
    let mut path = None;
    let mut threaded = false;
    let mut verbose = false;
    let mut start_args = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--threaded" => threaded = true,
            "-v" | "--verbose" => verbose = true,
            other if path.is_none() => path = Some(other.to_string()),
            other => start_args.push(other.parse::<i32>().map_err(|_| USAGE.to_string())?),
        }
    }
    Ok(Args { path: path.ok_or(USAGE)?, threaded, verbose, start_args })
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(1);
        }
    };

    if args.verbose {
        let subscriber = tracing_subscriber::registry().with(tracing_tree::HierarchicalLayer::new(2));
        tracing::subscriber::set_global_default(subscriber).expect("failed to install tracing subscriber");
    }

    let host = Host::default();

    let reader = match rwasm::byte_reader::ByteReader::open(&args.path) {
        Ok(reader) => reader,
        Err(err) => {
            eprintln!("error: could not read {}: {err}", args.path);
            return ExitCode::from(1);
        }
    };
    let (bytes, _) = reader.raw();

    let module = match rwasm::load_module(bytes, &host) {
        Ok(module) => module,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };

    let config = VmConfig {
        dispatch: if args.threaded { DispatchMode::Threaded } else { DispatchMode::Switched },
        ..VmConfig::default()
    };
    rwasm::virtual_machine_init(&module);

    let start_args: Vec<rwasm::Cell> = args.start_args.iter().map(|&n| rwasm::Cell::from_i32(n)).collect();
    let result = rwasm::eval_module(&module, &host, config, &start_args);
    let code = match result {
        Ok(results) => {
            for cell in &results {
                println!("{}", cell.as_i64());
            }
            ExitCode::SUCCESS
        }
        Err(rwasm::ExecutionError::MissingEntrypoint) => {
            eprintln!("error: module has no exported \"_start\" function");
            ExitCode::from(3)
        }
        Err(err) => {
            eprintln!("trap: {err}");
            ExitCode::from(2)
        }
    };

    rwasm::module_dispose(module, &host);
    host.alloc.assert_balanced();
    code
}
