//! `pzrun` - execute a Plasma bytecode program.
//!
//! # Usage
//! ```text
//! pzrun [OPTIONS] <file.pz> [program args...]
//! ```
//!
//! # Options
//! - `-v`: verbose load and GC diagnostics
//! - `-h`: print help and exit
//! - `-V`: print version and exit
//!
//! Development builds additionally accept `--gc-zealous`, `--gc-trace`,
//! `--gc-poison` and `--gc-slow-asserts`.

use std::env;
use std::process;

use pz_runtime::bytecode::read::read;
use pz_runtime::error;
use pz_runtime::heap::HeapOptions;
use pz_runtime::machine::Machine;
use pz_runtime::run::{run, setup_builtins};
use pz_runtime::util::log;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "\
Plasma runtime

USAGE:
    {program} [OPTIONS] <file.pz> [program args...]

ARGS:
    <file.pz>    A PZ program or library with an entry closure

OPTIONS:
    -v               Verbose load and GC diagnostics
    -h               Print this help message
    -V               Print version information
";

/// Prints usage information to the given stream.
fn print_usage(program: &str, to_stderr: bool) {
    let text = USAGE.replace("{program}", program);
    if to_stderr {
        eprint!("{}", text);
    } else {
        print!("{}", text);
    }
}

fn print_version() {
    println!("Plasma abstract machine runtime, version {}", VERSION);
    println!("Distributed under the MIT license");
}

struct Options {
    verbose: bool,
    heap: HeapOptions,
    file: String,
    program_args: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Option<Options>, ()> {
    let program = args.first().map(String::as_str).unwrap_or("pzrun");
    let mut verbose = false;
    let mut heap = HeapOptions::default();
    let mut file = None;
    let mut program_args = Vec::new();

    for arg in &args[1..] {
        if file.is_some() {
            program_args.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "-h" => {
                print_usage(program, false);
                return Ok(None);
            }
            "-V" => {
                print_version();
                return Ok(None);
            }
            "-v" => verbose = true,
            #[cfg(debug_assertions)]
            "--gc-zealous" => heap.gc_zealous = true,
            #[cfg(debug_assertions)]
            "--gc-trace" => heap.gc_trace = true,
            #[cfg(debug_assertions)]
            "--gc-poison" => heap.gc_poison = true,
            #[cfg(debug_assertions)]
            "--gc-slow-asserts" => heap.gc_slow_asserts = true,
            other if other.starts_with('-') => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(program, true);
                return Err(());
            }
            _ => file = Some(arg.clone()),
        }
    }

    let Some(file) = file else {
        eprintln!("Expected exactly one PZ file\n");
        print_usage(program, true);
        return Err(());
    };

    Ok(Some(Options {
        verbose,
        heap,
        file,
        program_args,
    }))
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let options = match parse_args(&args) {
        Ok(Some(options)) => options,
        Ok(None) => return,
        Err(()) => process::exit(1),
    };

    log::init(if options.verbose {
        log::Level::Verbose
    } else {
        log::Level::Info
    });

    let machine = Machine::init(options.heap);
    setup_builtins(&machine);

    let library = match read(&machine, &options.file, options.verbose) {
        Ok(library) => library,
        Err(err) => {
            error!("{}", err);
            machine.finalise();
            process::exit(1);
        }
    };
    machine.add_entry_module(std::rc::Rc::clone(&library));

    let exit_code = match run(&machine, &library, &options.program_args) {
        Ok(code) => code,
        Err(err) => {
            error!("{}", err);
            machine.finalise();
            process::exit(1);
        }
    };

    machine.finalise();
    process::exit(exit_code);
}
