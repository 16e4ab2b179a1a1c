//! Runtime for Plasma abstract machine bytecode.
//!
//! Loads compiled modules from the PZ binary format, links cross-module
//! references against a process-wide registry, lays code and data out on
//! a conservative mark-sweep heap, and interprets the program's entry
//! closure.

pub mod bytecode;
pub mod closure;
pub mod code;
pub mod data;
pub mod errors;
pub mod heap;
pub mod library;
pub mod machine;
pub mod run;
pub mod util;
