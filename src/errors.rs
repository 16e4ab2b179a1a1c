//! Error types for loading and executing PZ bytecode.

use pz_derive::Error;

/// Errors that can occur while reading and linking a PZ file.
///
/// I/O variants carry the filename so diagnostics can be printed without
/// further context; format and linkage variants follow the loader's
/// phase-by-phase validation.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Underlying file I/O failure (open, read, seek).
    #[error("{filename}: {source}")]
    Io {
        filename: String,
        source: std::io::Error,
    },
    /// The file ended in the middle of a field.
    #[error("{0}: unexpected end of file")]
    UnexpectedEof(String),
    /// The file is a PZ object; only programs and libraries are runnable.
    #[error("{0}: cannot execute plasma objects, link objects into a program first")]
    ObjectFile(String),
    /// The leading magic number is not a PZ magic.
    #[error("{0}: bad magic value, is this a PZ file?")]
    BadMagic(String),
    /// The description string does not carry the expected prefix.
    #[error("{0}: bad description string, is this a PZ file?")]
    BadDescription(String),
    /// Format version mismatch.
    #[error("incorrect PZ version, found {found}, expecting {expected}")]
    BadVersion { found: u16, expected: u16 },
    /// An option entry's length does not match its type.
    #[error("{0}: corrupt file while reading options")]
    CorruptOptions(String),
    /// An imported module is not present in the registry.
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    /// An imported symbol is not exported by its module.
    #[error("procedure not found: {module}.{symbol}")]
    ProcedureNotFound { module: String, symbol: String },
    /// A data entry carries an unknown kind byte.
    #[error("unknown data entry kind {0}")]
    BadDataKind(u8),
    /// A data slot carries an unknown encoding byte.
    #[error("unexpected data encoding 0x{0:02x}")]
    BadDataEncoding(u8),
    /// A width byte is outside the defined set.
    #[error("invalid data width {0}")]
    BadWidth(u8),
    /// Data entries may only reference earlier data entries.
    #[error("forward data reference to id {0}")]
    ForwardDataReference(u32),
    /// An id is out of range for its section.
    #[error("invalid {kind} id {id}")]
    BadId { kind: &'static str, id: u32 },
    /// An opcode byte the instruction table does not define, or one that
    /// is interpreter-internal and must not appear in a file.
    #[error("unknown opcode 0x{0:02x} in instruction stream")]
    BadOpcode(u8),
    /// An instruction-object tag other than code or context metadata.
    #[error("unknown byte 0x{0:02x} in instruction stream")]
    BadCodeTag(u8),
    /// Bytes remain after the last section.
    #[error("{0}: junk at end of file")]
    JunkAtEof(String),
    /// The entry option references a closure id the file never defines.
    #[error("entry closure id {0} is not a valid closure")]
    BadEntryClosure(u32),
    /// The entry option carries an unknown signature byte.
    #[error("invalid entry signature {0}")]
    BadEntrySignature(u8),
    /// Allocation failed and the current scope could not collect.
    #[error("out of memory while {0}")]
    OutOfMemory(&'static str),
}

/// Errors raised by the interpreter.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The entry module carries no entry closure.
    #[error("no entry closure in the program's entry module")]
    NoEntryClosure,
    /// The instruction stream decoded to an undefined opcode.
    #[error("unknown opcode 0x{0:02x} at runtime")]
    BadOpcode(u8),
    /// The instruction stream decoded to an undefined width or operand.
    #[error("corrupt instruction stream")]
    CorruptCode,
    /// A `CALL_BUILTIN` index outside the builtin table.
    #[error("unknown builtin id {0}")]
    BadBuiltin(u32),
    /// Integer division or modulo by zero.
    #[error("division by zero")]
    DivisionByZero,
    /// The expression stack was popped while empty.
    #[error("expression stack underflow")]
    StackUnderflow,
}
