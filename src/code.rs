//! Instruction set table, instruction encoder, and procedures.
//!
//! The [`for_each_opcode!`](crate::for_each_opcode) macro holds the
//! canonical instruction definitions and invokes a callback macro for code
//! generation, so the loader, the encoder, and the interpreter share one
//! definition. Each table entry gives the opcode byte, the mnemonic, how
//! many width bytes follow the opcode, the immediate kind, and whether the
//! opcode may appear in bytecode files (a few are interpreter-internal).
//!
//! # In-memory encoding
//!
//! `opcode (1 byte) | width (1 byte) x {0,1,2} | immediate?`
//!
//! Immediates are stored unaligned in native byte order. Reference
//! immediates occupy a pointer-sized word holding a resolved absolute
//! address, except import-table and struct-field references, which are
//! 16-bit offsets.

use crate::data::{FlatString, Width};
use crate::heap::layout::WORD_SIZE;

/// Kinds of immediate operand an instruction can carry.
///
/// The `*Ref` kinds appear in bytecode files as 32-bit ids (plus a field
/// byte for `StructRefField`) and are resolved by the loader; the plain
/// kinds are copied through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImmediateType {
    None,
    U8,
    U16,
    U32,
    U64,
    /// Resolves to the absolute address of a closure cell.
    ClosureRef,
    /// Resolves to the absolute address of a proc's code buffer.
    ProcRef,
    /// Resolves to a 16-bit byte offset into an import-closure array.
    ImportRef,
    /// Resolves to the absolute address of an imported closure.
    ImportClosureRef,
    /// Resolves to the absolute address of a block in the current proc.
    LabelRef,
    /// Resolves to a struct's total size, as a word.
    StructRef,
    /// Resolves to a 16-bit field offset within a struct.
    StructRefField,
}

impl ImmediateType {
    /// Bytes the immediate occupies in a proc's code buffer.
    pub const fn in_memory_size(self) -> usize {
        match self {
            ImmediateType::None => 0,
            ImmediateType::U8 => 1,
            ImmediateType::U16 | ImmediateType::ImportRef | ImmediateType::StructRefField => 2,
            ImmediateType::U32 => 4,
            ImmediateType::U64 => 8,
            ImmediateType::ClosureRef
            | ImmediateType::ProcRef
            | ImmediateType::ImportClosureRef
            | ImmediateType::LabelRef
            | ImmediateType::StructRef => WORD_SIZE,
        }
    }
}

/// A resolved immediate value ready to be encoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Immediate {
    None,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// A pointer-sized value: a resolved address or a struct size.
    Word(usize),
}

impl Immediate {
    fn encoded_size(self) -> usize {
        match self {
            Immediate::None => 0,
            Immediate::U8(_) => 1,
            Immediate::U16(_) => 2,
            Immediate::U32(_) => 4,
            Immediate::U64(_) => 8,
            Immediate::Word(_) => WORD_SIZE,
        }
    }
}

/// Invokes a callback macro with the complete instruction definition list.
///
/// Entry form: `Name = opcode, "mnemonic" => (num_widths, ImmediateKind,
/// in_bytecode)`.
#[macro_export]
macro_rules! for_each_opcode {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Immediates
            // =========================
            /// Push a 32-bit immediate zero-extended to the given width.
            LoadImmNum = 0x00, "load_imm_num" => (1, U32, true),
            /// Push an 8-bit immediate.
            LoadImm8 = 0x01, "load_imm_8" => (0, U8, true),
            /// Push a 16-bit immediate.
            LoadImm16 = 0x02, "load_imm_16" => (0, U16, true),
            /// Push a 32-bit immediate.
            LoadImm32 = 0x03, "load_imm_32" => (0, U32, true),
            /// Push a 64-bit immediate.
            LoadImm64 = 0x04, "load_imm_64" => (0, U64, true),
            // =========================
            // Conversions (width1 -> width2)
            // =========================
            /// Zero-extend.
            Ze = 0x05, "ze" => (2, None, true),
            /// Sign-extend.
            Se = 0x06, "se" => (2, None, true),
            /// Truncate.
            Trunc = 0x07, "trunc" => (2, None, true),
            // =========================
            // Arithmetic and logic, at the given width
            // =========================
            Add = 0x08, "add" => (1, None, true),
            Sub = 0x09, "sub" => (1, None, true),
            Mul = 0x0A, "mul" => (1, None, true),
            Div = 0x0B, "div" => (1, None, true),
            Mod = 0x0C, "mod" => (1, None, true),
            Lshift = 0x0D, "lshift" => (1, None, true),
            Rshift = 0x0E, "rshift" => (1, None, true),
            And = 0x0F, "and" => (1, None, true),
            Or = 0x10, "or" => (1, None, true),
            Xor = 0x11, "xor" => (1, None, true),
            /// Unsigned less-than.
            LtU = 0x12, "lt_u" => (1, None, true),
            /// Signed less-than.
            LtS = 0x13, "lt_s" => (1, None, true),
            /// Unsigned greater-than.
            GtU = 0x14, "gt_u" => (1, None, true),
            /// Signed greater-than.
            GtS = 0x15, "gt_s" => (1, None, true),
            Eq = 0x16, "eq" => (1, None, true),
            /// Logical not: pushes 1 if the operand is zero, else 0.
            Not = 0x17, "not" => (1, None, true),
            // =========================
            // Stack shuffling
            // =========================
            Drop = 0x18, "drop" => (0, None, true),
            Dup = 0x19, "dup" => (0, None, true),
            Swap = 0x1A, "swap" => (0, None, true),
            /// Rotate the value `n` deep to the top.
            Roll = 0x1B, "roll" => (0, U8, true),
            /// Copy the value `n` deep to the top.
            Pick = 0x1C, "pick" => (0, U8, true),
            // =========================
            // Calls and control flow
            // =========================
            /// Call the closure whose cell address is the immediate.
            Call = 0x1D, "call" => (0, ClosureRef, true),
            /// Call an imported closure.
            CallImport = 0x1E, "call_import" => (0, ImportClosureRef, true),
            /// Call the closure whose cell address is on the stack.
            CallInd = 0x1F, "call_ind" => (0, None, true),
            /// Call a proc directly, keeping the current environment.
            CallProc = 0x20, "call_proc" => (0, ProcRef, true),
            /// Tail-call forms of the four calls above.
            TCall = 0x21, "tcall" => (0, ClosureRef, true),
            TCallImport = 0x22, "tcall_import" => (0, ImportClosureRef, true),
            TCallInd = 0x23, "tcall_ind" => (0, None, true),
            TCallProc = 0x24, "tcall_proc" => (0, ProcRef, true),
            /// Jump to the block if the popped value (at the width) is
            /// non-zero.
            CJmp = 0x25, "cjmp" => (1, LabelRef, true),
            Jmp = 0x26, "jmp" => (0, LabelRef, true),
            /// Return; with an empty return stack, halt.
            Ret = 0x27, "ret" => (0, None, true),
            // =========================
            // Memory
            // =========================
            /// Allocate a struct of the immediate's size; push the pointer.
            Alloc = 0x28, "alloc" => (0, StructRef, true),
            /// Pop an environment pointer, close over the proc named by the
            /// immediate, push the closure.
            MakeClosure = 0x29, "make_closure" => (0, ProcRef, true),
            /// Pop a struct pointer, push the field at the immediate
            /// offset, at the given width.
            Load = 0x2A, "load" => (1, StructRefField, true),
            /// Pop a value and a struct pointer, store the value at the
            /// immediate offset, at the given width.
            Store = 0x2B, "store" => (1, StructRefField, true),
            /// Pop an import-array base pointer, push the word at the
            /// immediate byte offset.
            LoadImport = 0x2C, "load_import" => (0, ImportRef, true),
            /// Push the current environment pointer.
            GetEnv = 0x2D, "get_env" => (0, None, true),
            // =========================
            // Interpreter-internal; never present in bytecode files
            // =========================
            /// Invoke the builtin with the immediate's index.
            CallBuiltin = 0xF0, "call_builtin" => (0, U32, false),
        }
    };
}

#[macro_export]
macro_rules! define_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $byte:literal, $mnemonic:literal => (
                $widths:expr, $imm:ident, $in_file:expr
            )
        ),* $(,)?
    ) => {
        /// A bytecode operation.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $byte,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = $crate::errors::LoadError;

            fn try_from(value: u8) -> Result<Opcode, Self::Error> {
                match value {
                    $( $byte => Ok(Opcode::$name), )*
                    other => Err($crate::errors::LoadError::BadOpcode(other)),
                }
            }
        }

        impl Opcode {
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Number of width bytes following the opcode: 0, 1 or 2.
            pub const fn num_width_bytes(self) -> usize {
                match self {
                    $( Opcode::$name => $widths, )*
                }
            }

            pub const fn immediate_type(self) -> ImmediateType {
                match self {
                    $( Opcode::$name => ImmediateType::$imm, )*
                }
            }

            /// Whether the opcode may appear in a bytecode file.
            pub const fn in_bytecode(self) -> bool {
                match self {
                    $( Opcode::$name => $in_file, )*
                }
            }
        }
    };
}

for_each_opcode!(define_opcodes);

/// Encodes one instruction at `offset` in a proc's code buffer and returns
/// the offset just past it. A null `code` measures without writing; pass
/// one uses this to compute code sizes with exactly the arithmetic pass
/// two will use.
pub fn write_instr(
    code: *mut u8,
    offset: usize,
    opcode: Opcode,
    width1: Option<Width>,
    width2: Option<Width>,
    immediate: Immediate,
) -> usize {
    debug_assert_eq!(
        width1.iter().count() + width2.iter().count(),
        opcode.num_width_bytes(),
        "width count does not match the instruction table"
    );
    debug_assert_eq!(
        immediate.encoded_size(),
        opcode.immediate_type().in_memory_size(),
        "immediate size does not match the instruction table"
    );

    let mut offset = offset;

    if !code.is_null() {
        // SAFETY: callers allocate the buffer using this function's own
        // measure mode, so every write below is in bounds.
        unsafe { code.add(offset).write(opcode as u8) };
    }
    offset += 1;

    for width in [width1, width2].into_iter().flatten() {
        if !code.is_null() {
            unsafe { code.add(offset).write(width as u8) };
        }
        offset += 1;
    }

    match immediate {
        Immediate::None => {}
        Immediate::U8(value) => {
            if !code.is_null() {
                unsafe { code.add(offset).write(value) };
            }
            offset += 1;
        }
        Immediate::U16(value) => {
            if !code.is_null() {
                unsafe { (code.add(offset) as *mut u16).write_unaligned(value) };
            }
            offset += 2;
        }
        Immediate::U32(value) => {
            if !code.is_null() {
                unsafe { (code.add(offset) as *mut u32).write_unaligned(value) };
            }
            offset += 4;
        }
        Immediate::U64(value) => {
            if !code.is_null() {
                unsafe { (code.add(offset) as *mut u64).write_unaligned(value) };
            }
            offset += 8;
        }
        Immediate::Word(value) => {
            if !code.is_null() {
                unsafe { (code.add(offset) as *mut usize).write_unaligned(value) };
            }
            offset += WORD_SIZE;
        }
    }

    offset
}

/// A source-position annotation attached to a code offset.
#[derive(Clone, Copy, Debug)]
pub struct SourceContext {
    /// The source file, as a flat string data entry; absent when only a
    /// line is known.
    pub file: Option<FlatString>,
    pub line: u32,
}

/// A procedure: a heap-allocated code buffer plus its block offsets and
/// optional debug contexts.
pub struct Proc {
    name: String,
    code: *mut u8,
    code_size: usize,
    /// Byte offset of each block's first instruction within `code`.
    block_offsets: Vec<usize>,
    /// (code offset, context) pairs in code order; `None` clears the
    /// context from that offset on.
    contexts: Vec<(usize, Option<SourceContext>)>,
}

impl Proc {
    pub(crate) fn new(
        name: String,
        code: *mut u8,
        code_size: usize,
        block_offsets: Vec<usize>,
    ) -> Proc {
        Proc {
            name,
            code,
            code_size,
            block_offsets,
            contexts: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> *mut u8 {
        self.code
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn num_blocks(&self) -> usize {
        self.block_offsets.len()
    }

    pub fn block_offset(&self, block: usize) -> usize {
        self.block_offsets[block]
    }

    /// True if `addr` points into this proc's code buffer.
    pub fn contains_address(&self, addr: *const u8) -> bool {
        let base = self.code as usize;
        let addr = addr as usize;
        addr >= base && addr < base + self.code_size
    }

    pub fn add_context(&mut self, offset: usize, file: FlatString, line: u32) {
        self.contexts.push((
            offset,
            Some(SourceContext {
                file: Some(file),
                line,
            }),
        ));
    }

    /// Adds a line-only context; the file carries over from the previous
    /// context, if any.
    pub fn add_context_line(&mut self, offset: usize, line: u32) {
        let file = self
            .contexts
            .iter()
            .rev()
            .find_map(|(_, ctx)| ctx.as_ref())
            .and_then(|ctx| ctx.file);
        self.contexts.push((offset, Some(SourceContext { file, line })));
    }

    /// Clears the context from `offset` onwards.
    pub fn clear_context(&mut self, offset: usize) {
        self.contexts.push((offset, None));
    }

    /// The context governing the given code offset, if any.
    pub fn context_at(&self, offset: usize) -> Option<SourceContext> {
        self.contexts
            .iter()
            .take_while(|(at, _)| *at <= offset)
            .last()
            .and_then(|(_, ctx)| *ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trips_through_bytes() {
        for byte in 0..=255u8 {
            if let Ok(opcode) = Opcode::try_from(byte) {
                assert_eq!(opcode as u8, byte);
                assert!(opcode.num_width_bytes() <= 2);
            }
        }
        assert!(Opcode::try_from(0xEE).is_err());
    }

    #[test]
    fn builtin_call_is_not_a_file_opcode() {
        assert!(!Opcode::CallBuiltin.in_bytecode());
        assert!(Opcode::Call.in_bytecode());
    }

    #[test]
    fn two_width_opcodes_take_no_immediate() {
        for byte in 0..=255u8 {
            if let Ok(opcode) = Opcode::try_from(byte) {
                if opcode.num_width_bytes() == 2 {
                    assert_eq!(opcode.immediate_type(), ImmediateType::None);
                }
            }
        }
    }

    #[test]
    fn measure_mode_matches_write_mode() {
        let mut buf = vec![0u8; 64];
        let measured = write_instr(
            std::ptr::null_mut(),
            0,
            Opcode::LoadImmNum,
            Some(Width::W32),
            None,
            Immediate::U32(42),
        );
        let written = write_instr(
            buf.as_mut_ptr(),
            0,
            Opcode::LoadImmNum,
            Some(Width::W32),
            None,
            Immediate::U32(42),
        );
        assert_eq!(measured, written);
        assert_eq!(measured, 1 + 1 + 4);
        assert_eq!(buf[0], Opcode::LoadImmNum as u8);
        assert_eq!(buf[1], Width::W32 as u8);
        assert_eq!(u32::from_ne_bytes([buf[2], buf[3], buf[4], buf[5]]), 42);
    }

    #[test]
    fn word_immediates_are_pointer_sized() {
        let mut buf = vec![0u8; 64];
        let end = write_instr(
            buf.as_mut_ptr(),
            0,
            Opcode::Call,
            None,
            None,
            Immediate::Word(0xBEEF),
        );
        assert_eq!(end, 1 + WORD_SIZE);
        let imm = unsafe { (buf.as_ptr().add(1) as *const usize).read_unaligned() };
        assert_eq!(imm, 0xBEEF);
    }

    #[test]
    fn instructions_encode_back_to_back() {
        let mut buf = vec![0u8; 64];
        let mut offset = 0;
        offset = write_instr(
            buf.as_mut_ptr(),
            offset,
            Opcode::LoadImm8,
            None,
            None,
            Immediate::U8(7),
        );
        offset = write_instr(
            buf.as_mut_ptr(),
            offset,
            Opcode::Add,
            Some(Width::W32),
            None,
            Immediate::None,
        );
        let end = write_instr(buf.as_mut_ptr(), offset, Opcode::Ret, None, None, Immediate::None);
        assert_eq!(end, (1 + 1) + (1 + 1) + 1);
        assert_eq!(buf[2], Opcode::Add as u8);
        assert_eq!(buf[4], Opcode::Ret as u8);
    }

    #[test]
    fn context_lookup_uses_the_latest_entry() {
        let mut proc = Proc::new("test".to_string(), std::ptr::null_mut(), 0, vec![0]);
        proc.add_context_line(0, 10);
        proc.add_context_line(8, 11);
        proc.clear_context(16);

        assert_eq!(proc.context_at(0).unwrap().line, 10);
        assert_eq!(proc.context_at(7).unwrap().line, 10);
        assert_eq!(proc.context_at(12).unwrap().line, 11);
        assert!(proc.context_at(20).is_none());
    }
}
