//! Loader tests over in-memory file images.
//!
//! The `PzImage` builder assembles byte-exact PZ files section by section
//! so each test controls exactly what the loader sees.

use std::rc::Rc;

use crate::bytecode::format;
use crate::bytecode::input::BinaryInput;
use crate::bytecode::read::read_from;
use crate::code::Opcode;
use crate::data::{FlatString, Width};
use crate::errors::LoadError;
use crate::heap::layout::WORD_SIZE;
use crate::heap::HeapOptions;
use crate::library::{EntrySignature, Library};
use crate::machine::Machine;

struct PzImage {
    buf: Vec<u8>,
}

impl PzImage {
    /// Starts a program image: magic, description, version.
    fn program() -> PzImage {
        let mut image = PzImage { buf: Vec::new() };
        image.u32(format::PROGRAM_MAGIC);
        image.lp(b"Plasma program version dev");
        image.u16(format::FORMAT_VERSION);
        image
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    /// A 16-bit length-prefixed string.
    fn lp(&mut self, s: &[u8]) -> &mut Self {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s);
        self
    }

    fn no_options(&mut self) -> &mut Self {
        self.u16(0)
    }

    fn entry_option(&mut self, signature: u8, closure_id: u32) -> &mut Self {
        self.u16(1);
        self.u16(format::OPT_ENTRY_CLOSURE);
        self.u16(format::OPT_ENTRY_CLOSURE_LEN);
        self.u8(signature);
        self.u32(closure_id)
    }

    fn names(&mut self, names: &[&str]) -> &mut Self {
        self.u32(names.len() as u32);
        for name in names {
            self.lp(name.as_bytes());
        }
        self
    }

    fn counts(
        &mut self,
        imports: u32,
        structs: u32,
        datas: u32,
        procs: u32,
        closures: u32,
        exports: u32,
    ) -> &mut Self {
        self.u32(imports);
        self.u32(structs);
        self.u32(datas);
        self.u32(procs);
        self.u32(closures);
        self.u32(exports)
    }

    /// A normal-encoded one-byte data value.
    fn byte_value(&mut self, v: u8) -> &mut Self {
        self.u8(format::ENC_NORMAL | 1);
        self.u8(v)
    }

    /// A trivial one-block proc containing a single `ret`.
    fn trivial_proc(&mut self, name: &str) -> &mut Self {
        self.lp(name.as_bytes());
        self.u32(1); // blocks
        self.u32(1); // instruction objects
        self.u8(format::CODE_INSTR);
        self.u8(Opcode::Ret as u8)
    }

    fn load(self, machine: &Machine) -> Result<Rc<Library>, LoadError> {
        self.load_with_debuginfo(machine, false)
    }

    fn load_with_debuginfo(
        self,
        machine: &Machine,
        load_debuginfo: bool,
    ) -> Result<Rc<Library>, LoadError> {
        read_from(
            machine,
            BinaryInput::from_bytes("test.pz", self.buf),
            load_debuginfo,
        )
    }
}

fn machine() -> Machine {
    Machine::init(HeapOptions {
        gc_slow_asserts: true,
        ..HeapOptions::default()
    })
}

unsafe fn read_word(ptr: *const u8, byte_offset: usize) -> usize {
    unsafe { (ptr.add(byte_offset) as *const usize).read_unaligned() }
}

#[test]
fn empty_program_loads() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]).counts(0, 0, 0, 0, 0, 0);

    let library = image.load(&machine).unwrap();
    assert!(library.structs().is_empty());
    assert_eq!(library.num_datas(), 0);
    assert!(library.procs().is_empty());
    assert_eq!(library.num_closures(), 0);
    assert!(library.exports().is_empty());
    assert!(library.entry_closure().is_none());
}

#[test]
fn junk_after_last_section_is_rejected() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]).counts(0, 0, 0, 0, 0, 0);
    image.u8(0xFF);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::JunkAtEof(_))
    ));
}

#[test]
fn object_files_are_rejected() {
    let machine = machine();
    let mut image = PzImage { buf: Vec::new() };
    image.u32(format::OBJECT_MAGIC);

    assert!(matches!(image.load(&machine), Err(LoadError::ObjectFile(_))));
}

#[test]
fn bad_magic_is_rejected() {
    let machine = machine();
    let mut image = PzImage { buf: Vec::new() };
    image.u32(0xDEAD_BEEF);

    assert!(matches!(image.load(&machine), Err(LoadError::BadMagic(_))));
}

#[test]
fn bad_description_is_rejected() {
    let machine = machine();
    let mut image = PzImage { buf: Vec::new() };
    image.u32(format::PROGRAM_MAGIC);
    image.lp(b"Something else");
    image.u16(format::FORMAT_VERSION);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::BadDescription(_))
    ));
}

#[test]
fn version_mismatch_is_rejected() {
    let machine = machine();
    let mut image = PzImage { buf: Vec::new() };
    image.u32(format::PROGRAM_MAGIC);
    image.lp(b"Plasma program");
    image.u16(99);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::BadVersion {
            found: 99,
            expected: 0
        })
    ));
}

#[test]
fn truncated_file_is_unexpected_eof() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options();
    image.u32(3); // three names promised, none present

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::UnexpectedEof(_))
    ));
}

#[test]
fn unknown_options_are_skipped_by_length() {
    let machine = machine();
    let mut image = PzImage::program();
    image.u16(1); // one option
    image.u16(0x7777); // unknown type
    image.u16(3);
    image.u8(1).u8(2).u8(3);
    image.names(&[]).counts(0, 0, 0, 0, 0, 0);

    assert!(image.load(&machine).is_ok());
}

#[test]
fn entry_option_with_wrong_length_is_corrupt() {
    let machine = machine();
    let mut image = PzImage::program();
    image.u16(1);
    image.u16(format::OPT_ENTRY_CLOSURE);
    image.u16(4); // must be 5
    image.u32(0);
    image.names(&[]).counts(0, 0, 0, 0, 0, 0);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::CorruptOptions(_))
    ));
}

#[test]
fn string_data_entry_round_trips() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]).counts(0, 0, 1, 0, 0, 0);
    image.u8(format::DATA_STRING);
    image.u16(5);
    for byte in b"hello" {
        image.byte_value(*byte);
    }

    let library = image.load(&machine).unwrap();
    let string = FlatString::from_ptr(library.data(0).unwrap());
    assert_eq!(string.len(), 5);
    assert_eq!(string.as_bytes(), b"hello");
}

#[test]
fn wide_array_values_round_trip() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]).counts(0, 0, 1, 0, 0, 0);
    image.u8(format::DATA_ARRAY);
    image.u16(2);
    image.u8(Width::W64 as u8);
    image.u8(format::ENC_NORMAL | 8);
    image.u64(0x0102_0304_0506_0708);
    image.u8(format::ENC_NORMAL | 8);
    image.u64(u64::MAX);

    let library = image.load(&machine).unwrap();
    let array = library.data(0).unwrap();
    // SAFETY: data 0 is an array of two 64-bit values.
    unsafe {
        assert_eq!(
            (array as *const u64).read_unaligned(),
            0x0102_0304_0506_0708
        );
        assert_eq!((array.add(8) as *const u64).read_unaligned(), u64::MAX);
    }
}

#[test]
fn struct_entries_get_layouts() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]).counts(0, 1, 0, 0, 0, 0);
    image.u32(3);
    image.u8(Width::W8 as u8);
    image.u8(Width::W32 as u8);
    image.u8(Width::W8 as u8);

    let library = image.load(&machine).unwrap();
    let layout = &library.structs()[0];
    assert_eq!(layout.field_offset(0), 0);
    assert_eq!(layout.field_offset(1), 4);
    assert_eq!(layout.field_offset(2), 8);
    assert_eq!(layout.total_size(), 12);
}

#[test]
fn data_references_form_a_backward_dag() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 1, 2, 0, 0, 0);
    // Struct 0: one pointer field.
    image.u32(1);
    image.u8(Width::Ptr as u8);
    // Data 0: array of two bytes.
    image.u8(format::DATA_ARRAY);
    image.u16(2);
    image.u8(Width::W8 as u8);
    image.byte_value(1);
    image.byte_value(2);
    // Data 1: struct whose field points at data 0.
    image.u8(format::DATA_STRUCT);
    image.u32(0);
    image.u8(format::ENC_DATA | 4);
    image.u32(0);

    let library = image.load(&machine).unwrap();
    let array = library.data(0).unwrap();
    let record = library.data(1).unwrap();
    // SAFETY: data 0 is a two-byte array; data 1 holds one pointer.
    unsafe {
        assert_eq!(*array, 1);
        assert_eq!(*array.add(1), 2);
        assert_eq!(read_word(record, 0), array as usize);
    }
}

#[test]
fn forward_data_references_are_rejected() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 1, 1, 0, 0, 0);
    image.u32(1);
    image.u8(Width::Ptr as u8);
    // Data 0 points at data 1, which does not exist yet.
    image.u8(format::DATA_STRUCT);
    image.u32(0);
    image.u8(format::ENC_DATA | 4);
    image.u32(1);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::ForwardDataReference(1))
    ));
}

#[test]
fn forward_closure_references_resolve_through_preallocation() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 1, 2, 1, 1, 0);
    // Struct 0: one pointer field.
    image.u32(1);
    image.u8(Width::Ptr as u8);
    // Data 0 references closure 0, which is defined after all data.
    image.u8(format::DATA_STRUCT);
    image.u32(0);
    image.u8(format::ENC_CLOSURE | 4);
    image.u32(0);
    // Data 1: a one-byte array serving as the closure's environment.
    image.u8(format::DATA_ARRAY);
    image.u16(1);
    image.u8(Width::W8 as u8);
    image.byte_value(9);
    // Proc 0 and closure 0 (proc 0, data 1).
    image.trivial_proc("f");
    image.u32(0);
    image.u32(1);

    let library = image.load(&machine).unwrap();
    let record = library.data(0).unwrap();
    let closure = library.closure(0).unwrap();
    let proc = library.proc(0).unwrap();

    // SAFETY: data 0 holds one pointer; the closure cell is initialised.
    unsafe {
        assert_eq!(read_word(record, 0), closure as usize);
        assert_eq!((*closure).code, proc.code());
        assert_eq!((*closure).data, library.data(1).unwrap());
    }
    assert!(proc.contains_address(proc.code()));
}

#[test]
fn labels_resolve_to_block_addresses_in_pass_two() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 0, 1, 1, 1, 0);
    // Data 0: environment for the closure.
    image.u8(format::DATA_ARRAY);
    image.u16(1);
    image.u8(Width::W8 as u8);
    image.byte_value(0);
    // Proc 0: block 0 ends jumping to block 1.
    image.lp(b"looper");
    image.u32(2); // blocks
    image.u32(1); // block 0: one instruction
    image.u8(format::CODE_INSTR);
    image.u8(Opcode::CJmp as u8);
    image.u8(Width::W8 as u8);
    image.u32(1); // target block id
    image.u32(1); // block 1: one instruction
    image.u8(format::CODE_INSTR);
    image.u8(Opcode::Ret as u8);
    // Closure 0.
    image.u32(0);
    image.u32(0);

    let library = image.load(&machine).unwrap();
    let proc = library.proc(0).unwrap();

    // Block 0 is `cjmp` (opcode, width, word immediate); block 1 follows.
    let cjmp_size = 1 + 1 + WORD_SIZE;
    assert_eq!(proc.num_blocks(), 2);
    assert_eq!(proc.block_offset(0), 0);
    assert_eq!(proc.block_offset(1), cjmp_size);
    assert_eq!(proc.code_size(), cjmp_size + 1);

    // The stored immediate is the absolute address of block 1.
    // SAFETY: offsets are within the proc's code buffer.
    unsafe {
        let immediate = read_word(proc.code(), 2);
        assert_eq!(immediate, proc.code() as usize + proc.block_offset(1));
    }
}

#[test]
fn imports_resolve_against_the_registry() {
    let machine = machine();

    // First load a library exporting `lib.f`.
    let mut exporter = PzImage::program();
    exporter.no_options().names(&["lib"]);
    exporter.counts(0, 0, 1, 1, 1, 1);
    exporter.u8(format::DATA_ARRAY);
    exporter.u16(1);
    exporter.u8(Width::W8 as u8);
    exporter.byte_value(0);
    exporter.trivial_proc("f");
    exporter.u32(0);
    exporter.u32(0);
    exporter.lp(b"lib.f");
    exporter.u32(0);
    let exported = exporter.load(&machine).unwrap();
    let exported_closure = exported.lookup_symbol("lib.f").unwrap().closure;

    // Now load a program importing it into a data cell.
    let mut importer = PzImage::program();
    importer.no_options().names(&[]);
    importer.counts(1, 1, 1, 0, 0, 0);
    importer.lp(b"lib");
    importer.lp(b"f");
    importer.u32(1);
    importer.u8(Width::Ptr as u8);
    importer.u8(format::DATA_STRUCT);
    importer.u32(0);
    importer.u8(format::ENC_IMPORT | 4);
    importer.u32(0);

    let program = importer.load(&machine).unwrap();
    let record = program.data(0).unwrap();
    // SAFETY: data 0 holds one pointer.
    unsafe {
        assert_eq!(read_word(record, 0), exported_closure as usize);
    }
}

#[test]
fn missing_module_is_a_linkage_error() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(1, 0, 0, 0, 0, 0);
    image.lp(b"nowhere");
    image.lp(b"f");

    match image.load(&machine) {
        Err(LoadError::ModuleNotFound(module)) => assert_eq!(module, "nowhere"),
        other => panic!("expected ModuleNotFound, got {:?}", other.err()),
    }
}

#[test]
fn missing_symbol_is_a_linkage_error() {
    let machine = machine();

    let mut exporter = PzImage::program();
    exporter.no_options().names(&["lib"]).counts(0, 0, 0, 0, 0, 0);
    exporter.load(&machine).unwrap();

    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(1, 0, 0, 0, 0, 0);
    image.lp(b"lib");
    image.lp(b"missing");

    match image.load(&machine) {
        Err(LoadError::ProcedureNotFound { module, symbol }) => {
            assert_eq!(module, "lib");
            assert_eq!(symbol, "missing");
        }
        other => panic!("expected ProcedureNotFound, got {:?}", other.err()),
    }
}

#[test]
fn entry_closure_is_recorded() {
    let machine = machine();
    let mut image = PzImage::program();
    image.entry_option(EntrySignature::Plain as u8, 0);
    image.names(&[]);
    image.counts(0, 0, 1, 1, 1, 0);
    image.u8(format::DATA_ARRAY);
    image.u16(1);
    image.u8(Width::W8 as u8);
    image.byte_value(0);
    image.trivial_proc("main");
    image.u32(0);
    image.u32(0);

    let library = image.load(&machine).unwrap();
    let (signature, closure) = library.entry_closure().unwrap();
    assert_eq!(signature, EntrySignature::Plain);
    assert_eq!(closure, library.closure(0).unwrap());
}

#[test]
fn entry_closure_out_of_range_is_rejected() {
    let machine = machine();
    let mut image = PzImage::program();
    image.entry_option(EntrySignature::Plain as u8, 7);
    image.names(&[]).counts(0, 0, 0, 0, 0, 0);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::BadEntryClosure(7))
    ));
}

#[test]
fn bad_entry_signature_is_rejected() {
    let machine = machine();
    let mut image = PzImage::program();
    image.entry_option(9, 0);
    image.names(&[]).counts(0, 0, 0, 0, 0, 0);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::BadEntrySignature(9))
    ));
}

#[test]
fn unknown_opcode_in_code_is_rejected() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 0, 0, 1, 0, 0);
    image.lp(b"broken");
    image.u32(1);
    image.u32(1);
    image.u8(format::CODE_INSTR);
    image.u8(0xEE);

    assert!(matches!(image.load(&machine), Err(LoadError::BadOpcode(0xEE))));
}

#[test]
fn interpreter_only_opcodes_are_rejected_in_files() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 0, 0, 1, 0, 0);
    image.lp(b"sneaky");
    image.u32(1);
    image.u32(1);
    image.u8(format::CODE_INSTR);
    image.u8(Opcode::CallBuiltin as u8);

    assert!(matches!(
        image.load(&machine),
        Err(LoadError::BadOpcode(_))
    ));
}

#[test]
fn unknown_code_tag_is_rejected() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 0, 0, 1, 0, 0);
    image.lp(b"broken");
    image.u32(1);
    image.u32(1);
    image.u8(9); // not INSTR or META_*

    assert!(matches!(image.load(&machine), Err(LoadError::BadCodeTag(9))));
}

#[test]
fn context_metadata_is_stored_when_debuginfo_is_on() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 0, 2, 1, 1, 0);
    // Data 0: the source filename.
    image.u8(format::DATA_STRING);
    image.u16(4);
    for byte in b"m.ps" {
        image.byte_value(*byte);
    }
    // Data 1: closure environment.
    image.u8(format::DATA_ARRAY);
    image.u16(1);
    image.u8(Width::W8 as u8);
    image.byte_value(0);
    // Proc 0 with context metadata around two instructions.
    image.lp(b"main");
    image.u32(1); // blocks
    image.u32(4); // instruction objects
    image.u8(format::CODE_META_CONTEXT);
    image.u32(0); // file = data 0
    image.u32(14); // line
    image.u8(format::CODE_INSTR);
    image.u8(Opcode::Drop as u8);
    image.u8(format::CODE_META_CONTEXT_SHORT);
    image.u32(15);
    image.u8(format::CODE_INSTR);
    image.u8(Opcode::Ret as u8);
    // Closure 0.
    image.u32(0);
    image.u32(1);

    let library = image.load_with_debuginfo(&machine, true).unwrap();
    let proc = library.proc(0).unwrap();

    let first = proc.context_at(0).unwrap();
    assert_eq!(first.line, 14);
    assert_eq!(first.file.unwrap().as_bytes(), b"m.ps");

    // The short form inherits the file.
    let second = proc.context_at(1).unwrap();
    assert_eq!(second.line, 15);
    assert_eq!(second.file.unwrap().as_bytes(), b"m.ps");
}

#[test]
fn context_metadata_is_skipped_when_debuginfo_is_off() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&[]);
    image.counts(0, 0, 1, 1, 1, 0);
    image.u8(format::DATA_ARRAY);
    image.u16(1);
    image.u8(Width::W8 as u8);
    image.byte_value(0);
    image.lp(b"main");
    image.u32(1);
    image.u32(2);
    image.u8(format::CODE_META_CONTEXT_SHORT);
    image.u32(23);
    image.u8(format::CODE_INSTR);
    image.u8(Opcode::Ret as u8);
    image.u32(0);
    image.u32(0);

    let library = image.load(&machine).unwrap();
    let proc = library.proc(0).unwrap();
    assert!(proc.context_at(0).is_none());
}

#[test]
fn loaded_libraries_survive_collection() {
    let machine = machine();
    let mut image = PzImage::program();
    image.no_options().names(&["keep"]);
    image.counts(0, 0, 1, 1, 1, 0);
    image.u8(format::DATA_STRING);
    image.u16(4);
    for byte in b"data" {
        image.byte_value(*byte);
    }
    image.trivial_proc("f");
    image.u32(0);
    image.u32(0);

    let library = image.load(&machine).unwrap();
    let root = machine.root();
    let tracer = crate::heap::capability::GcTracer::new(&root);
    machine.heap().collect(&tracer);
    machine.heap().check_consistency();

    let string = FlatString::from_ptr(library.data(0).unwrap());
    assert_eq!(string.as_bytes(), b"data");
    // SAFETY: the closure cell is initialised.
    unsafe {
        assert_eq!(
            (*library.closure(0).unwrap()).code,
            library.proc(0).unwrap().code()
        );
    }
}
