//! The loader/linker: reads a PZ program or library file and links it
//! against the modules already in the registry.
//!
//! Loading is phase-ordered: header, options, name pool, section counts,
//! imports, structs, data, procs, closures, exports. Procs are read twice:
//! pass one computes each proc's code size and block offsets (instruction
//! widths and reference immediates make sizes unknowable from the header),
//! then the file position is rewound and pass two writes the instructions
//! with every reference resolved to its final address. Closure cells are
//! pre-allocated before any data is read, so closure references are always
//! resolvable even when they point forward.

use std::rc::Rc;

use crate::bytecode::format;
use crate::bytecode::input::BinaryInput;
use crate::closure::{init_closure, Closure};
use crate::code::{write_instr, Immediate, ImmediateType, Opcode};
use crate::data::{
    width_to_bytes, write_fast_from_u32, write_normal_u16, write_normal_u32, write_normal_u64,
    write_normal_u8, write_ptr, write_wptr_from_u32, FlatString, StructLayout, Width,
};
use crate::errors::LoadError;
use crate::heap::capability::{GcCapability, GcTracer, NoGcScope};
use crate::heap::layout::WORD_SIZE;
use crate::library::{EntrySignature, Library, LibraryLoading};
use crate::machine::Machine;
use crate::verbose;

/// Imports resolved against the registry, in import order: the exporting
/// library's export ids and the closure cells themselves.
struct Imported {
    ids: Vec<u32>,
    closures: Vec<*mut Closure>,
}

/// Shape of a proc discovered in pass one.
struct ProcShape {
    name: String,
    code_size: usize,
    block_offsets: Vec<usize>,
}

/// Reads, links and registers one PZ file. On success the library is
/// registered under each of its pool names (or the file stem when the
/// pool is empty) and returned.
pub fn read(
    machine: &Machine,
    filename: &str,
    load_debuginfo: bool,
) -> Result<Rc<Library>, LoadError> {
    let file = BinaryInput::open(filename)?;
    read_from(machine, file, load_debuginfo)
}

/// As [`read`], over an already-open input. The loader tests feed
/// in-memory images through here.
pub fn read_from(
    machine: &Machine,
    mut file: BinaryInput,
    load_debuginfo: bool,
) -> Result<Rc<Library>, LoadError> {
    let filename = file.filename().to_string();
    let filename = filename.as_str();

    let magic = file.read_u32()?;
    match magic {
        format::OBJECT_MAGIC => return Err(LoadError::ObjectFile(filename.to_string())),
        format::PROGRAM_MAGIC | format::LIBRARY_MAGIC => {}
        _ => return Err(LoadError::BadMagic(filename.to_string())),
    }

    let description = file.read_len_string()?;
    if !description.starts_with(format::PROGRAM_MAGIC_STRING)
        && !description.starts_with(format::LIBRARY_MAGIC_STRING)
    {
        return Err(LoadError::BadDescription(filename.to_string()));
    }

    let version = file.read_u16()?;
    if version != format::FORMAT_VERSION {
        return Err(LoadError::BadVersion {
            found: version,
            expected: format::FORMAT_VERSION,
        });
    }

    let entry = read_options(&mut file)?;

    let num_names = file.read_u32()?;
    let mut names = Vec::new();
    for _ in 0..num_names {
        names.push(file.read_len_string()?);
    }

    let num_imports = file.read_u32()?;
    let num_structs = file.read_u32()?;
    let num_datas = file.read_u32()?;
    let num_procs = file.read_u32()?;
    let num_closures = file.read_u32()?;
    let num_exports = file.read_u32()?;

    if let Some((_, closure_id)) = entry {
        if closure_id >= num_closures {
            return Err(LoadError::BadEntryClosure(closure_id));
        }
    }

    let root = machine.root();

    // The aggregate and every closure cell are built under a no-GC scope:
    // a collection before they are traceable would reclaim them.
    let lib_load = {
        let no_gc = NoGcScope::new(&root);
        let lib_load =
            LibraryLoading::new(num_structs, num_datas, num_procs, num_closures, &no_gc);
        no_gc.abort_if_oom("loading a module");
        lib_load
    };

    // All further loading allocates through a scope that traces the
    // half-built library.
    let cap = GcTracer::with_extra(&root, &lib_load);

    let imported = read_imports(machine, &mut file, num_imports)?;
    read_structs(&mut file, num_structs, &lib_load)?;
    read_data(&mut file, num_datas, &lib_load, &imported, &cap)?;
    read_code(
        &mut file,
        num_procs,
        &lib_load,
        &imported,
        &cap,
        load_debuginfo,
    )?;
    read_closures(&mut file, num_closures, &lib_load)?;
    read_exports(&mut file, num_exports, &lib_load)?;
    drop(cap);

    // We should now be at the end of the file.
    if !file.is_at_eof()? {
        return Err(LoadError::JunkAtEof(filename.to_string()));
    }
    file.close();

    verbose!(
        "loaded {}: {} structs, {} datas, {} procs, {} closures, {} exports",
        filename,
        lib_load.num_structs(),
        lib_load.num_datas(),
        lib_load.num_procs(),
        lib_load.num_closures(),
        num_exports
    );

    // Nothing roots the new cells between the aggregate handover and
    // registration, so collection stays forbidden until the library is in
    // the registry.
    let no_gc = NoGcScope::new(&root);
    let mut library = Library::from_loading(names.clone(), lib_load);
    if let Some((signature, closure_id)) = entry {
        let closure = library
            .closure(closure_id)
            .expect("entry closure id validated against the header");
        library.set_entry_closure(signature, closure);
    }
    let library = Rc::new(library);
    if names.is_empty() {
        let stem = std::path::Path::new(filename)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| filename.to_string());
        machine.add_module(&stem, Rc::clone(&library));
    } else {
        for name in &names {
            machine.add_module(name, Rc::clone(&library));
        }
    }
    no_gc.abort_if_oom("finishing a module load");
    drop(no_gc);

    Ok(library)
}

fn read_options(file: &mut BinaryInput) -> Result<Option<(EntrySignature, u32)>, LoadError> {
    let num_options = file.read_u16()?;
    let mut entry = None;

    for _ in 0..num_options {
        let opt_type = file.read_u16()?;
        let len = file.read_u16()?;
        match opt_type {
            format::OPT_ENTRY_CLOSURE => {
                if len != format::OPT_ENTRY_CLOSURE_LEN {
                    return Err(LoadError::CorruptOptions(file.filename().to_string()));
                }
                let signature = EntrySignature::try_from(file.read_u8()?)?;
                let closure_id = file.read_u32()?;
                entry = Some((signature, closure_id));
            }
            // Unknown options are skipped by their declared length.
            _ => file.seek_cur(len as i64)?,
        }
    }

    Ok(entry)
}

fn read_imports(
    machine: &Machine,
    file: &mut BinaryInput,
    num_imports: u32,
) -> Result<Imported, LoadError> {
    let mut imported = Imported {
        ids: Vec::with_capacity(num_imports as usize),
        closures: Vec::with_capacity(num_imports as usize),
    };

    for _ in 0..num_imports {
        let module_name = file.read_len_string()?;
        let symbol_name = file.read_len_string()?;

        let library = machine
            .lookup_library(&module_name)
            .ok_or_else(|| LoadError::ModuleNotFound(module_name.clone()))?;

        let qualified = format!("{}.{}", module_name, symbol_name);
        let export = library
            .lookup_symbol(&qualified)
            .ok_or(LoadError::ProcedureNotFound {
                module: module_name,
                symbol: symbol_name,
            })?;

        imported.ids.push(export.id);
        imported.closures.push(export.closure);
    }

    Ok(imported)
}

fn read_structs(
    file: &mut BinaryInput,
    num_structs: u32,
    library: &LibraryLoading,
) -> Result<(), LoadError> {
    for _ in 0..num_structs {
        let num_fields = file.read_u32()?;
        let mut fields = Vec::with_capacity(num_fields as usize);
        for _ in 0..num_fields {
            fields.push(Width::try_from(file.read_u8()?)?);
        }
        let mut layout = StructLayout::new(fields);
        layout.calculate_layout();
        library.add_struct(layout);
    }
    Ok(())
}

fn read_data(
    file: &mut BinaryInput,
    num_datas: u32,
    library: &LibraryLoading,
    imported: &Imported,
    cap: &GcTracer<'_>,
) -> Result<(), LoadError> {
    let mut total_size = 0usize;

    for _ in 0..num_datas {
        let kind = file.read_u8()?;
        let data = match kind {
            format::DATA_ARRAY => {
                let num_elements = file.read_u16()? as usize;
                let width = Width::try_from(file.read_u8()?)?;
                let elem_bytes = width_to_bytes(width);
                let data = cap.alloc_bytes(elem_bytes * num_elements);
                let mut slot = data;
                for _ in 0..num_elements {
                    read_data_slot(file, slot, library, imported)?;
                    // SAFETY: the cell holds num_elements slots.
                    slot = unsafe { slot.add(elem_bytes) };
                }
                total_size += elem_bytes * num_elements;
                data
            }
            format::DATA_STRUCT => {
                let struct_id = file.read_u32()?;
                let layout = library.struct_at(struct_id)?;
                let data = cap.alloc_bytes(layout.total_size());
                for field in 0..layout.num_fields() {
                    // SAFETY: field offsets are within the struct's size.
                    let slot = unsafe { data.add(layout.field_offset(field)) };
                    read_data_slot(file, slot, library, imported)?;
                }
                total_size += layout.total_size();
                data
            }
            format::DATA_STRING => {
                let num_bytes = file.read_u16()? as usize;
                let Some(string) = FlatString::alloc(cap, num_bytes) else {
                    return Err(LoadError::OutOfMemory("reading data"));
                };
                let mut slot = string.buffer();
                for _ in 0..num_bytes {
                    read_data_slot(file, slot, library, imported)?;
                    // SAFETY: the buffer holds num_bytes bytes.
                    slot = unsafe { slot.add(1) };
                }
                total_size += string.storage_size();
                string.ptr()
            }
            other => return Err(LoadError::BadDataKind(other)),
        };
        library.add_data(data);
    }

    verbose!(
        "loaded {} data entries with a total of {} bytes",
        num_datas,
        total_size
    );
    Ok(())
}

/// Reads one encoded data value into `slot`. The encoding byte's high
/// nibble picks the kind; references are resolved immediately, which is
/// why data-to-data references must point backward.
fn read_data_slot(
    file: &mut BinaryInput,
    slot: *mut u8,
    library: &LibraryLoading,
    imported: &Imported,
) -> Result<(), LoadError> {
    let enc = file.read_u8()?;

    // SAFETY: callers size the destination for the encoding being read.
    unsafe {
        match format::enc_type(enc) {
            format::ENC_NORMAL => match format::enc_bytes(enc) {
                1 => write_normal_u8(slot, file.read_u8()?),
                2 => write_normal_u16(slot, file.read_u16()?),
                4 => write_normal_u32(slot, file.read_u32()?),
                8 => write_normal_u64(slot, file.read_u64()?),
                _ => return Err(LoadError::BadDataEncoding(enc)),
            },
            // Fast and pointer-width values are always 32-bit on disk.
            format::ENC_FAST => write_fast_from_u32(slot, file.read_u32()?),
            format::ENC_WPTR => write_wptr_from_u32(slot, file.read_u32()?),
            format::ENC_DATA => {
                let id = file.read_u32()?;
                let data = library
                    .data(id)
                    .ok_or(LoadError::ForwardDataReference(id))?;
                write_ptr(slot, data);
            }
            format::ENC_IMPORT => {
                let id = file.read_u32()?;
                let closure = imported
                    .closures
                    .get(id as usize)
                    .copied()
                    .ok_or(LoadError::BadId {
                        kind: "import",
                        id,
                    })?;
                write_ptr(slot, closure as *mut u8);
            }
            format::ENC_CLOSURE => {
                let id = file.read_u32()?;
                let closure = library.closure(id)?;
                write_ptr(slot, closure as *mut u8);
            }
            _ => return Err(LoadError::BadDataEncoding(enc)),
        }
    }

    Ok(())
}

fn read_code(
    file: &mut BinaryInput,
    num_procs: u32,
    library: &LibraryLoading,
    imported: &Imported,
    cap: &GcTracer<'_>,
    load_debuginfo: bool,
) -> Result<(), LoadError> {
    // Pass one computes sizes and block offsets so the code buffers can
    // be allocated; pass two rereads the same bytes and writes resolved
    // instructions. All procs are sized before any is written, otherwise
    // calls in earlier procs would not know the addresses of later ones.
    verbose!("reading procs, first pass");
    let rewind_pos = file.tell()?;

    for id in 0..num_procs {
        let shape = read_proc(file, library, imported, num_procs, id, false, load_debuginfo)?
            .expect("first pass returns the proc shape");
        if !library.add_proc(cap, shape.name, shape.code_size, shape.block_offsets) {
            return Err(LoadError::OutOfMemory("allocating proc code"));
        }
    }

    verbose!("beginning second pass");
    file.seek_set(rewind_pos)?;
    for id in 0..num_procs {
        read_proc(file, library, imported, num_procs, id, true, load_debuginfo)?;
    }

    Ok(())
}

fn read_proc(
    file: &mut BinaryInput,
    library: &LibraryLoading,
    imported: &Imported,
    num_procs_total: u32,
    proc_id: u32,
    second_pass: bool,
    load_debuginfo: bool,
) -> Result<Option<ProcShape>, LoadError> {
    let name = file.read_len_string()?;
    let num_blocks = file.read_u32()?;

    let (code, block_offsets) = if second_pass {
        let code = library.proc_code(proc_id)?;
        let offsets = (0..num_blocks)
            .map(|block| library.proc_block_offset(proc_id, block))
            .collect::<Result<Vec<_>, _>>()?;
        (code, offsets)
    } else {
        (std::ptr::null_mut(), Vec::new())
    };

    let mut pass1_offsets = Vec::new();
    let mut proc_offset = 0usize;

    for _ in 0..num_blocks {
        if !second_pass {
            pass1_offsets.push(proc_offset);
        }
        let num_instr_objs = file.read_u32()?;
        for _ in 0..num_instr_objs {
            let tag = file.read_u8()?;
            if tag == format::CODE_INSTR {
                read_instr(
                    file,
                    library,
                    imported,
                    num_procs_total,
                    code,
                    &block_offsets,
                    &mut proc_offset,
                    second_pass,
                )?;
            } else {
                read_meta(
                    file,
                    library,
                    proc_id,
                    proc_offset,
                    tag,
                    second_pass && load_debuginfo,
                )?;
            }
        }
    }

    Ok(if second_pass {
        None
    } else {
        Some(ProcShape {
            name,
            code_size: proc_offset,
            block_offsets: pass1_offsets,
        })
    })
}

#[allow(clippy::too_many_arguments)]
fn read_instr(
    file: &mut BinaryInput,
    library: &LibraryLoading,
    imported: &Imported,
    num_procs_total: u32,
    code: *mut u8,
    block_offsets: &[usize],
    proc_offset: &mut usize,
    second_pass: bool,
) -> Result<(), LoadError> {
    let opcode_byte = file.read_u8()?;
    let opcode = Opcode::try_from(opcode_byte)?;
    if !opcode.in_bytecode() {
        return Err(LoadError::BadOpcode(opcode_byte));
    }

    let mut width1 = None;
    let mut width2 = None;
    if opcode.num_width_bytes() > 0 {
        width1 = Some(Width::try_from(file.read_u8()?)?);
        if opcode.num_width_bytes() > 1 {
            width2 = Some(Width::try_from(file.read_u8()?)?);
        }
    }

    // Reference immediates that need final addresses encode as zero in
    // pass one; offsets and sizes are knowable in both passes.
    let immediate = match opcode.immediate_type() {
        ImmediateType::None => Immediate::None,
        ImmediateType::U8 => Immediate::U8(file.read_u8()?),
        ImmediateType::U16 => Immediate::U16(file.read_u16()?),
        ImmediateType::U32 => Immediate::U32(file.read_u32()?),
        ImmediateType::U64 => Immediate::U64(file.read_u64()?),
        ImmediateType::ClosureRef => {
            let id = file.read_u32()?;
            let closure = library.closure(id)?;
            if second_pass {
                Immediate::Word(closure as usize)
            } else {
                Immediate::Word(0)
            }
        }
        ImmediateType::ProcRef => {
            let id = file.read_u32()?;
            if id >= num_procs_total {
                return Err(LoadError::BadId { kind: "proc", id });
            }
            if second_pass {
                Immediate::Word(library.proc_code(id)? as usize)
            } else {
                Immediate::Word(0)
            }
        }
        ImmediateType::ImportRef => {
            let id = file.read_u32()?;
            let export_id = imported
                .ids
                .get(id as usize)
                .copied()
                .ok_or(LoadError::BadId {
                    kind: "import",
                    id,
                })?;
            Immediate::U16((export_id as usize * WORD_SIZE) as u16)
        }
        ImmediateType::ImportClosureRef => {
            let id = file.read_u32()?;
            let closure = imported
                .closures
                .get(id as usize)
                .copied()
                .ok_or(LoadError::BadId {
                    kind: "import",
                    id,
                })?;
            Immediate::Word(closure as usize)
        }
        ImmediateType::LabelRef => {
            let block = file.read_u32()?;
            if second_pass {
                let offset = block_offsets
                    .get(block as usize)
                    .copied()
                    .ok_or(LoadError::BadId {
                        kind: "block",
                        id: block,
                    })?;
                // SAFETY: block offsets lie within the code buffer.
                Immediate::Word(unsafe { code.add(offset) } as usize)
            } else {
                Immediate::Word(0)
            }
        }
        ImmediateType::StructRef => {
            let id = file.read_u32()?;
            Immediate::Word(library.struct_at(id)?.total_size())
        }
        ImmediateType::StructRefField => {
            let id = file.read_u32()?;
            let field = file.read_u8()?;
            let layout = library.struct_at(id)?;
            if field as usize >= layout.num_fields() {
                return Err(LoadError::BadId {
                    kind: "field",
                    id: field as u32,
                });
            }
            Immediate::U16(layout.field_offset(field as usize) as u16)
        }
    };

    *proc_offset = write_instr(code, *proc_offset, opcode, width1, width2, immediate);
    Ok(())
}

fn read_meta(
    file: &mut BinaryInput,
    library: &LibraryLoading,
    proc_id: u32,
    proc_offset: usize,
    tag: u8,
    store: bool,
) -> Result<(), LoadError> {
    match tag {
        format::CODE_META_CONTEXT => {
            // Context info is only kept when debug loading is on, and only
            // once the proc exists (pass two).
            if store {
                let data_id = file.read_u32()?;
                let data = library.data(data_id).ok_or(LoadError::BadId {
                    kind: "data",
                    id: data_id,
                })?;
                let line = file.read_u32()?;
                library.with_proc_mut(proc_id, |proc| {
                    proc.add_context(proc_offset, FlatString::from_ptr(data), line)
                });
            } else {
                file.seek_cur(8)?;
            }
        }
        format::CODE_META_CONTEXT_SHORT => {
            if store {
                let line = file.read_u32()?;
                library.with_proc_mut(proc_id, |proc| proc.add_context_line(proc_offset, line));
            } else {
                file.seek_cur(4)?;
            }
        }
        format::CODE_META_CONTEXT_NIL => {
            if store {
                library.with_proc_mut(proc_id, |proc| proc.clear_context(proc_offset));
            }
        }
        other => return Err(LoadError::BadCodeTag(other)),
    }
    Ok(())
}

fn read_closures(
    file: &mut BinaryInput,
    num_closures: u32,
    library: &LibraryLoading,
) -> Result<(), LoadError> {
    for id in 0..num_closures {
        let proc_id = file.read_u32()?;
        let code = library.proc_code(proc_id)?;
        let data_id = file.read_u32()?;
        let data = library.data(data_id).ok_or(LoadError::BadId {
            kind: "data",
            id: data_id,
        })?;
        // SAFETY: closure cells were pre-allocated with the aggregate.
        unsafe { init_closure(library.closure(id)?, code, data) };
    }
    Ok(())
}

fn read_exports(
    file: &mut BinaryInput,
    num_exports: u32,
    library: &LibraryLoading,
) -> Result<(), LoadError> {
    for _ in 0..num_exports {
        let name = file.read_len_string()?;
        let closure_id = file.read_u32()?;
        let closure = library.closure(closure_id)?;
        library.add_symbol(name, closure);
    }
    Ok(())
}
