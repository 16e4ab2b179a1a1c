//! Libraries: a loaded module's structs, data, procs, closures and
//! exports.
//!
//! During loading the aggregate is a [`LibraryLoading`], interior-mutable
//! so the loader can append to it while the GC capability chain traces it
//! as a root set. Once every section is read it freezes into a [`Library`],
//! owned by the registry, which traces it for the rest of the process.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::closure::{alloc_closure, Closure};
use crate::code::Proc;
use crate::data::StructLayout;
use crate::errors::LoadError;
use crate::heap::capability::{GcCapability, NoGcScope, TraceRoots};
use crate::heap::MarkState;

/// How the entry closure expects to be invoked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntrySignature {
    /// No arguments.
    Plain = 0,
    /// Argument count and argument vector.
    Args = 1,
}

impl TryFrom<u8> for EntrySignature {
    type Error = LoadError;

    fn try_from(value: u8) -> Result<EntrySignature, LoadError> {
        match value {
            0 => Ok(EntrySignature::Plain),
            1 => Ok(EntrySignature::Args),
            other => Err(LoadError::BadEntrySignature(other)),
        }
    }
}

/// An exported closure: its dense export id and the closure cell.
#[derive(Clone, Copy, Debug)]
pub struct Export {
    pub id: u32,
    pub closure: *mut Closure,
}

/// A library being read. Closure cells are pre-allocated up front so that
/// data entries and instructions can refer to closures that have not been
/// defined yet.
pub struct LibraryLoading {
    structs: RefCell<Vec<StructLayout>>,
    datas: RefCell<Vec<*mut u8>>,
    procs: RefCell<Vec<Proc>>,
    closures: RefCell<Vec<*mut Closure>>,
    exports: RefCell<HashMap<String, Export>>,
    num_exports: Cell<u32>,
}

impl LibraryLoading {
    /// Builds the aggregate and pre-allocates every closure cell. Must run
    /// inside a no-GC scope; the caller checks the scope for OOM.
    pub fn new(
        num_structs: u32,
        num_datas: u32,
        num_procs: u32,
        num_closures: u32,
        no_gc: &NoGcScope<'_>,
    ) -> LibraryLoading {
        let mut closures = Vec::with_capacity(num_closures as usize);
        for _ in 0..num_closures {
            match alloc_closure(no_gc) {
                Some(cell) => closures.push(cell),
                // OOM is latched on the scope; the caller aborts.
                None => break,
            }
        }
        LibraryLoading {
            structs: RefCell::new(Vec::with_capacity(num_structs as usize)),
            datas: RefCell::new(Vec::with_capacity(num_datas as usize)),
            procs: RefCell::new(Vec::with_capacity(num_procs as usize)),
            closures: RefCell::new(closures),
            exports: RefCell::new(HashMap::new()),
            num_exports: Cell::new(0),
        }
    }

    pub fn add_struct(&self, layout: StructLayout) {
        self.structs.borrow_mut().push(layout);
    }

    pub fn struct_at(&self, id: u32) -> Result<StructLayout, LoadError> {
        self.structs
            .borrow()
            .get(id as usize)
            .cloned()
            .ok_or(LoadError::BadId {
                kind: "struct",
                id,
            })
    }

    pub fn num_structs(&self) -> usize {
        self.structs.borrow().len()
    }

    pub fn add_data(&self, data: *mut u8) {
        self.datas.borrow_mut().push(data);
    }

    /// The data entry with the given id, or `None` if it has not been read
    /// yet (data references must be backward).
    pub fn data(&self, id: u32) -> Option<*mut u8> {
        self.datas.borrow().get(id as usize).copied()
    }

    pub fn num_datas(&self) -> usize {
        self.datas.borrow().len()
    }

    /// Allocates the code buffer for a proc measured during pass one and
    /// records the proc. Returns false on allocation failure in a no-GC
    /// scope.
    pub fn add_proc<C: GcCapability>(
        &self,
        cap: &C,
        name: String,
        code_size: usize,
        block_offsets: Vec<usize>,
    ) -> bool {
        let code = cap.alloc_bytes(code_size);
        if code.is_null() {
            return false;
        }
        self.procs
            .borrow_mut()
            .push(Proc::new(name, code, code_size, block_offsets));
        true
    }

    pub fn proc_code(&self, id: u32) -> Result<*mut u8, LoadError> {
        self.procs
            .borrow()
            .get(id as usize)
            .map(|proc| proc.code())
            .ok_or(LoadError::BadId { kind: "proc", id })
    }

    pub fn proc_block_offset(&self, id: u32, block: u32) -> Result<usize, LoadError> {
        let procs = self.procs.borrow();
        let proc = procs
            .get(id as usize)
            .ok_or(LoadError::BadId { kind: "proc", id })?;
        if (block as usize) < proc.num_blocks() {
            Ok(proc.block_offset(block as usize))
        } else {
            Err(LoadError::BadId {
                kind: "block",
                id: block,
            })
        }
    }

    pub fn num_procs(&self) -> usize {
        self.procs.borrow().len()
    }

    /// Runs `f` on a proc, for attaching debug contexts during pass two.
    pub fn with_proc_mut<R>(&self, id: u32, f: impl FnOnce(&mut Proc) -> R) -> Option<R> {
        self.procs.borrow_mut().get_mut(id as usize).map(f)
    }

    pub fn closure(&self, id: u32) -> Result<*mut Closure, LoadError> {
        self.closures
            .borrow()
            .get(id as usize)
            .copied()
            .ok_or(LoadError::BadId {
                kind: "closure",
                id,
            })
    }

    pub fn num_closures(&self) -> usize {
        self.closures.borrow().len()
    }

    /// Records an export. Export ids are dense, in insertion order.
    pub fn add_symbol(&self, name: String, closure: *mut Closure) {
        let id = self.num_exports.get();
        self.num_exports.set(id + 1);
        self.exports.borrow_mut().insert(name, Export { id, closure });
    }
}

impl TraceRoots for LibraryLoading {
    fn trace_roots(&self, state: &mut MarkState<'_>) {
        for data in self.datas.borrow().iter() {
            state.mark_root(*data as usize);
        }
        for closure in self.closures.borrow().iter() {
            state.mark_root(*closure as usize);
        }
        for proc in self.procs.borrow().iter() {
            state.mark_root(proc.code() as usize);
        }
    }
}

/// A fully loaded library.
pub struct Library {
    names: Vec<String>,
    structs: Vec<StructLayout>,
    datas: Vec<*mut u8>,
    procs: Vec<Proc>,
    closures: Vec<*mut Closure>,
    exports: HashMap<String, Export>,
    entry: Option<(EntrySignature, *mut Closure)>,
}

impl Library {
    /// Freezes a loading aggregate. Runs inside a no-GC scope: between
    /// here and registration with the machine nothing else roots the
    /// library's cells.
    pub(crate) fn from_loading(names: Vec<String>, loading: LibraryLoading) -> Library {
        Library {
            names,
            structs: loading.structs.into_inner(),
            datas: loading.datas.into_inner(),
            procs: loading.procs.into_inner(),
            closures: loading.closures.into_inner(),
            exports: loading.exports.into_inner(),
            entry: None,
        }
    }

    /// The module names this library answers to.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Looks up a fully-qualified exported symbol.
    pub fn lookup_symbol(&self, name: &str) -> Option<Export> {
        self.exports.get(name).copied()
    }

    pub fn set_entry_closure(&mut self, signature: EntrySignature, closure: *mut Closure) {
        self.entry = Some((signature, closure));
    }

    pub fn entry_closure(&self) -> Option<(EntrySignature, *mut Closure)> {
        self.entry
    }

    pub fn structs(&self) -> &[StructLayout] {
        &self.structs
    }

    pub fn data(&self, id: u32) -> Option<*mut u8> {
        self.datas.get(id as usize).copied()
    }

    pub fn num_datas(&self) -> usize {
        self.datas.len()
    }

    pub fn proc(&self, id: u32) -> Option<&Proc> {
        self.procs.get(id as usize)
    }

    pub fn procs(&self) -> &[Proc] {
        &self.procs
    }

    pub fn closure(&self, id: u32) -> Option<*mut Closure> {
        self.closures.get(id as usize).copied()
    }

    pub fn num_closures(&self) -> usize {
        self.closures.len()
    }

    pub fn exports(&self) -> &HashMap<String, Export> {
        &self.exports
    }
}

impl TraceRoots for Library {
    fn trace_roots(&self, state: &mut MarkState<'_>) {
        for data in &self.datas {
            state.mark_root(*data as usize);
        }
        for closure in &self.closures {
            state.mark_root(*closure as usize);
        }
        for proc in &self.procs {
            state.mark_root(proc.code() as usize);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::capability::testing::TestRoot;
    use crate::heap::capability::GcTracer;
    use crate::heap::{Heap, HeapOptions};

    #[test]
    fn entry_signature_decoding() {
        assert_eq!(EntrySignature::try_from(0).unwrap(), EntrySignature::Plain);
        assert_eq!(EntrySignature::try_from(1).unwrap(), EntrySignature::Args);
        assert!(EntrySignature::try_from(2).is_err());
    }

    #[test]
    fn closures_are_preallocated() {
        let heap = Heap::new(HeapOptions::default());
        let root = TestRoot { heap: &heap };
        let tracer = GcTracer::new(&root);
        let no_gc = NoGcScope::new(&tracer);

        let loading = LibraryLoading::new(0, 0, 0, 3, &no_gc);
        no_gc.abort_if_oom("testing");

        assert_eq!(loading.num_closures(), 3);
        let a = loading.closure(0).unwrap();
        let b = loading.closure(2).unwrap();
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert!(loading.closure(3).is_err());
    }

    #[test]
    fn export_ids_are_dense_and_ordered() {
        let heap = Heap::new(HeapOptions::default());
        let root = TestRoot { heap: &heap };
        let tracer = GcTracer::new(&root);
        let no_gc = NoGcScope::new(&tracer);
        let loading = LibraryLoading::new(0, 0, 0, 2, &no_gc);
        no_gc.abort_if_oom("testing");

        let first = loading.closure(0).unwrap();
        let second = loading.closure(1).unwrap();
        loading.add_symbol("m.first".to_string(), first);
        loading.add_symbol("m.second".to_string(), second);

        let library = Library::from_loading(vec!["m".to_string()], loading);
        assert_eq!(library.lookup_symbol("m.first").unwrap().id, 0);
        assert_eq!(library.lookup_symbol("m.second").unwrap().id, 1);
        assert!(library.lookup_symbol("m.third").is_none());
    }

    #[test]
    fn forward_data_lookup_is_none() {
        let heap = Heap::new(HeapOptions::default());
        let root = TestRoot { heap: &heap };
        let tracer = GcTracer::new(&root);
        let no_gc = NoGcScope::new(&tracer);
        let loading = LibraryLoading::new(0, 2, 0, 0, &no_gc);
        no_gc.abort_if_oom("testing");

        assert!(loading.data(0).is_none());
        loading.add_data(0x1000 as *mut u8);
        assert!(loading.data(0).is_some());
        assert!(loading.data(1).is_none());
    }
}
