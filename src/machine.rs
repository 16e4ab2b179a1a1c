//! The machine: the heap plus the process-wide module registry.
//!
//! Imports resolve against the registry at load time; there is no dynamic
//! lookup. The registry owns libraries strongly and is the heap's global
//! root tracer: everything a loaded module can reach is reachable from
//! here plus the active capability chain.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::heap::capability::{abort_oom, CapabilityMode, GcCapability, TraceRoots};
use crate::heap::{Heap, HeapOptions, MarkState};
use crate::library::Library;

pub struct Machine {
    heap: Heap,
    modules: RefCell<HashMap<String, Rc<Library>>>,
    entry_module: RefCell<Option<Rc<Library>>>,
}

impl Machine {
    /// Brings up the heap and an empty registry.
    pub fn init(options: HeapOptions) -> Machine {
        Machine {
            heap: Heap::new(options),
            modules: RefCell::new(HashMap::new()),
            entry_module: RefCell::new(None),
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The process-lifetime root capability.
    pub fn root(&self) -> MachineRoot<'_> {
        MachineRoot { machine: self }
    }

    /// Registers a library under a module name.
    pub fn add_module(&self, name: &str, library: Rc<Library>) {
        self.modules.borrow_mut().insert(name.to_string(), library);
    }

    pub fn lookup_library(&self, name: &str) -> Option<Rc<Library>> {
        self.modules.borrow().get(name).cloned()
    }

    /// Records which module's entry closure is the program's entry.
    pub fn add_entry_module(&self, library: Rc<Library>) {
        *self.entry_module.borrow_mut() = Some(library);
    }

    pub fn entry_module(&self) -> Option<Rc<Library>> {
        self.entry_module.borrow().clone()
    }

    /// Tears the machine down: releases the libraries, then the heap's
    /// chunks.
    pub fn finalise(self) {
        self.entry_module.borrow_mut().take();
        self.modules.borrow_mut().clear();
        self.heap.finalise();
    }
}

impl TraceRoots for Machine {
    fn trace_roots(&self, state: &mut MarkState<'_>) {
        for library in self.modules.borrow().values() {
            library.trace_roots(state);
        }
        if let Some(library) = self.entry_module.borrow().as_ref() {
            library.trace_roots(state);
        }
    }
}

/// The root of every capability chain: process lifetime, cannot itself
/// trace the mutator, and reaches the registry's roots for everyone
/// chained above it.
pub struct MachineRoot<'m> {
    machine: &'m Machine,
}

impl GcCapability for MachineRoot<'_> {
    fn heap(&self) -> &Heap {
        &self.machine.heap
    }

    fn mode(&self) -> CapabilityMode {
        CapabilityMode::Root
    }

    fn can_gc(&self) -> bool {
        false
    }

    fn trace_for_gc(&self, state: &mut MarkState<'_>) {
        self.machine.trace_roots(state);
    }

    fn oom(&self, size_bytes: usize) {
        abort_oom(size_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::capability::{GcTracer, NoGcScope};
    use crate::library::LibraryLoading;

    #[test]
    fn module_registration_and_lookup() {
        let machine = Machine::init(HeapOptions::default());
        {
            let root = machine.root();
            let tracer = GcTracer::new(&root);
            let no_gc = NoGcScope::new(&tracer);
            let loading = LibraryLoading::new(0, 0, 0, 0, &no_gc);
            no_gc.abort_if_oom("testing");

            let library = Rc::new(Library::from_loading(vec!["m".to_string()], loading));
            machine.add_module("m", Rc::clone(&library));

            assert!(machine.lookup_library("m").is_some());
            assert!(machine.lookup_library("other").is_none());

            machine.add_entry_module(library);
            assert!(machine.entry_module().is_some());
        }
        machine.finalise();
    }

    #[test]
    fn registered_libraries_survive_collection() {
        let machine = Machine::init(HeapOptions {
            gc_slow_asserts: true,
            ..HeapOptions::default()
        });
        let root = machine.root();
        let tracer = GcTracer::new(&root);

        // A library holding one data cell and one closure cell.
        let library = {
            let no_gc = NoGcScope::new(&tracer);
            let loading = LibraryLoading::new(0, 1, 0, 1, &no_gc);
            no_gc.abort_if_oom("testing");
            let data = tracer.alloc_bytes(16);
            assert!(!data.is_null());
            loading.add_data(data);
            Rc::new(Library::from_loading(vec!["m".to_string()], loading))
        };
        let data = library.data(0).unwrap();
        let closure = library.closure(0).unwrap();
        machine.add_module("m", library);

        machine.heap().collect(&tracer);
        machine.heap().check_consistency();

        // Neither registered cell may be handed out again.
        for _ in 0..500 {
            let cell = tracer.alloc_bytes(16);
            assert_ne!(cell, data);
            assert_ne!(cell as usize, closure as usize);
        }
    }
}
