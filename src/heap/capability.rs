//! GC capabilities: scoped objects deciding whether collection may run.
//!
//! Capabilities form a chain following lexical scope. The chain bottoms out
//! at the machine's root capability (process lifetime, cannot trace the
//! mutator). A [`GcTracer`] scope permits collection and carries the root
//! slots registered within it; a [`NoGcScope`] forbids collection, latches
//! any allocation failure, and insists on being checked before it is
//! dropped.
//!
//! Every heap allocation is performed through a capability. A `GcTracer`
//! guarantees that all its live interior pointers are registered as roots
//! before a collection runs on its behalf.

use std::cell::{Cell, RefCell};
use std::process;

use crate::error;
use crate::heap::{words_for_bytes, Heap, MarkState};

/// The three rooting modes a capability can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityMode {
    /// The process-lifetime sentinel. Cannot itself trace the mutator, so
    /// collection is impossible when only the root exists.
    Root,
    /// Collection may run; the scope traces its registered roots.
    CanGc,
    /// Collection is suppressed; allocation failures are latched.
    CannotGc,
}

/// Anything that can emit root words into the mark state.
pub trait TraceRoots {
    fn trace_roots(&self, state: &mut MarkState<'_>);
}

/// A scoped rooting context. See the module docs.
pub trait GcCapability {
    fn heap(&self) -> &Heap;

    fn mode(&self) -> CapabilityMode;

    /// True if a collection triggered through this capability is allowed:
    /// every frame between here and the root sentinel permits it.
    fn can_gc(&self) -> bool;

    /// Emits this frame's roots, then the rest of the chain, ending with
    /// the global root tracer held by the root frame.
    fn trace_for_gc(&self, state: &mut MarkState<'_>);

    /// Reports an allocation failure of `size_bytes` bytes.
    fn oom(&self, size_bytes: usize);

    /// Allocates `size_in_words` words through this capability.
    fn alloc(&self, size_in_words: usize) -> *mut u8
    where
        Self: Sized,
    {
        self.heap().alloc_words(size_in_words, self)
    }

    /// Allocates `size_in_bytes` bytes, rounded up to whole words.
    fn alloc_bytes(&self, size_in_bytes: usize) -> *mut u8
    where
        Self: Sized,
    {
        self.alloc(words_for_bytes(size_in_bytes))
    }
}

/// Walks the chain above a frame that itself permits collection.
pub(crate) fn chain_can_gc(parent: &dyn GcCapability) -> bool {
    match parent.mode() {
        CapabilityMode::Root => true,
        CapabilityMode::CannotGc => false,
        CapabilityMode::CanGc => parent.can_gc(),
    }
}

pub(crate) fn abort_oom(size_bytes: usize) -> ! {
    error!("out of memory, tried to allocate {} bytes", size_bytes);
    process::abort();
}

/// A `CanGC` scope holding a dynamic list of root slots.
///
/// A root slot is the address of a place holding a (possibly tagged) heap
/// pointer; the place must outlive its registration. Removal is LIFO: only
/// the most recently added root may be removed.
pub struct GcTracer<'p> {
    parent: &'p dyn GcCapability,
    roots: RefCell<Vec<*const usize>>,
    /// An additional set of roots traced with this scope, e.g. the
    /// library aggregate a loader is filling in.
    extra: Option<&'p dyn TraceRoots>,
}

impl<'p> GcTracer<'p> {
    pub fn new(parent: &'p dyn GcCapability) -> GcTracer<'p> {
        GcTracer {
            parent,
            roots: RefCell::new(Vec::new()),
            extra: None,
        }
    }

    pub fn with_extra(parent: &'p dyn GcCapability, extra: &'p dyn TraceRoots) -> GcTracer<'p> {
        GcTracer {
            parent,
            roots: RefCell::new(Vec::new()),
            extra: Some(extra),
        }
    }

    /// Registers the place `slot` as a root.
    pub fn add_root<T>(&self, slot: &*mut T) {
        self.roots
            .borrow_mut()
            .push(slot as *const *mut T as *const usize);
    }

    /// Unregisters the most recently added root, which must be `slot`.
    pub fn remove_root<T>(&self, slot: &*mut T) {
        let mut roots = self.roots.borrow_mut();
        let last = roots.pop().expect("remove_root on an empty root list");
        assert_eq!(
            last, slot as *const *mut T as *const usize,
            "roots must be removed in LIFO order"
        );
    }
}

impl GcCapability for GcTracer<'_> {
    fn heap(&self) -> &Heap {
        self.parent.heap()
    }

    fn mode(&self) -> CapabilityMode {
        CapabilityMode::CanGc
    }

    fn can_gc(&self) -> bool {
        chain_can_gc(self.parent)
    }

    fn trace_for_gc(&self, state: &mut MarkState<'_>) {
        if let Some(extra) = self.extra {
            extra.trace_roots(state);
        }
        for slot in self.roots.borrow().iter() {
            // SAFETY: registered slots outlive their registration, per the
            // add_root contract.
            state.mark_root(unsafe { **slot });
        }
        self.parent.trace_for_gc(state);
    }

    fn oom(&self, size_bytes: usize) {
        abort_oom(size_bytes);
    }
}

/// A `CannotGC` scope: collection is suppressed for its lifetime.
///
/// An allocation failure inside the scope is latched rather than acted on.
/// The scope must be checked (`abort_if_oom` or `is_oom`) before it is
/// dropped; in development builds an unchecked scope aborts the process,
/// and a dropped scope with a latched failure always aborts.
pub struct NoGcScope<'p> {
    parent: &'p dyn GcCapability,
    oom_bytes: Cell<Option<usize>>,
    #[cfg(debug_assertions)]
    needs_check: Cell<bool>,
}

impl<'p> NoGcScope<'p> {
    pub fn new(parent: &'p dyn GcCapability) -> NoGcScope<'p> {
        NoGcScope {
            parent,
            oom_bytes: Cell::new(None),
            #[cfg(debug_assertions)]
            needs_check: Cell::new(true),
        }
    }

    fn mark_checked(&self) {
        #[cfg(debug_assertions)]
        self.needs_check.set(false);
    }

    /// True if an allocation failed inside this scope.
    pub fn is_oom(&self) -> bool {
        self.mark_checked();
        self.oom_bytes.get().is_some()
    }

    /// Aborts with a diagnostic naming `label` if an allocation failed
    /// inside this scope.
    pub fn abort_if_oom(&self, label: &str) {
        self.mark_checked();
        if let Some(bytes) = self.oom_bytes.get() {
            error!(
                "out of memory while {}, tried to allocate {} bytes",
                label, bytes
            );
            process::abort();
        }
    }
}

impl GcCapability for NoGcScope<'_> {
    fn heap(&self) -> &Heap {
        self.parent.heap()
    }

    fn mode(&self) -> CapabilityMode {
        CapabilityMode::CannotGc
    }

    fn can_gc(&self) -> bool {
        false
    }

    fn trace_for_gc(&self, state: &mut MarkState<'_>) {
        self.parent.trace_for_gc(state);
    }

    fn oom(&self, size_bytes: usize) {
        if self.oom_bytes.get().is_none() {
            self.oom_bytes.set(Some(size_bytes));
        }
    }
}

impl Drop for NoGcScope<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        if self.needs_check.get() {
            error!("a no-GC scope was not checked before it was dropped");
            process::abort();
        }
        if let Some(bytes) = self.oom_bytes.get() {
            abort_oom(bytes);
        }
    }
}
