//! The conservative mark-sweep heap.
//!
//! Non-moving and conservative: any word reachable from the roots whose
//! tag-masked value is the base address of an allocated cell keeps that
//! cell alive, and the cell's own words are scanned the same way. Small
//! cells come from size-class blocks, large cells from fit chunks; see
//! [`layout`] for the geometry.
//!
//! Collection runs only at allocation points, and only when the requesting
//! capability chain permits it (see [`capability`]). On allocation failure
//! with GC permitted, one collection is attempted before the OOM policy
//! runs; with GC forbidden, the failure is latched on the scope and a null
//! pointer is returned.

pub mod capability;
pub mod layout;

use std::cell::RefCell;
use std::ptr;

use crate::heap::capability::GcCapability;
use crate::heap::layout::{
    BopChunk, FitChunk, BLOCK_SIZE, CHUNK_SIZE, FLAG_ALLOCATED, FLAG_MARKED, FLAG_VALID,
    MAX_BLOCK_CELL_WORDS, POISON_BYTE, TAG_MASK, WORD_SIZE,
};
use crate::verbose;

/// Default ceiling on mapped heap memory.
const DEFAULT_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Rounds a byte count up to whole words; zero-byte requests still occupy
/// one word so every allocation has a distinct address.
pub fn words_for_bytes(size_in_bytes: usize) -> usize {
    size_in_bytes.div_ceil(WORD_SIZE).max(1)
}

/// Debug modes, settable from the command line in development builds.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapOptions {
    /// Collect before every allocation.
    pub gc_zealous: bool,
    /// Log mark/sweep statistics.
    pub gc_trace: bool,
    /// Fill swept cells with 0x77.
    pub gc_poison: bool,
    /// Run the heap consistency check around every collection.
    pub gc_slow_asserts: bool,
}

struct HeapInner {
    bop: Vec<BopChunk>,
    fit: Vec<FitChunk>,
    /// Blocks currently serving each size class, indexed by cell words.
    class_blocks: Vec<Vec<layout::BlockRef>>,
    max_size: usize,
    collections: u64,
    page_size: usize,
}

impl HeapInner {
    fn mapped_size(&self) -> usize {
        (self.bop.len() + self.fit.len()) * CHUNK_SIZE
    }
}

/// The heap. Interior-mutable so that capability scopes can share it while
/// the mutator allocates; the process is single-threaded.
pub struct Heap {
    inner: RefCell<HeapInner>,
    options: HeapOptions,
}

impl Heap {
    pub fn new(options: HeapOptions) -> Heap {
        let page_size = layout::page_size();
        assert!(
            WORD_SIZE == 4 || WORD_SIZE == 8,
            "unsupported machine word size"
        );
        assert!(
            BLOCK_SIZE % page_size == 0 || page_size % BLOCK_SIZE == 0,
            "block size and page size must tile each other"
        );
        Heap {
            inner: RefCell::new(HeapInner {
                bop: Vec::new(),
                fit: Vec::new(),
                class_blocks: (0..=MAX_BLOCK_CELL_WORDS).map(|_| Vec::new()).collect(),
                max_size: DEFAULT_MAX_SIZE,
                collections: 0,
                page_size,
            }),
            options,
        }
    }

    /// Allocates `size_in_words` words on behalf of `cap`.
    pub(crate) fn alloc_words(&self, size_in_words: usize, cap: &dyn GcCapability) -> *mut u8 {
        debug_assert!(size_in_words > 0);

        if self.options.gc_zealous && cap.can_gc() && self.size() > 0 {
            // Force a collect before each allocation in this mode.
            self.collect(cap);
        }

        let cell = self.try_allocate(size_in_words);
        if !cell.is_null() {
            return cell;
        }

        if !cap.can_gc() {
            cap.oom(size_in_words * WORD_SIZE);
            return ptr::null_mut();
        }

        self.collect(cap);
        let cell = self.try_allocate(size_in_words);
        if cell.is_null() {
            cap.oom(size_in_words * WORD_SIZE);
            return ptr::null_mut();
        }
        cell
    }

    fn try_allocate(&self, size_in_words: usize) -> *mut u8 {
        let mut inner = self.inner.borrow_mut();

        if size_in_words <= MAX_BLOCK_CELL_WORDS {
            let class = size_in_words;

            for block in &inner.class_blocks[class] {
                if let Some(cell) = block.pop_free() {
                    return cell;
                }
            }

            // No free cell in this class: claim an empty block.
            for ci in 0..inner.bop.len() {
                if let Some(block) = inner.bop[ci].take_empty_block() {
                    block.init(class);
                    let cell = block.pop_free().expect("freshly initialised block");
                    inner.class_blocks[class].push(block);
                    return cell;
                }
            }

            // All chunks are full: map another if the ceiling allows.
            if inner.mapped_size() + CHUNK_SIZE <= inner.max_size {
                if let Some(mut chunk) = BopChunk::new() {
                    let block = chunk.take_empty_block().expect("fresh chunk");
                    block.init(class);
                    let cell = block.pop_free().expect("freshly initialised block");
                    inner.bop.push(chunk);
                    inner.class_blocks[class].push(block);
                    return cell;
                }
            }
            ptr::null_mut()
        } else {
            // A fit cell and its size word must fit inside one chunk.
            if (size_in_words + 1) * WORD_SIZE > CHUNK_SIZE {
                return ptr::null_mut();
            }

            for chunk in inner.fit.iter_mut() {
                if let Some(cell) = chunk.alloc(size_in_words) {
                    return cell;
                }
            }

            if inner.mapped_size() + CHUNK_SIZE <= inner.max_size {
                if let Some(mut chunk) = FitChunk::new() {
                    let cell = chunk.alloc(size_in_words).expect("fresh fit chunk");
                    inner.fit.push(chunk);
                    return cell;
                }
            }
            ptr::null_mut()
        }
    }

    /// Runs a full mark-sweep collection with roots from `cap`'s chain
    /// (which ends at the global root tracer).
    pub fn collect(&self, cap: &dyn GcCapability) {
        let mut inner = self.inner.borrow_mut();
        inner.collections += 1;
        let collection = inner.collections;

        if self.options.gc_slow_asserts {
            check_heap(&inner);
        }

        let (roots_marked, cells_marked) = {
            let mut state = MarkState {
                inner: &mut *inner,
                stack: Vec::new(),
                num_roots_marked: 0,
                num_marked: 0,
            };
            cap.trace_for_gc(&mut state);
            state.drain();
            (state.num_roots_marked, state.num_marked)
        };

        if self.options.gc_trace {
            verbose!(
                "gc {}: marked {} cells from {} roots",
                collection,
                cells_marked,
                roots_marked
            );
        }

        sweep(&mut inner, &self.options);

        if self.options.gc_slow_asserts {
            check_heap(&inner);
        }
    }

    /// Bytes of memory currently mapped for the heap.
    pub fn size(&self) -> usize {
        self.inner.borrow().mapped_size()
    }

    pub fn max_size(&self) -> usize {
        self.inner.borrow().max_size
    }

    /// Sets the heap ceiling. Rejects sizes below the page size, sizes not
    /// aligned to the block size, and sizes below what is already mapped.
    pub fn set_max_size(&self, new_size: usize) -> bool {
        let mut inner = self.inner.borrow_mut();
        if new_size < inner.page_size
            || new_size % BLOCK_SIZE != 0
            || new_size < inner.mapped_size()
        {
            return false;
        }
        if self.options.gc_trace {
            verbose!("new heap size: {}", new_size);
        }
        inner.max_size = new_size;
        true
    }

    /// Number of collections run so far.
    pub fn collections(&self) -> u64 {
        self.inner.borrow().collections
    }

    /// Releases every chunk back to the operating system.
    pub fn finalise(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.bop.clear();
        inner.fit.clear();
        for class in inner.class_blocks.iter_mut() {
            class.clear();
        }
    }

    /// Runs the heap consistency check. Exposed for tests; ordinarily run
    /// via the `gc_slow_asserts` mode.
    pub fn check_consistency(&self) {
        check_heap(&self.inner.borrow());
    }
}

/// Mark-phase state: the mark stack plus statistics. Root tracers push
/// candidate words through [`MarkState::mark_root`].
pub struct MarkState<'a> {
    inner: &'a mut HeapInner,
    /// Marked cells whose contents still need scanning: (base, words).
    stack: Vec<(*mut u8, usize)>,
    num_roots_marked: usize,
    num_marked: usize,
}

impl MarkState<'_> {
    /// Offers a candidate root word to the collector.
    pub fn mark_root(&mut self, word: usize) {
        if self.mark_candidate(word) {
            self.num_roots_marked += 1;
        }
    }

    /// Masks the tag bits off `word` and, if the result is the address of
    /// an allocated, unmarked cell, marks it and queues it for scanning.
    fn mark_candidate(&mut self, word: usize) -> bool {
        let addr = word & !TAG_MASK;
        if addr == 0 {
            return false;
        }

        for chunk in self.inner.bop.iter() {
            if !chunk.contains(addr) {
                continue;
            }
            let block = chunk.block_of(addr);
            if !block.in_use() {
                return false;
            }
            let Some(index) = block.cell_index(addr) else {
                return false;
            };
            let flags = block.flags(index);
            if flags & FLAG_ALLOCATED == 0 || flags & FLAG_MARKED != 0 {
                return false;
            }
            block.or_flags(index, FLAG_MARKED);
            self.num_marked += 1;
            self.stack.push((block.cell_ptr(index), block.cell_size_words()));
            return true;
        }

        for chunk in self.inner.fit.iter_mut() {
            if !chunk.contains(addr) {
                continue;
            }
            let index = chunk.word_index(addr);
            let flags = chunk.flags(index);
            if flags & (FLAG_VALID | FLAG_ALLOCATED) != (FLAG_VALID | FLAG_ALLOCATED)
                || flags & FLAG_MARKED != 0
            {
                return false;
            }
            let size = chunk.cell_size(index);
            chunk.or_flags(index, FLAG_MARKED);
            self.num_marked += 1;
            self.stack.push((chunk.word_ptr(index) as *mut u8, size));
            return true;
        }

        false
    }

    /// Drains the mark stack, conservatively scanning every word of each
    /// marked cell. Bounded by the number of live cells, not by recursion
    /// depth.
    fn drain(&mut self) {
        while let Some((cell, size_words)) = self.stack.pop() {
            for i in 0..size_words {
                // SAFETY: the cell spans size_words words.
                let word = unsafe { *(cell as *const usize).add(i) };
                self.mark_candidate(word);
            }
        }
    }
}

fn sweep(inner: &mut HeapInner, options: &HeapOptions) {
    let HeapInner {
        ref mut bop,
        ref mut fit,
        ref mut class_blocks,
        ..
    } = *inner;

    for class in class_blocks.iter_mut() {
        class.clear();
    }

    let mut num_swept = 0usize;
    let mut num_checked = 0usize;

    for chunk in bop.iter_mut() {
        let touched = chunk.touched();
        for bi in 0..touched {
            let block = chunk.block(bi);
            if !block.in_use() {
                continue;
            }

            // The free list is rebuilt from scratch each sweep.
            block.reset_free_list();
            let cell_bytes = block.cell_size_bytes();
            let mut alive = 0usize;

            for i in 0..block.num_cells() {
                num_checked += 1;
                let flags = block.flags(i);
                if flags & FLAG_ALLOCATED != 0 {
                    if flags & FLAG_MARKED != 0 {
                        block.clear_flags(i, FLAG_MARKED);
                        alive += 1;
                        continue;
                    }
                    block.clear_flags(i, FLAG_ALLOCATED);
                    if options.gc_poison {
                        // SAFETY: the cell is cell_bytes long.
                        unsafe { ptr::write_bytes(block.cell_ptr(i), POISON_BYTE, cell_bytes) };
                    }
                    num_swept += 1;
                }
                block.push_free(block.cell_ptr(i));
            }

            if alive == 0 {
                block.release();
                chunk.return_empty_block(bi);
            } else {
                class_blocks[block.cell_size_words()].push(block);
            }
        }
    }

    for chunk in fit.iter_mut() {
        chunk.set_free_head(ptr::null_mut());
        let mut index = 1usize;
        let mut first_in_run: Option<usize> = None;

        while index < chunk.wilderness() {
            let size = chunk.cell_size(index);
            debug_assert!(size > 0);
            debug_assert!(chunk.flags(index) & FLAG_VALID != 0);
            num_checked += 1;

            if chunk.flags(index) & FLAG_MARKED == 0 {
                if options.gc_poison {
                    // SAFETY: the cell payload spans size words.
                    unsafe {
                        ptr::write_bytes(
                            chunk.word_ptr(index) as *mut u8,
                            POISON_BYTE,
                            size * WORD_SIZE,
                        )
                    };
                }
                if first_in_run.is_none() {
                    // Head of a free run: thread it onto the free list.
                    let head = chunk.word_ptr(index);
                    // SAFETY: the link lives in the cell's first word.
                    unsafe { *head = chunk.free_head() as usize };
                    chunk.set_free_head(head);
                    chunk.clear_flags(index, FLAG_ALLOCATED | FLAG_MARKED);
                    first_in_run = Some(index);
                } else {
                    // Merged into the run head; this cell ceases to exist.
                    chunk.set_flags(index, 0);
                    if options.gc_poison {
                        chunk.set_cell_size(index, 0x7777_7777);
                    }
                }
                num_swept += 1;
            } else {
                chunk.clear_flags(index, FLAG_MARKED);
                if let Some(run) = first_in_run.take() {
                    chunk.set_cell_size(run, index - 1 - run);
                }
            }

            index += size + 1;
        }

        if let Some(run) = first_in_run {
            chunk.set_cell_size(run, chunk.wilderness() - run);
        }
    }

    if options.gc_trace {
        verbose!("{}/{} cells swept", num_swept, num_checked);
    }
}

/// Walks the whole heap checking the flag/size invariants: within every
/// in-use block the number of allocated cells equals the capacity minus
/// the free-list length, mark bits only appear on allocated cells, and fit
/// cells tile their chunk exactly.
fn check_heap(inner: &HeapInner) {
    for chunk in inner.bop.iter() {
        for block in chunk.touched_blocks() {
            if !block.in_use() {
                continue;
            }
            let mut allocated = 0usize;
            for i in 0..block.num_cells() {
                let flags = block.flags(i);
                if flags & FLAG_MARKED != 0 {
                    assert!(
                        flags & FLAG_ALLOCATED != 0,
                        "mark bit on an unallocated cell"
                    );
                }
                if flags & FLAG_ALLOCATED != 0 {
                    allocated += 1;
                }
            }
            assert_eq!(
                allocated,
                block.num_cells() - block.free_list_len(),
                "allocated cells and free list disagree"
            );
        }
    }

    for chunk in inner.fit.iter() {
        let mut index = 1usize;
        while index < chunk.wilderness() {
            let flags = chunk.flags(index);
            assert!(flags & FLAG_VALID != 0, "fit cell head lost its valid bit");
            let size = chunk.cell_size(index);
            assert!(size > 0, "fit cell with zero size");
            for w in index + 1..(index + size + 1).min(chunk.wilderness()) {
                assert_eq!(chunk.flags(w), 0, "flag byte inside a fit cell");
            }
            index += size + 1;
        }

        let mut cur = chunk.free_head();
        while !cur.is_null() {
            let index = chunk.word_index(cur as usize);
            assert_eq!(chunk.flags(index), FLAG_VALID, "free-list cell has bad flags");
            // SAFETY: free-list links are cell addresses in this chunk.
            cur = unsafe { *cur as *mut usize };
        }
    }
}
