//! Memory geometry of the collected heap.
//!
//! The heap is built from `mmap`ed chunks. A BOP ("blocks of pointers")
//! chunk is cut into fixed-size blocks, each serving cells of a single size
//! class; a block keeps a small header and one flag byte per cell ahead of
//! the cell payload. A fit chunk serves larger, variable-sized cells: every
//! cell is preceded by a size word, and a flag byte per word records which
//! words begin cells.
//!
//! Flag encoding is shared between both chunk kinds:
//! `ALLOCATED` - the cell is live storage handed to the mutator;
//! `MARKED` - set during the mark phase, only meaningful while `ALLOCATED`;
//! `VALID` - fit chunks only, the word is the start of a cell (allocated
//! or free).

use std::ptr;

/// Machine word size in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<usize>();

/// Number of low pointer bits that may carry a tag: 3 on 64-bit targets,
/// 2 on 32-bit targets.
pub const TAG_BITS: u32 = if WORD_SIZE == 8 { 3 } else { 2 };

/// Mask selecting the tag bits of a candidate pointer.
pub const TAG_MASK: usize = (1 << TAG_BITS) - 1;

/// Size of one block. Must be a power of two and at least the page size.
pub const BLOCK_SIZE: usize = 4096;

/// Size of one chunk, in bytes.
pub const CHUNK_SIZE: usize = 256 * BLOCK_SIZE;

/// Blocks per BOP chunk.
pub const BLOCKS_PER_CHUNK: usize = CHUNK_SIZE / BLOCK_SIZE;

/// Cells of at most this many words are served from BOP blocks; anything
/// larger goes to a fit chunk.
pub const MAX_BLOCK_CELL_WORDS: usize = 16;

/// Bytes reserved at the start of each block for the header and the cell
/// flag array. Sized so that even one-word cells on 32-bit targets fit
/// their flags.
pub const BLOCK_RESERVED: usize = 1024;

/// Usable payload bytes per block.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - BLOCK_RESERVED;

pub const FLAG_ALLOCATED: u8 = 0x01;
pub const FLAG_MARKED: u8 = 0x02;
pub const FLAG_VALID: u8 = 0x04;

/// Byte written over swept cells when `gc_poison` is on.
pub const POISON_BYTE: u8 = 0x77;

/// The operating system page size, queried once.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        BLOCK_SIZE
    } else {
        sz as usize
    }
}

/// An anonymous, page-aligned memory mapping.
pub(crate) struct Mapping {
    base: *mut u8,
    size: usize,
}

impl Mapping {
    pub(crate) fn new(size: usize) -> Option<Mapping> {
        // SAFETY: a fresh anonymous private mapping; no existing memory is
        // affected.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return None;
        }
        Some(Mapping {
            base: base as *mut u8,
            size,
        })
    }

    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.size
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/size are exactly what mmap returned.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

/// Per-block header, stored at the block's base address. The cell flag
/// array follows it; cells begin at `BLOCK_RESERVED`.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Cell size served by this block, in words. Zero means the block is
    /// empty and not serving any class.
    cell_size_words: usize,
    /// Head of the block's free list; the link lives in the free cell's
    /// first payload word.
    free_head: *mut usize,
}

/// A handle to one block inside a BOP chunk.
#[derive(Clone, Copy)]
pub(crate) struct BlockRef(*mut u8);

impl BlockRef {
    pub(crate) fn new(base: *mut u8) -> BlockRef {
        BlockRef(base)
    }

    #[inline]
    fn header(&self) -> *mut BlockHeader {
        self.0 as *mut BlockHeader
    }

    #[inline]
    pub(crate) fn in_use(&self) -> bool {
        self.cell_size_words() != 0
    }

    #[inline]
    pub(crate) fn cell_size_words(&self) -> usize {
        // SAFETY: the header is within the block's mapping.
        unsafe { (*self.header()).cell_size_words }
    }

    #[inline]
    pub(crate) fn cell_size_bytes(&self) -> usize {
        self.cell_size_words() * WORD_SIZE
    }

    #[inline]
    pub(crate) fn num_cells(&self) -> usize {
        BLOCK_PAYLOAD / self.cell_size_bytes()
    }

    #[inline]
    fn payload(&self) -> *mut u8 {
        // SAFETY: BLOCK_RESERVED < BLOCK_SIZE.
        unsafe { self.0.add(BLOCK_RESERVED) }
    }

    #[inline]
    pub(crate) fn cell_ptr(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.num_cells());
        // SAFETY: index is within the block payload.
        unsafe { self.payload().add(index * self.cell_size_bytes()) }
    }

    /// Maps an address to a cell index. Only exact cell-base addresses
    /// resolve; addresses into block metadata or mid-cell return `None`.
    pub(crate) fn cell_index(&self, addr: usize) -> Option<usize> {
        let offset = addr - self.0 as usize;
        if offset < BLOCK_RESERVED {
            return None;
        }
        let offset = offset - BLOCK_RESERVED;
        let cell_bytes = self.cell_size_bytes();
        if offset % cell_bytes != 0 {
            return None;
        }
        let index = offset / cell_bytes;
        if index < self.num_cells() {
            Some(index)
        } else {
            None
        }
    }

    #[inline]
    fn flag_ptr(&self, index: usize) -> *mut u8 {
        // SAFETY: flags sit between the header and BLOCK_RESERVED;
        // BLOCK_RESERVED is sized for the worst-case cell count.
        unsafe {
            self.0
                .add(std::mem::size_of::<BlockHeader>())
                .add(index)
        }
    }

    #[inline]
    pub(crate) fn flags(&self, index: usize) -> u8 {
        unsafe { *self.flag_ptr(index) }
    }

    #[inline]
    pub(crate) fn set_flags(&self, index: usize, flags: u8) {
        unsafe { *self.flag_ptr(index) = flags }
    }

    #[inline]
    pub(crate) fn or_flags(&self, index: usize, flags: u8) {
        unsafe { *self.flag_ptr(index) |= flags }
    }

    #[inline]
    pub(crate) fn clear_flags(&self, index: usize, flags: u8) {
        unsafe { *self.flag_ptr(index) &= !flags }
    }

    /// Claims an empty block for a size class: writes the header, clears
    /// all cell flags, and threads every cell onto a fresh free list.
    pub(crate) fn init(&self, cell_size_words: usize) {
        debug_assert!(cell_size_words >= 1);
        debug_assert!(cell_size_words <= MAX_BLOCK_CELL_WORDS);
        // SAFETY: header and flags are inside this block's reserved area.
        unsafe {
            (*self.header()).cell_size_words = cell_size_words;
            (*self.header()).free_head = ptr::null_mut();
        }
        let num_cells = self.num_cells();
        for i in 0..num_cells {
            self.set_flags(i, 0);
        }
        // Thread back-to-front so the free list hands out low cells first.
        for i in (0..num_cells).rev() {
            self.push_free(self.cell_ptr(i));
        }
    }

    /// Returns the block to the empty state.
    pub(crate) fn release(&self) {
        let num_cells = self.num_cells();
        for i in 0..num_cells {
            self.set_flags(i, 0);
        }
        unsafe {
            (*self.header()).cell_size_words = 0;
            (*self.header()).free_head = ptr::null_mut();
        }
    }

    #[inline]
    pub(crate) fn push_free(&self, cell: *mut u8) {
        // SAFETY: the free-list link is stored in the cell's first word;
        // every cell is at least one word.
        unsafe {
            let link = cell as *mut usize;
            *link = (*self.header()).free_head as usize;
            (*self.header()).free_head = link;
        }
    }

    /// Pops a cell from the free list, marking it allocated.
    pub(crate) fn pop_free(&self) -> Option<*mut u8> {
        // SAFETY: free-list links are only ever cell base addresses within
        // this block.
        unsafe {
            let head = (*self.header()).free_head;
            if head.is_null() {
                return None;
            }
            (*self.header()).free_head = *head as *mut usize;
            let cell = head as *mut u8;
            let index = self
                .cell_index(cell as usize)
                .expect("free list contained a non-cell address");
            self.or_flags(index, FLAG_ALLOCATED);
            Some(cell)
        }
    }

    /// Length of the free list. Used by the consistency check.
    pub(crate) fn free_list_len(&self) -> usize {
        let mut n = 0;
        // SAFETY: see pop_free.
        unsafe {
            let mut cur = (*self.header()).free_head;
            while !cur.is_null() {
                n += 1;
                cur = *cur as *mut usize;
            }
        }
        n
    }

    pub(crate) fn reset_free_list(&self) {
        unsafe {
            (*self.header()).free_head = ptr::null_mut();
        }
    }
}

/// A chunk divided into blocks, each serving a single cell size class.
pub(crate) struct BopChunk {
    map: Mapping,
    /// Index of the first never-used block; blocks below it have been
    /// handed out at least once.
    wilderness: usize,
    /// Blocks returned empty by the sweep, ready for reuse by any class.
    empty: Vec<usize>,
}

impl BopChunk {
    pub(crate) fn new() -> Option<BopChunk> {
        Some(BopChunk {
            map: Mapping::new(CHUNK_SIZE)?,
            wilderness: 0,
            empty: Vec::new(),
        })
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.map.contains(addr)
    }

    #[inline]
    pub(crate) fn block(&self, index: usize) -> BlockRef {
        debug_assert!(index < BLOCKS_PER_CHUNK);
        // SAFETY: index is within the chunk.
        BlockRef::new(unsafe { self.map.base().add(index * BLOCK_SIZE) })
    }

    /// The block containing `addr`, which must lie within this chunk.
    #[inline]
    pub(crate) fn block_of(&self, addr: usize) -> BlockRef {
        let index = (addr - self.map.base() as usize) / BLOCK_SIZE;
        self.block(index)
    }

    /// Takes an empty block, from the empty pool if possible, otherwise
    /// from the wilderness.
    pub(crate) fn take_empty_block(&mut self) -> Option<BlockRef> {
        if let Some(index) = self.empty.pop() {
            return Some(self.block(index));
        }
        if self.wilderness < BLOCKS_PER_CHUNK {
            let block = self.block(self.wilderness);
            self.wilderness += 1;
            Some(block)
        } else {
            None
        }
    }

    pub(crate) fn return_empty_block(&mut self, index: usize) {
        self.empty.push(index);
    }

    /// Number of blocks that have ever been handed out.
    pub(crate) fn touched(&self) -> usize {
        self.wilderness
    }

    /// Iterates over every block that has ever been handed out.
    pub(crate) fn touched_blocks(&self) -> impl Iterator<Item = BlockRef> + '_ {
        (0..self.wilderness).map(move |i| self.block(i))
    }
}

/// A chunk serving large, variable-sized cells. Every cell is preceded by
/// one word holding its size in words; a flag byte per word records cell
/// starts. Freed neighbours are merged during sweep.
pub(crate) struct FitChunk {
    map: Mapping,
    /// One flag byte per word of the mapping.
    flags: Vec<u8>,
    /// Word index of the start of never-allocated space.
    wilderness: usize,
    /// Head of this chunk's free list (cell base addresses).
    free_head: *mut usize,
}

impl FitChunk {
    pub(crate) fn new() -> Option<FitChunk> {
        Some(FitChunk {
            map: Mapping::new(CHUNK_SIZE)?,
            flags: vec![0u8; CHUNK_SIZE / WORD_SIZE],
            wilderness: 0,
            free_head: ptr::null_mut(),
        })
    }

    #[inline]
    pub(crate) fn contains(&self, addr: usize) -> bool {
        self.map.contains(addr)
    }

    #[inline]
    pub(crate) fn word_ptr(&self, index: usize) -> *mut usize {
        // SAFETY: callers only pass indices below the mapping's word count.
        unsafe { (self.map.base() as *mut usize).add(index) }
    }

    /// Word index of an address within the chunk. The address must be
    /// word-aligned (tag masking guarantees this for mark candidates).
    #[inline]
    pub(crate) fn word_index(&self, addr: usize) -> usize {
        (addr - self.map.base() as usize) / WORD_SIZE
    }

    #[inline]
    pub(crate) fn flags(&self, index: usize) -> u8 {
        self.flags[index]
    }

    #[inline]
    pub(crate) fn set_flags(&mut self, index: usize, flags: u8) {
        self.flags[index] = flags;
    }

    #[inline]
    pub(crate) fn or_flags(&mut self, index: usize, flags: u8) {
        self.flags[index] |= flags;
    }

    #[inline]
    pub(crate) fn clear_flags(&mut self, index: usize, flags: u8) {
        self.flags[index] &= !flags;
    }

    #[inline]
    pub(crate) fn wilderness(&self) -> usize {
        self.wilderness
    }

    /// Size in words of the cell whose payload begins at word `index`.
    #[inline]
    pub(crate) fn cell_size(&self, index: usize) -> usize {
        debug_assert!(index >= 1);
        // SAFETY: the size word sits immediately before the cell.
        unsafe { *self.word_ptr(index - 1) }
    }

    #[inline]
    pub(crate) fn set_cell_size(&mut self, index: usize, size_words: usize) {
        unsafe { *self.word_ptr(index - 1) = size_words }
    }

    pub(crate) fn free_head(&self) -> *mut usize {
        self.free_head
    }

    pub(crate) fn set_free_head(&mut self, head: *mut usize) {
        self.free_head = head;
    }

    /// Best-fit allocation from the free list, falling back to the
    /// wilderness. Returns the cell payload pointer.
    pub(crate) fn alloc(&mut self, size_words: usize) -> Option<*mut u8> {
        if let Some(cell) = self.alloc_from_free_list(size_words) {
            return Some(cell);
        }

        // The size word and payload both come out of the wilderness.
        let needed = size_words + 1;
        let total_words = CHUNK_SIZE / WORD_SIZE;
        if self.wilderness + needed > total_words {
            return None;
        }
        let index = self.wilderness + 1;
        self.wilderness += needed;
        self.set_cell_size(index, size_words);
        self.set_flags(index, FLAG_VALID | FLAG_ALLOCATED);
        Some(self.word_ptr(index) as *mut u8)
    }

    fn alloc_from_free_list(&mut self, size_words: usize) -> Option<*mut u8> {
        // Best fit: the smallest free cell that is large enough.
        let mut best: *mut usize = ptr::null_mut();
        let mut prev_best: *mut usize = ptr::null_mut();
        let mut prev: *mut usize = ptr::null_mut();
        let mut cur = self.free_head;
        // SAFETY: free-list links are cell payload addresses inside this
        // chunk; size words precede them.
        unsafe {
            while !cur.is_null() {
                let index = self.word_index(cur as usize);
                debug_assert_eq!(self.flags(index), FLAG_VALID);
                let size = self.cell_size(index);
                if size >= size_words && (best.is_null() || size < self.cell_size(self.word_index(best as usize))) {
                    prev_best = prev;
                    best = cur;
                }
                prev = cur;
                cur = *cur as *mut usize;
            }

            if best.is_null() {
                return None;
            }

            // Unlink the winner.
            if prev_best.is_null() {
                self.free_head = *best as *mut usize;
            } else {
                *prev_best = *best;
            }

            let index = self.word_index(best as usize);
            let old_size = self.cell_size(index);
            self.or_flags(index, FLAG_ALLOCATED);

            if old_size >= size_words + 2 {
                // Split: the tail becomes a new free cell.
                self.set_cell_size(index, size_words);
                let next_index = index + size_words + 1;
                self.set_cell_size(next_index, old_size - (size_words + 1));
                self.set_flags(next_index, FLAG_VALID);
                let next = self.word_ptr(next_index);
                *next = self.free_head as usize;
                self.free_head = next;
            }

            Some(best as *mut u8)
        }
    }
}
