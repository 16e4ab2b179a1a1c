//! Closure cells.
//!
//! A closure joins a code pointer (into some proc's code buffer, at offset
//! zero) with a data pointer (its environment). Closure cells live on the
//! collected heap so that data entries and instruction immediates can refer
//! to them by address; the loader pre-allocates every cell before reading
//! data, which is what makes forward closure references resolvable.

use crate::heap::capability::GcCapability;
use crate::heap::layout::WORD_SIZE;

/// The two-word payload of a closure cell.
#[repr(C)]
pub struct Closure {
    pub code: *mut u8,
    pub data: *mut u8,
}

pub const CLOSURE_WORDS: usize = std::mem::size_of::<Closure>() / WORD_SIZE;

/// Allocates an empty (zeroed) closure cell.
pub fn alloc_closure<C: GcCapability>(cap: &C) -> Option<*mut Closure> {
    let cell = cap.alloc(CLOSURE_WORDS) as *mut Closure;
    if cell.is_null() {
        return None;
    }
    // SAFETY: the cell is CLOSURE_WORDS words; reused cells carry stale
    // bytes that must not look like pointers.
    unsafe {
        (*cell).code = std::ptr::null_mut();
        (*cell).data = std::ptr::null_mut();
    }
    Some(cell)
}

/// Fills in a pre-allocated closure cell.
///
/// # Safety
///
/// `closure` must be a live closure cell.
pub unsafe fn init_closure(closure: *mut Closure, code: *mut u8, data: *mut u8) {
    unsafe {
        (*closure).code = code;
        (*closure).data = data;
    }
}
