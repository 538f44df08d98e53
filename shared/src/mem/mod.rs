use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// How far below `OFFSET` the user stack may grow.
pub const MAX_STACK_SIZE: usize = MB;

/// The largest distance below the stack pointer a single instruction may touch. PUSHA writes
/// 32 bytes below `esp` before it is adjusted.
pub const STACK_SLOP: usize = 32;

/// Rounds `addr` down to the start of its page.
#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

/// Offset of `addr` within its page.
#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_address(addr: usize) -> bool {
    addr < OFFSET
}
