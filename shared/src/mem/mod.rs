use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

// Default ceiling for how far a user stack may grow down from OFFSET.
pub const USER_STACK_LIMIT: usize = 8 * MB;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    page_offset(addr) == 0
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

/// Number of pages needed to hold `bytes`.
#[inline]
pub const fn pages_spanned(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_FRAME_SIZE)
}
