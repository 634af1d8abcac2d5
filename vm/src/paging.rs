//! Hardware page table primitives consumed by the VM core.
//!
//! The kernel's x86 page manager implements [`PageDirectory`] for each user
//! address space. [`SoftPageDirectory`] keeps the same page table entry words in
//! kernel memory, without loading them into `cr3`; it is what the VM core runs
//! against before paging is enabled and in tests.

use crate::sync::mutex::Mutex;
use alloc::collections::BTreeMap;
use kidneyos_shared::mem::{is_page_aligned, is_user_vaddr, PAGE_FRAME_SIZE};
use kidneyos_shared::paging::PageTableEntry;

/// Per-address-space view of the hardware page table.
///
/// Every method takes the page-aligned user virtual address `upage`. The
/// accessed and dirty bits are set by the MMU behind the kernel's back, so
/// implementations use interior mutability.
pub trait PageDirectory: Send + Sync {
    /// Physical address of the frame mapped at `upage`, if any.
    fn get_page(&self, upage: usize) -> Option<usize>;

    /// Map `upage` to the frame at physical address `frame`.
    ///
    /// Returns `false` if `upage` is already mapped or is not a user page.
    #[must_use]
    fn set_page(&self, upage: usize, frame: usize, writable: bool) -> bool;

    /// Remove the mapping for `upage`. Later accesses fault.
    fn clear_page(&self, upage: usize);

    fn is_accessed(&self, upage: usize) -> bool;
    fn set_accessed(&self, upage: usize, accessed: bool);
    fn is_dirty(&self, upage: usize) -> bool;
    fn set_dirty(&self, upage: usize, dirty: bool);
    fn is_writable(&self, upage: usize) -> bool;
}

/// A page directory whose entries live in a kernel-side map.
#[derive(Default)]
pub struct SoftPageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
}

impl SoftPageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw entry for `upage`, if mapped.
    pub fn entry(&self, upage: usize) -> Option<PageTableEntry> {
        self.entries.lock().get(&(upage / PAGE_FRAME_SIZE)).copied()
    }

    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().len()
    }

    fn update(&self, upage: usize, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(entry) = self.entries.lock().get_mut(&(upage / PAGE_FRAME_SIZE)) {
            *entry = f(*entry);
        }
    }
}

impl PageDirectory for SoftPageDirectory {
    fn get_page(&self, upage: usize) -> Option<usize> {
        self.entry(upage).map(|entry| entry.frame())
    }

    fn set_page(&self, upage: usize, frame: usize, writable: bool) -> bool {
        debug_assert!(is_page_aligned(upage));
        if !is_user_vaddr(upage) {
            return false;
        }
        let mut entries = self.entries.lock();
        let vpn = upage / PAGE_FRAME_SIZE;
        if entries.contains_key(&vpn) {
            return false;
        }
        entries.insert(vpn, PageTableEntry::user_mapping(frame, writable));
        true
    }

    fn clear_page(&self, upage: usize) {
        self.entries.lock().remove(&(upage / PAGE_FRAME_SIZE));
    }

    fn is_accessed(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.accessed())
    }

    fn set_accessed(&self, upage: usize, accessed: bool) {
        self.update(upage, |entry| entry.with_accessed(accessed));
    }

    fn is_dirty(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.dirty())
    }

    fn set_dirty(&self, upage: usize, dirty: bool) {
        self.update(upage, |entry| entry.with_dirty(dirty));
    }

    fn is_writable(&self, upage: usize) -> bool {
        self.entry(upage).is_some_and(|entry| entry.read_write())
    }
}
