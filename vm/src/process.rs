use crate::error::Result;
use crate::file::FileRef;
use crate::mem::frame_table::EvictionGuard;
use crate::mem::mmap::MmapTable;
use crate::mem::page::SupPageTable;
use crate::paging::PageDirectory;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;

pub type Pid = u16;

/// The per-process half of virtual memory: the hardware page directory, the
/// supplemental page table, and the table of memory-mapped files.
///
/// Only the owning process touches its supplemental page table, with one
/// exception: the thread evicting one of this process's frames reaches in
/// through [`AddressSpace::pages_for_eviction`], which can only be called while
/// holding the eviction lock.
pub struct AddressSpace {
    pid: Pid,
    page_dir: Box<dyn PageDirectory>,
    pages: Mutex<SupPageTable>,
    mmaps: Mutex<MmapTable>,
    /// Serializes page faults, stack growth, and unmapping within the process.
    fault_lock: Mutex<()>,
}

impl AddressSpace {
    pub fn new(pid: Pid, page_dir: Box<dyn PageDirectory>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            page_dir,
            pages: Mutex::new(SupPageTable::new()),
            mmaps: Mutex::new(MmapTable::new()),
            fault_lock: Mutex::new(()),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn page_dir(&self) -> &dyn PageDirectory {
        &*self.page_dir
    }

    /// The supplemental page table, for use by the owning process.
    ///
    /// Must not be held across frame allocation or pinning, which may wait on
    /// an eviction that needs this same table.
    pub fn pages(&self) -> MutexGuard<SupPageTable> {
        self.pages.lock()
    }

    /// The supplemental page table, for the thread evicting one of this
    /// process's frames.
    pub(crate) fn pages_for_eviction<'a>(
        &'a self,
        _eviction: &EvictionGuard<'_>,
    ) -> MutexGuard<'a, SupPageTable> {
        self.pages.lock()
    }

    pub(crate) fn mmaps(&self) -> MutexGuard<MmapTable> {
        self.mmaps.lock()
    }

    pub(crate) fn lock_faults(&self) -> MutexGuard<()> {
        self.fault_lock.lock()
    }

    /// Register an executable segment to be loaded on demand.
    ///
    /// See [`SupPageTable::add_file_segment`].
    pub fn add_file_segment(
        &self,
        file: &FileRef,
        offset: u64,
        upage: usize,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        self.pages()
            .add_file_segment(file, offset, upage, read_bytes, zero_bytes, writable)
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}
