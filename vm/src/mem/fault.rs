//! Page fault resolution: bringing a described page into a frame, and growing
//! the user stack.

use super::page::PageKind;
use super::physical::Frame;
use crate::error::{Result, VmError};
use crate::process::AddressSpace;
use crate::system::VirtualMemory;
use alloc::sync::Arc;
use kidneyos_shared::mem::{is_user_vaddr, page_round_down, OFFSET};
use log::{trace, warn};

impl VirtualMemory {
    /// Handle a not-present fault at `fault_addr` in `space`. `esp` is the
    /// user stack pointer at the time of the fault.
    ///
    /// Returns an error if the access was invalid; the caller kills the process.
    pub fn handle_page_fault(
        &self,
        space: &Arc<AddressSpace>,
        fault_addr: usize,
        esp: usize,
    ) -> Result<()> {
        if fault_addr == 0 || !is_user_vaddr(fault_addr) {
            return Err(VmError::BadAddress);
        }
        let upage = page_round_down(fault_addr);

        let _faults = space.lock_faults();
        if space.pages().lookup(upage).is_some() {
            return self.fault_in(space, upage);
        }
        // Another thread of the process got here first.
        if space.page_dir().get_page(upage).is_some() {
            return Ok(());
        }
        if self.is_stack_access(fault_addr, esp) {
            return self.grow_stack(space, upage);
        }
        Err(VmError::BadAddress)
    }

    /// Load the page containing `vaddr` from its backing store and map it.
    ///
    /// Succeeds without doing anything if the page is already loaded.
    pub fn resolve_fault(&self, space: &Arc<AddressSpace>, vaddr: usize) -> Result<()> {
        let _faults = space.lock_faults();
        self.fault_in(space, page_round_down(vaddr))
    }

    fn fault_in(&self, space: &Arc<AddressSpace>, upage: usize) -> Result<()> {
        if self.load_page(space, upage)?.is_some() {
            self.frames().unpin(space, upage)?;
        }
        Ok(())
    }

    /// Whether a fault at `fault_addr` looks like the stack growing down.
    ///
    /// `PUSHA` can touch up to `stack_slack` bytes below `esp` before `esp`
    /// itself moves.
    fn is_stack_access(&self, fault_addr: usize, esp: usize) -> bool {
        let config = self.config();
        fault_addr.saturating_add(config.stack_slack) >= esp
            && fault_addr >= OFFSET.saturating_sub(config.stack_limit)
    }

    /// Back `upage` with a fresh zeroed, writable frame.
    pub(crate) fn grow_stack(&self, space: &Arc<AddressSpace>, upage: usize) -> Result<()> {
        let frame = self.frames().allocate(self.swap(), space, upage, true);
        if !space.page_dir().set_page(upage, frame.addr(), true) {
            self.frames().free(space, frame);
            return Err(VmError::AlreadyMapped);
        }
        trace!("process {}: stack page {upage:#X}", space.pid());
        self.frames().unpin(space, upage)
    }

    /// Return the pinned frame backing `upage`, faulting it in first if needed.
    pub(crate) fn pin_page(&self, space: &Arc<AddressSpace>, upage: usize) -> Result<Frame> {
        loop {
            match self.frames().pin(space, upage) {
                Err(VmError::NotResident) => {}
                result => return result,
            }

            let _faults = space.lock_faults();
            if let Some(frame) = self.load_page(space, upage)? {
                return Ok(frame);
            }
        }
    }

    /// Bring `upage` into a frame according to its descriptor.
    ///
    /// Returns the new frame, still pinned, or `None` if the descriptor says the
    /// page is already loaded. The caller holds the fault lock.
    fn load_page(&self, space: &Arc<AddressSpace>, upage: usize) -> Result<Option<Frame>> {
        let descriptor = space
            .pages()
            .lookup(upage)
            .cloned()
            .ok_or(VmError::NotFound)?;
        if descriptor.loaded {
            return Ok(None);
        }
        if matches!(descriptor.kind, PageKind::Resident) {
            return Err(VmError::InvalidState);
        }

        // The page table lock is not held here: allocation may evict one of
        // this process's own pages.
        let frame = self.frames().allocate(self.swap(), space, upage, false);
        let loaded = {
            let mut page = self.frames().memory().contents(frame);
            match &descriptor.kind {
                PageKind::FileBacked(segment)
                | PageKind::MmapBacked(segment)
                | PageKind::MmapBackedPendingRestore { segment, .. } => segment.load_into(&mut page),
                PageKind::Swapped { slot } | PageKind::FileBackedPendingRestore { slot, .. } => {
                    self.swap().read_and_release(*slot, &mut page)
                }
                PageKind::Resident => Err(VmError::InvalidState),
            }
        };
        if let Err(e) = loaded {
            warn!(
                "process {}: cannot load {upage:#X}: {e}",
                space.pid()
            );
            self.frames().free(space, frame);
            return Err(e);
        }

        // Memory-mapped pages are always writable; the dirty bit decides
        // whether they are written back.
        let writable = descriptor.writable || descriptor.kind.is_mmap();
        // A page restored from swap holds data newer than its file.
        let dirty = matches!(descriptor.kind, PageKind::FileBackedPendingRestore { .. });
        let kind = match descriptor.kind {
            PageKind::MmapBackedPendingRestore { segment, slot } => {
                self.swap().release(slot);
                Some(PageKind::MmapBacked(segment))
            }
            PageKind::FileBackedPendingRestore { segment, .. } => {
                Some(PageKind::FileBacked(segment))
            }
            // Anonymous pages live only in their frame once restored.
            PageKind::Swapped { .. } => None,
            kind => Some(kind),
        };

        let mut pages = space.pages();
        let page_dir = space.page_dir();
        assert!(
            page_dir.set_page(upage, frame.addr(), writable),
            "{upage:#X} of process {} mapped without a loaded descriptor",
            space.pid()
        );
        if dirty {
            page_dir.set_dirty(upage, true);
        }
        match kind {
            Some(kind) => {
                if let Some(entry) = pages.lookup_mut(upage) {
                    entry.kind = kind;
                    entry.loaded = true;
                }
            }
            None => {
                pages.remove(upage);
            }
        }
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileRef, MemFile};
    use crate::mem::page::{FileSegment, PageDescriptor};
    use crate::test_support::{address_space, virtual_memory};
    use kidneyos_shared::mem::PAGE_FRAME_SIZE;

    const STACK_TOP: usize = OFFSET - PAGE_FRAME_SIZE;

    fn write_byte(vm: &VirtualMemory, space: &Arc<AddressSpace>, addr: usize, byte: u8) {
        vm.copy_to_user(space, addr, &[byte]).unwrap();
    }

    fn read_page(vm: &VirtualMemory, space: &Arc<AddressSpace>, upage: usize) -> Vec<u8> {
        let mut buf = vec![0; PAGE_FRAME_SIZE];
        vm.copy_from_user(space, upage, &mut buf).unwrap();
        buf
    }

    #[test]
    fn rejects_kernel_and_null_addresses() {
        let vm = virtual_memory(2, 2);
        let space = address_space(1);
        assert_eq!(vm.handle_page_fault(&space, 0, 0), Err(VmError::BadAddress));
        assert_eq!(
            vm.handle_page_fault(&space, OFFSET + 8, OFFSET),
            Err(VmError::BadAddress)
        );
    }

    #[test]
    fn stack_heuristic() {
        let vm = virtual_memory(2, 2);
        let space = address_space(1);
        let esp = OFFSET - 64;

        // PUSHA faults 32 bytes below esp.
        assert_eq!(vm.handle_page_fault(&space, esp - 32, esp), Ok(()));
        assert!(space.page_dir().get_page(STACK_TOP).is_some());
        assert!(space.page_dir().is_writable(STACK_TOP));

        // Far below the stack pointer is a wild access.
        assert_eq!(
            vm.handle_page_fault(&space, esp - 2 * PAGE_FRAME_SIZE, esp),
            Err(VmError::BadAddress)
        );
        // Past the stack limit.
        let deep = OFFSET - vm.config().stack_limit - PAGE_FRAME_SIZE;
        assert_eq!(
            vm.handle_page_fault(&space, deep, deep),
            Err(VmError::BadAddress)
        );
        assert!(space.pages().is_empty());
    }

    #[test]
    fn file_backed_page_keeps_its_kind() {
        let vm = virtual_memory(2, 2);
        let space = address_space(1);
        let file: FileRef = MemFile::new(b"\x7fELF and then some");
        space
            .add_file_segment(&file, 5, 0x0804_8000, 3, PAGE_FRAME_SIZE - 3, false)
            .unwrap();

        vm.resolve_fault(&space, 0x0804_8010).unwrap();
        let descriptor = space.pages().lookup(0x0804_8000).cloned().unwrap();
        assert!(descriptor.loaded);
        assert!(matches!(descriptor.kind, PageKind::FileBacked(_)));
        assert!(!space.page_dir().is_writable(0x0804_8000));

        let page = read_page(&vm, &space, 0x0804_8000);
        assert_eq!(&page[..4], b"and\0");

        // Resolving a loaded page is a no-op.
        assert_eq!(vm.resolve_fault(&space, 0x0804_8000), Ok(()));
        assert_eq!(vm.frames().len(), 1);
    }

    #[test]
    fn short_read_fails_and_frees_the_frame() {
        let vm = virtual_memory(2, 2);
        let space = address_space(1);
        let file: FileRef = MemFile::new(b"tiny");
        space
            .pages()
            .insert(PageDescriptor::new(
                0x1000,
                PageKind::FileBacked(FileSegment {
                    file,
                    offset: 0,
                    read_bytes: 100,
                    zero_bytes: PAGE_FRAME_SIZE - 100,
                }),
                true,
            ))
            .unwrap();

        assert_eq!(
            vm.resolve_fault(&space, 0x1000),
            Err(VmError::ShortRead {
                expected: 100,
                actual: 4
            })
        );
        assert!(vm.frames().is_empty());
        assert_eq!(space.page_dir().get_page(0x1000), None);
        assert!(!space.pages().lookup(0x1000).unwrap().loaded);
    }

    #[test]
    fn missing_descriptor() {
        let vm = virtual_memory(1, 1);
        let space = address_space(1);
        assert_eq!(vm.resolve_fault(&space, 0x4000), Err(VmError::NotFound));
    }

    #[test]
    fn swapped_page_round_trips() {
        let vm = virtual_memory(1, 4);
        let space = address_space(1);
        let x = STACK_TOP;
        let y = STACK_TOP - PAGE_FRAME_SIZE;

        vm.handle_page_fault(&space, x, x).unwrap();
        for (i, b) in (0..PAGE_FRAME_SIZE).step_by(97).enumerate() {
            write_byte(&vm, &space, x + b, i as u8 + 1);
        }
        let before = read_page(&vm, &space, x);

        // The pool holds one frame, so Y's stack page evicts X.
        vm.handle_page_fault(&space, y, y).unwrap();
        assert_eq!(space.page_dir().get_page(x), None);
        let evicted = space.pages().lookup(x).cloned().unwrap();
        assert!(matches!(evicted.kind, PageKind::Swapped { .. }));
        assert!(!evicted.loaded);
        assert_eq!(vm.swap().slots_in_use(), 1);

        vm.handle_page_fault(&space, x + 5, y).unwrap();
        // Y went to swap to make room; X came back and left swap.
        assert_eq!(vm.swap().slots_in_use(), 1);
        assert!(space.pages().lookup(x).is_none());
        assert!(space.page_dir().get_page(x).is_some());
        assert_eq!(read_page(&vm, &space, x), before);
    }

    #[test]
    fn dirty_executable_page_restores_from_swap() {
        let vm = virtual_memory(1, 4);
        let space = address_space(1);
        let file = MemFile::new(&[0xAA; PAGE_FRAME_SIZE]);
        space
            .add_file_segment(&(file.clone() as FileRef), 0, 0x1000, PAGE_FRAME_SIZE, 0, true)
            .unwrap();

        write_byte(&vm, &space, 0x1000, 0x55);
        vm.handle_page_fault(&space, STACK_TOP, STACK_TOP).unwrap();
        assert!(matches!(
            space.pages().lookup(0x1000).unwrap().kind,
            PageKind::FileBackedPendingRestore { .. }
        ));

        let page = read_page(&vm, &space, 0x1000);
        assert_eq!(page[0], 0x55);
        assert_eq!(page[1], 0xAA);
        assert!(space.page_dir().is_dirty(0x1000));
        assert!(matches!(
            space.pages().lookup(0x1000).unwrap().kind,
            PageKind::FileBacked(_)
        ));
        // The executable itself is never written.
        assert_eq!(file.contents()[0], 0xAA);
    }

    #[test]
    fn clean_executable_page_is_dropped_not_swapped() {
        let vm = virtual_memory(1, 4);
        let space = address_space(1);
        let file: FileRef = MemFile::new(&[3; 16]);
        space
            .add_file_segment(&file, 0, 0x1000, 16, PAGE_FRAME_SIZE - 16, false)
            .unwrap();

        vm.resolve_fault(&space, 0x1000).unwrap();
        vm.handle_page_fault(&space, STACK_TOP, STACK_TOP).unwrap();
        assert_eq!(vm.swap().slots_in_use(), 0);
        assert!(matches!(
            space.pages().lookup(0x1000).unwrap().kind,
            PageKind::FileBacked(_)
        ));

        vm.resolve_fault(&space, 0x1000).unwrap();
        assert_eq!(read_page(&vm, &space, 0x1000)[15], 3);
    }
}
