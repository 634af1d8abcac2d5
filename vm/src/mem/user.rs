use crate::error::{Result, VmError};
use crate::process::AddressSpace;
use crate::system::VirtualMemory;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use kidneyos_shared::mem::{page_offset, page_round_down, OFFSET, PAGE_FRAME_SIZE};

impl VirtualMemory {
    /// Copy `dst.len()` bytes of user memory starting at `src` into `dst`.
    pub fn copy_from_user(&self, space: &Arc<AddressSpace>, src: usize, dst: &mut [u8]) -> Result<()> {
        self.for_each_user_chunk(space, src, dst.len(), false, |page, done| {
            dst[done..done + page.len()].copy_from_slice(page);
        })
    }

    /// Copy `src` into user memory starting at `dst`.
    ///
    /// Fails with [`VmError::ReadOnly`] at the first page that is not writable;
    /// pages before it have already been written.
    pub fn copy_to_user(&self, space: &Arc<AddressSpace>, dst: usize, src: &[u8]) -> Result<()> {
        self.for_each_user_chunk(space, dst, src.len(), true, |page, done| {
            page.copy_from_slice(&src[done..done + page.len()]);
        })
    }

    /// Copy `count` bytes at `pointer` out of user memory.
    ///
    /// Threads hand each other buffers this way without mapping one process's
    /// memory into another.
    pub fn check_and_copy_user_memory(
        &self,
        space: &Arc<AddressSpace>,
        pointer: usize,
        count: usize,
    ) -> Result<Vec<u8>> {
        let mut bytes = vec![0; count];
        self.copy_from_user(space, pointer, &mut bytes)?;
        Ok(bytes)
    }

    /// Walk `[addr, addr + len)` page by page, handing `f` the bytes of each
    /// page in range and how many bytes came before them.
    ///
    /// Every page is faulted in if needed and pinned while `f` runs.
    fn for_each_user_chunk(
        &self,
        space: &Arc<AddressSpace>,
        addr: usize,
        len: usize,
        write: bool,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<()> {
        let end = addr.checked_add(len).ok_or(VmError::BadAddress)?;
        // Trying to reach kernel memory.
        if addr == 0 || end > OFFSET {
            return Err(VmError::BadAddress);
        }

        let mut done = 0;
        while done < len {
            let vaddr = addr + done;
            let upage = page_round_down(vaddr);
            let start = page_offset(vaddr);
            let chunk = (PAGE_FRAME_SIZE - start).min(len - done);

            let frame = self.pin_page(space, upage).map_err(|e| match e {
                VmError::NotFound => VmError::BadAddress,
                e => e,
            })?;
            let page_dir = space.page_dir();
            if write && !page_dir.is_writable(upage) {
                self.frames().unpin(space, upage)?;
                return Err(VmError::ReadOnly);
            }

            f(
                &mut self.frames().memory().contents(frame).0[start..start + chunk],
                done,
            );
            page_dir.set_accessed(upage, true);
            if write {
                page_dir.set_dirty(upage, true);
            }
            self.frames().unpin(space, upage)?;

            done += chunk;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FileRef, MemFile};
    use crate::test_support::{address_space, virtual_memory};

    const STACK: usize = OFFSET - 2 * PAGE_FRAME_SIZE;

    #[test]
    fn copy_spans_pages() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        vm.handle_page_fault(&space, STACK, STACK).unwrap();
        vm.handle_page_fault(&space, STACK + PAGE_FRAME_SIZE, STACK).unwrap();

        let addr = STACK + PAGE_FRAME_SIZE - 3;
        vm.copy_to_user(&space, addr, b"abcdef").unwrap();
        assert_eq!(
            vm.check_and_copy_user_memory(&space, addr, 6).unwrap(),
            b"abcdef"
        );
        assert!(space.page_dir().is_dirty(STACK));
        assert!(space.page_dir().is_dirty(STACK + PAGE_FRAME_SIZE));
        assert!(space.page_dir().is_accessed(STACK));

        // Nothing stays pinned after a copy.
        assert_eq!(vm.frames().len(), 2);
        vm.handle_page_fault(&space, STACK - PAGE_FRAME_SIZE, STACK - PAGE_FRAME_SIZE)
            .unwrap();
        vm.handle_page_fault(&space, STACK - 2 * PAGE_FRAME_SIZE, STACK - 2 * PAGE_FRAME_SIZE)
            .unwrap();
        vm.handle_page_fault(&space, STACK - 3 * PAGE_FRAME_SIZE, STACK - 3 * PAGE_FRAME_SIZE)
            .unwrap();
        assert_eq!(vm.swap().slots_in_use(), 1);
    }

    #[test]
    fn copy_keeps_an_outer_pin() {
        let vm = virtual_memory(2, 4);
        let space = address_space(1);
        let below = STACK - PAGE_FRAME_SIZE;
        vm.handle_page_fault(&space, STACK, STACK).unwrap();
        let frame = vm.frames().pin(&space, STACK).unwrap();

        vm.copy_to_user(&space, STACK, b"hi").unwrap();
        vm.handle_page_fault(&space, below, below).unwrap();
        vm.handle_page_fault(&space, below - PAGE_FRAME_SIZE, below - PAGE_FRAME_SIZE)
            .unwrap();

        // The second stack page went to swap instead of the pinned one.
        assert_eq!(space.page_dir().get_page(STACK), Some(frame.addr()));
        assert_eq!(space.page_dir().get_page(below), None);
        vm.frames().unpin(&space, STACK).unwrap();
        assert_eq!(vm.check_and_copy_user_memory(&space, STACK, 2).unwrap(), b"hi");
    }

    #[test]
    fn rejects_kernel_and_unmapped_memory() {
        let vm = virtual_memory(2, 2);
        let space = address_space(1);
        let mut buf = [0u8; 4];

        assert_eq!(
            vm.copy_from_user(&space, OFFSET - 2, &mut buf),
            Err(VmError::BadAddress)
        );
        assert_eq!(vm.copy_from_user(&space, 0, &mut buf), Err(VmError::BadAddress));
        assert_eq!(
            vm.copy_from_user(&space, 0x1000, &mut buf),
            Err(VmError::BadAddress)
        );
        assert_eq!(vm.copy_to_user(&space, usize::MAX - 1, &buf), Err(VmError::BadAddress));
    }

    #[test]
    fn refuses_to_write_read_only_pages() {
        let vm = virtual_memory(2, 2);
        let space = address_space(1);
        let file: FileRef = MemFile::new(b"code");
        space
            .add_file_segment(&file, 0, 0x1000, 4, PAGE_FRAME_SIZE - 4, false)
            .unwrap();

        assert_eq!(vm.copy_to_user(&space, 0x1000, b"x"), Err(VmError::ReadOnly));
        assert_eq!(vm.check_and_copy_user_memory(&space, 0x1000, 4).unwrap(), b"code");
        assert!(!space.page_dir().is_dirty(0x1000));
    }

    #[test]
    fn empty_copy_touches_nothing() {
        let vm = virtual_memory(1, 1);
        let space = address_space(1);
        vm.copy_to_user(&space, 0x1000, &[]).unwrap();
        assert!(vm.frames().is_empty());
    }
}
