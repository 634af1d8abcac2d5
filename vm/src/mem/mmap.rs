//! Memory-mapped files.

use super::page::{FileSegment, PageDescriptor, PageKind};
use crate::error::{Result, VmError};
use crate::file::FileRef;
use crate::process::AddressSpace;
use crate::system::VirtualMemory;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use kidneyos_shared::mem::{is_page_aligned, is_user_vaddr, pages_spanned, OFFSET, PAGE_FRAME_SIZE};
use log::{debug, warn};

pub type MapId = usize;

/// One live mapping. Dropping it closes its file handle.
pub struct MmapEntry {
    pub id: MapId,
    pub file: FileRef,
    pub base: usize,
    pub page_count: usize,
}

impl MmapEntry {
    pub fn pages(&self) -> impl Iterator<Item = usize> {
        let base = self.base;
        (0..self.page_count).map(move |i| base + i * PAGE_FRAME_SIZE)
    }
}

/// Per-process table of mappings. Ids are never reused.
#[derive(Default)]
pub struct MmapTable {
    next_id: MapId,
    maps: BTreeMap<MapId, MmapEntry>,
}

impl MmapTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn get(&self, id: MapId) -> Option<&MmapEntry> {
        self.maps.get(&id)
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.maps.keys().copied().collect()
    }

    fn insert(&mut self, file: FileRef, base: usize, page_count: usize) -> MapId {
        let id = self.next_id;
        self.next_id += 1;
        self.maps.insert(
            id,
            MmapEntry {
                id,
                file,
                base,
                page_count,
            },
        );
        id
    }

    fn remove(&mut self, id: MapId) -> Option<MmapEntry> {
        self.maps.remove(&id)
    }
}

/// User pages `[base, base + pages * PAGE_FRAME_SIZE)`, or `None` if the range
/// leaves user space.
fn user_range(base: usize, pages: usize) -> Option<Range<usize>> {
    let end = base.checked_add(pages.checked_mul(PAGE_FRAME_SIZE)?)?;
    (end <= OFFSET).then_some(base..end)
}

impl VirtualMemory {
    /// Map the whole of `file` at `base` in `space`.
    ///
    /// The length of the mapping is the file's length at the time of the call;
    /// the last page is zero-filled past the end of the file, and later growth
    /// of the file is not mapped.
    ///
    /// Pages are read lazily on first access. The mapping holds its own handle
    /// to the file, so `file` may be closed afterwards.
    pub fn mmap(&self, space: &Arc<AddressSpace>, file: &FileRef, base: usize) -> Result<MapId> {
        if base == 0 || !is_user_vaddr(base) {
            return Err(VmError::BadAddress);
        }
        if !is_page_aligned(base) {
            return Err(VmError::Misaligned);
        }
        if file.is_console() {
            return Err(VmError::ConsoleMapping);
        }
        let length = usize::try_from(file.length()).map_err(|_| VmError::BadAddress)?;
        if length == 0 {
            return Err(VmError::EmptyFile);
        }
        let page_count = pages_spanned(length);
        let range = user_range(base, page_count).ok_or(VmError::BadAddress)?;

        let _faults = space.lock_faults();
        let mut pages = space.pages();
        let page_dir = space.page_dir();
        if range
            .clone()
            .step_by(PAGE_FRAME_SIZE)
            .any(|upage| pages.lookup(upage).is_some() || page_dir.get_page(upage).is_some())
        {
            return Err(VmError::AlreadyMapped);
        }

        let file = file.reopen().ok_or(VmError::ReopenFailed)?;
        for (i, upage) in range.step_by(PAGE_FRAME_SIZE).enumerate() {
            let offset = i * PAGE_FRAME_SIZE;
            let read_bytes = PAGE_FRAME_SIZE.min(length - offset);
            let segment = FileSegment {
                file: file.clone(),
                offset: offset as u64,
                read_bytes,
                zero_bytes: PAGE_FRAME_SIZE - read_bytes,
            };
            pages.insert(PageDescriptor::new(upage, PageKind::MmapBacked(segment), true))?;
        }
        drop(pages);

        let id = space.mmaps().insert(file, base, page_count);
        debug!(
            "process {}: mapped {length} bytes at {base:#X} as {id}",
            space.pid()
        );
        Ok(id)
    }

    /// Tear down mapping `id`, writing dirty pages back to the file.
    ///
    /// Unmapping an id that is not mapped does nothing. Every page is released
    /// even if a write-back fails; the first failure is returned.
    pub fn munmap(&self, space: &Arc<AddressSpace>, id: MapId) -> Result<()> {
        let _faults = space.lock_faults();
        let Some(entry) = space.mmaps().remove(id) else {
            return Ok(());
        };

        let mut result = Ok(());
        for upage in entry.pages() {
            if let Err(e) = self.unmap_page(space, upage) {
                warn!(
                    "process {}: write-back of {upage:#X} failed: {e}",
                    space.pid()
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        debug!("process {}: unmapped {id}", space.pid());
        result
    }

    fn unmap_page(&self, space: &Arc<AddressSpace>, upage: usize) -> Result<()> {
        let mut result = Ok(());

        if let Ok(frame) = self.frames().pin(space, upage) {
            let page_dir = space.page_dir();
            let dirty = page_dir.is_dirty(upage);
            page_dir.clear_page(upage);

            if dirty {
                let segment = space
                    .pages()
                    .lookup(upage)
                    .and_then(|descriptor| descriptor.kind.segment().cloned());
                if let Some(segment) = segment {
                    result = segment.write_back(&self.frames().memory().contents(frame));
                }
            }
            self.frames().free(space, frame);
        }

        let descriptor = space.pages().remove(upage);
        if let Some(slot) = descriptor.and_then(|d| d.kind.slot()) {
            self.swap().release(slot);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{Console, MemFile};
    use crate::test_support::{address_space, virtual_memory};

    const BASE: usize = 0x1000_0000;

    #[test]
    fn rejects_bad_requests() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        let file: FileRef = MemFile::new(b"contents");

        assert_eq!(vm.mmap(&space, &file, 0), Err(VmError::BadAddress));
        assert_eq!(vm.mmap(&space, &file, OFFSET), Err(VmError::BadAddress));
        assert_eq!(vm.mmap(&space, &file, BASE + 1), Err(VmError::Misaligned));
        assert_eq!(
            vm.mmap(&space, &(Arc::new(Console::Stdout) as FileRef), BASE),
            Err(VmError::ConsoleMapping)
        );
        assert_eq!(
            vm.mmap(&space, &(MemFile::new(b"") as FileRef), BASE),
            Err(VmError::EmptyFile)
        );
        assert_eq!(
            vm.mmap(&space, &file, OFFSET - PAGE_FRAME_SIZE),
            Ok(0),
            "the last user page is mappable"
        );
        assert!(space.mmaps().get(0).is_some());
    }

    #[test]
    fn rejects_overlap() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        let file: FileRef = MemFile::new(&[1; PAGE_FRAME_SIZE + 1]);

        assert_eq!(vm.mmap(&space, &file, BASE), Ok(0));
        assert_eq!(
            vm.mmap(&space, &file, BASE + PAGE_FRAME_SIZE),
            Err(VmError::AlreadyMapped)
        );

        // A page that is resident without a descriptor also blocks the map.
        let small: FileRef = MemFile::new(b"x");
        vm.handle_page_fault(&space, OFFSET - 4, OFFSET - 4).unwrap();
        assert_eq!(
            vm.mmap(&space, &small, OFFSET - PAGE_FRAME_SIZE),
            Err(VmError::AlreadyMapped)
        );
    }

    #[test]
    fn ids_are_never_reused() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        let file: FileRef = MemFile::new(b"x");

        assert_eq!(vm.mmap(&space, &file, BASE), Ok(0));
        vm.munmap(&space, 0).unwrap();
        assert_eq!(vm.mmap(&space, &file, BASE), Ok(1));
    }

    #[test]
    fn map_splits_file_into_pages() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        let file = MemFile::new(&[9; 2 * PAGE_FRAME_SIZE + 100]);
        let id = vm.mmap(&space, &(file.clone() as FileRef), BASE).unwrap();

        assert_eq!(space.mmaps().get(id).unwrap().page_count, 3);
        assert_eq!(file.open_handles(), 2);

        let pages = space.pages();
        let last = pages.lookup(BASE + 2 * PAGE_FRAME_SIZE).unwrap();
        let segment = last.kind.segment().unwrap();
        assert!(last.kind.is_mmap());
        assert_eq!(segment.offset, 2 * PAGE_FRAME_SIZE as u64);
        assert_eq!(segment.read_bytes, 100);
        assert_eq!(segment.zero_bytes, PAGE_FRAME_SIZE - 100);
        // The mapping ends with the file.
        assert!(pages.lookup(BASE + 3 * PAGE_FRAME_SIZE).is_none());
    }

    #[test]
    fn write_back_on_unmap() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        let file = MemFile::new(b"0123456789");
        let id = vm.mmap(&space, &(file.clone() as FileRef), BASE).unwrap();

        vm.handle_page_fault(&space, BASE, 0).unwrap();
        let mut read = [0u8; 12];
        vm.copy_from_user(&space, BASE, &mut read).unwrap();
        assert_eq!(&read, b"0123456789\0\0");

        vm.copy_to_user(&space, BASE + 1, b"X").unwrap();
        vm.munmap(&space, id).unwrap();

        let contents = file.contents();
        assert_eq!(contents.len(), PAGE_FRAME_SIZE);
        assert_eq!(&contents[..10], b"0X23456789");
        assert!(contents[10..].iter().all(|&b| b == 0));

        assert_eq!(file.open_handles(), 1);
        assert!(space.pages().is_empty());
        assert_eq!(space.page_dir().get_page(BASE), None);
        assert!(vm.frames().is_empty());
    }

    #[test]
    fn clean_pages_are_not_written() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        let file = MemFile::new(b"clean");
        let id = vm.mmap(&space, &(file.clone() as FileRef), BASE).unwrap();

        let mut read = [0u8; 5];
        vm.copy_from_user(&space, BASE, &mut read).unwrap();
        vm.munmap(&space, id).unwrap();
        assert_eq!(file.contents(), b"clean");
    }

    #[test]
    fn unmap_twice_is_a_no_op() {
        let vm = virtual_memory(4, 4);
        let space = address_space(1);
        let file: FileRef = MemFile::new(b"abc");
        let id = vm.mmap(&space, &file, BASE).unwrap();

        assert_eq!(vm.munmap(&space, id), Ok(()));
        assert_eq!(vm.munmap(&space, id), Ok(()));
        assert_eq!(vm.munmap(&space, 42), Ok(()));
    }

    #[test]
    fn evicted_dirty_page_reaches_file_before_unmap() {
        let vm = virtual_memory(1, 4);
        let space = address_space(1);
        let file = MemFile::new(b"hello");
        vm.mmap(&space, &(file.clone() as FileRef), BASE).unwrap();
        vm.copy_to_user(&space, BASE, b"J").unwrap();

        // The only frame goes to a stack page; the dirty mapped page is
        // written back rather than swapped.
        vm.handle_page_fault(&space, OFFSET - 4, OFFSET - 4).unwrap();
        assert_eq!(&file.contents()[..5], b"Jello");
        assert_eq!(vm.swap().slots_in_use(), 0);

        let mut read = [0u8; 5];
        vm.copy_from_user(&space, BASE, &mut read).unwrap();
        assert_eq!(&read, b"Jello");
    }

    #[test]
    fn unmap_releases_swapped_mmap_pages() {
        let vm = virtual_memory(1, 4);
        let space = address_space(1);
        let file: FileRef = MemFile::new(b"data");
        let id = vm.mmap(&space, &file, BASE).unwrap();

        let mut read = [0u8; 4];
        vm.copy_from_user(&space, BASE, &mut read).unwrap();
        // A clean mapped page goes to swap when evicted.
        vm.handle_page_fault(&space, OFFSET - 4, OFFSET - 4).unwrap();
        assert_eq!(vm.swap().slots_in_use(), 1);
        assert!(matches!(
            space.pages().lookup(BASE).unwrap().kind,
            PageKind::MmapBackedPendingRestore { .. }
        ));

        vm.munmap(&space, id).unwrap();
        assert_eq!(vm.swap().slots_in_use(), 0);
    }
}
