//! The supplemental page table: for every user page that is not guaranteed to
//! be resident, where its contents live.

use super::physical::Page;
use super::swap::{SwapSlot, SwapStore};
use crate::error::{Result, VmError};
use crate::file::FileRef;
use alloc::collections::BTreeMap;
use core::fmt;
use kidneyos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};
use log::warn;

/// A page-sized window onto a file: `read_bytes` from `offset`, then
/// `zero_bytes` of zero fill.
#[derive(Clone)]
pub struct FileSegment {
    pub file: FileRef,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl fmt::Debug for FileSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSegment")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

impl FileSegment {
    /// Fill `page` from the file, zeroing everything past `read_bytes`.
    pub fn load_into(&self, page: &mut Page) -> Result<()> {
        debug_assert_eq!(self.read_bytes + self.zero_bytes, PAGE_FRAME_SIZE);
        let actual = self.file.read_at(self.offset, &mut page.0[..self.read_bytes]);
        if actual != self.read_bytes {
            warn!(
                "short read at offset {}: {actual} of {} bytes",
                self.offset, self.read_bytes
            );
            return Err(VmError::ShortRead {
                expected: self.read_bytes,
                actual,
            });
        }
        page.0[self.read_bytes..].fill(0);
        Ok(())
    }

    /// Write the whole of `page` back to the file at this segment's offset.
    pub fn write_back(&self, page: &Page) -> Result<()> {
        let actual = self.file.write_at(self.offset, &page.0);
        if actual != PAGE_FRAME_SIZE {
            return Err(VmError::ShortWrite {
                expected: PAGE_FRAME_SIZE,
                actual,
            });
        }
        Ok(())
    }
}

/// Where a page's contents come from the next time it is faulted in.
///
/// | kind                         | swapped out to `slot`        | restored                 |
/// |------------------------------|------------------------------|--------------------------|
/// | `Resident`                   | `Swapped`                    | -                        |
/// | `Swapped`                    | -                            | descriptor removed       |
/// | `FileBacked`                 | `FileBackedPendingRestore`   | `FileBacked`             |
/// | `MmapBacked`                 | `MmapBackedPendingRestore`   | `MmapBacked`             |
/// | `FileBackedPendingRestore`   | -                            | `FileBacked`, from swap  |
/// | `MmapBackedPendingRestore`   | -                            | `MmapBacked`, from file  |
///
/// A clean `FileBacked` page is never swapped; eviction just drops it. A dirty
/// `MmapBacked` page is written back to its file and keeps its kind.
#[derive(Clone, Debug)]
pub enum PageKind {
    /// An anonymous page with no backing store. Only seen while its frame is
    /// being evicted.
    Resident,
    Swapped {
        slot: SwapSlot,
    },
    FileBacked(FileSegment),
    MmapBacked(FileSegment),
    FileBackedPendingRestore {
        segment: FileSegment,
        slot: SwapSlot,
    },
    MmapBackedPendingRestore {
        segment: FileSegment,
        slot: SwapSlot,
    },
}

impl PageKind {
    pub fn segment(&self) -> Option<&FileSegment> {
        match self {
            Self::Resident | Self::Swapped { .. } => None,
            Self::FileBacked(segment)
            | Self::MmapBacked(segment)
            | Self::FileBackedPendingRestore { segment, .. }
            | Self::MmapBackedPendingRestore { segment, .. } => Some(segment),
        }
    }

    /// The swap slot this page's contents are parked in, if any.
    pub fn slot(&self) -> Option<SwapSlot> {
        match self {
            Self::Swapped { slot }
            | Self::FileBackedPendingRestore { slot, .. }
            | Self::MmapBackedPendingRestore { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    pub fn is_mmap(&self) -> bool {
        matches!(
            self,
            Self::MmapBacked(_) | Self::MmapBackedPendingRestore { .. }
        )
    }

    /// The kind after the page's contents were written to `slot`, plus the slot
    /// it previously held, which the caller must release.
    pub fn swapped_out(self, slot: SwapSlot) -> (Self, Option<SwapSlot>) {
        match self {
            Self::Resident => (Self::Swapped { slot }, None),
            Self::Swapped { slot: stale } => (Self::Swapped { slot }, Some(stale)),
            Self::FileBacked(segment) => (Self::FileBackedPendingRestore { segment, slot }, None),
            Self::MmapBacked(segment) => (Self::MmapBackedPendingRestore { segment, slot }, None),
            Self::FileBackedPendingRestore {
                segment,
                slot: stale,
            } => (Self::FileBackedPendingRestore { segment, slot }, Some(stale)),
            Self::MmapBackedPendingRestore {
                segment,
                slot: stale,
            } => (Self::MmapBackedPendingRestore { segment, slot }, Some(stale)),
        }
    }
}

/// One entry of the supplemental page table.
#[derive(Clone, Debug)]
pub struct PageDescriptor {
    pub upage: usize,
    pub kind: PageKind,
    pub writable: bool,
    /// Whether the page currently has a frame and a hardware mapping.
    pub loaded: bool,
}

impl PageDescriptor {
    pub fn new(upage: usize, kind: PageKind, writable: bool) -> Self {
        debug_assert!(is_page_aligned(upage));
        Self {
            upage,
            kind,
            writable,
            loaded: false,
        }
    }
}

/// Per-process map from user page to [`PageDescriptor`].
#[derive(Debug, Default)]
pub struct SupPageTable {
    pages: BTreeMap<usize, PageDescriptor>,
}

impl SupPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn lookup(&self, upage: usize) -> Option<&PageDescriptor> {
        self.pages.get(&upage)
    }

    pub fn lookup_mut(&mut self, upage: usize) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&upage)
    }

    /// Add `descriptor`, refusing to replace an existing one.
    pub fn insert(&mut self, descriptor: PageDescriptor) -> Result<()> {
        if self.pages.contains_key(&descriptor.upage) {
            return Err(VmError::AlreadyMapped);
        }
        self.pages.insert(descriptor.upage, descriptor);
        Ok(())
    }

    pub fn remove(&mut self, upage: usize) -> Option<PageDescriptor> {
        self.pages.remove(&upage)
    }

    /// The descriptor for `upage`, creating one with `kind` if there is none.
    pub fn get_or_insert(
        &mut self,
        upage: usize,
        kind: PageKind,
        writable: bool,
    ) -> &mut PageDescriptor {
        self.pages
            .entry(upage)
            .or_insert_with(|| PageDescriptor::new(upage, kind, writable))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageDescriptor> {
        self.pages.values()
    }

    /// Describe an executable segment lazily: `read_bytes` from `file` at
    /// `offset` followed by `zero_bytes` of zeros, starting at `upage`.
    pub fn add_file_segment(
        &mut self,
        file: &FileRef,
        mut offset: u64,
        mut upage: usize,
        mut read_bytes: usize,
        mut zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        if !is_page_aligned(upage) || (read_bytes + zero_bytes) % PAGE_FRAME_SIZE != 0 {
            return Err(VmError::Misaligned);
        }

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PAGE_FRAME_SIZE);
            let page_zero_bytes = PAGE_FRAME_SIZE - page_read_bytes;

            let segment = FileSegment {
                file: file.clone(),
                offset,
                read_bytes: page_read_bytes,
                zero_bytes: page_zero_bytes,
            };
            self.insert(PageDescriptor::new(
                upage,
                PageKind::FileBacked(segment),
                writable,
            ))?;

            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            offset += page_read_bytes as u64;
            upage += PAGE_FRAME_SIZE;
        }
        Ok(())
    }

    /// Release every swap slot still referenced and drop all descriptors.
    pub fn destroy(&mut self, swap: &SwapStore) {
        for (_, descriptor) in core::mem::take(&mut self.pages) {
            if let Some(slot) = descriptor.kind.slot() {
                swap.release(slot);
            }
        }
    }
}
