//! Second-chance victim selection and the persistence of the victim's page.

use super::{EvictionGuard, FrameEntry};
use crate::error::{Result, VmError};
use crate::mem::page::PageKind;
use crate::mem::physical::{Frame, PhysicalMemory};
use crate::mem::swap::SwapStore;
use crate::process::AddressSpace;
use log::debug;

/// The clock hand: index of the next frame table entry to examine.
///
/// Lives behind the eviction lock, so the position survives between evictions
/// no matter how the table changes in between.
#[derive(Debug, Default)]
pub struct ClockHand {
    cursor: usize,
}

impl ClockHand {
    /// Sweep the table from the current position and return the index of the
    /// first unpinned entry whose accessed bit is clear.
    ///
    /// Entries with the accessed bit set get it cleared and are passed over.
    /// Gives up after `revolutions` full sweeps.
    pub(super) fn select_victim(
        &mut self,
        entries: &[Option<FrameEntry>],
        revolutions: usize,
    ) -> Result<usize> {
        let total = entries.len();
        for _ in 0..total * revolutions {
            let index = self.cursor;
            self.cursor = (self.cursor + 1) % total;

            let Some(entry) = &entries[index] else {
                continue;
            };
            if entry.is_pinned() || entry.evicting {
                continue;
            }

            let page_dir = entry.owner.page_dir();
            if page_dir.is_accessed(entry.upage) {
                page_dir.set_accessed(entry.upage, false);
                continue;
            }
            return Ok(index);
        }
        Err(VmError::NoVictim)
    }
}

/// Save the contents of `frame`, which backs `upage` of `victim`, so the frame
/// can be reused.
///
/// The mapping is cleared before the contents are read, so the victim cannot
/// write to the page while it is being saved; its next access faults and waits
/// on its fault lock or finds the updated descriptor.
pub(super) fn persist(
    eviction: &EvictionGuard<'_>,
    memory: &PhysicalMemory,
    swap: &SwapStore,
    victim: &AddressSpace,
    upage: usize,
    frame: Frame,
) -> Result<()> {
    let mut pages = victim.pages_for_eviction(eviction);
    let page_dir = victim.page_dir();
    let dirty = page_dir.is_dirty(upage);
    let writable = page_dir.is_writable(upage);
    page_dir.clear_page(upage);

    let descriptor = pages.get_or_insert(upage, PageKind::Resident, writable);
    let mut contents = memory.contents(frame);

    let swap_out = match &descriptor.kind {
        PageKind::MmapBacked(segment) if dirty => {
            debug!("writing back {upage:#X} at offset {}", segment.offset);
            segment.write_back(&contents)?;
            false
        }
        // Clean executable pages are reread from their file.
        PageKind::FileBacked(_) => dirty,
        _ => true,
    };

    if swap_out {
        let slot = swap.reserve_and_write(&contents)?;
        debug!("swapped out {upage:#X} to slot {}", slot.index());
        let kind = core::mem::replace(&mut descriptor.kind, PageKind::Resident);
        let (kind, stale) = kind.swapped_out(slot);
        descriptor.kind = kind;
        if let Some(stale) = stale {
            swap.release(stale);
        }
    }

    contents.zero();
    descriptor.loaded = false;
    Ok(())
}
