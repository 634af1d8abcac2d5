use super::physical::Page;
use crate::block::block_core::{Block, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::error::{Result, VmError};
use crate::sync::mutex::Mutex;
use kidneyos_shared::bitmap::Bitmap;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;
use log::{info, trace};

const SECTORS_IN_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;

/// Index of a page-sized slot on the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    #[cfg(test)]
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    // Slot indices come from a bitmap sized to the device, whose sector count
    // fits in a `BlockSector`.
    #[allow(clippy::cast_possible_truncation)]
    fn first_sector(self) -> BlockSector {
        (self.0 * SECTORS_IN_PAGE) as BlockSector
    }
}

/// The swap partition, carved into page-sized slots.
///
/// Slot `i` occupies sectors `i * 8 .. i * 8 + 8`. There is no header. A set bit
/// in `slots` means the slot holds an evicted page.
pub struct SwapStore {
    device: Block,
    slots: Mutex<Bitmap>,
}

impl SwapStore {
    /// Bind the swap device and mark every slot free.
    pub fn new(device: Block) -> Self {
        assert_eq!(
            device.get_type(),
            BlockType::Swap,
            "{} is not a swap device",
            device.get_name()
        );
        let slot_count = device.get_size() as usize / SECTORS_IN_PAGE;
        info!("swap: {} with {} slots", device.get_name(), slot_count);

        Self {
            device,
            slots: Mutex::new(Bitmap::new(slot_count)),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().count_ones()
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        self.slots.lock().test(slot.0)
    }

    /// Claim a free slot and write `page` into it.
    ///
    /// # Errors
    ///
    /// [`VmError::SwapExhausted`] if every slot is taken, or the device error
    /// if the write fails (the slot is released again in that case).
    pub fn reserve_and_write(&self, page: &Page) -> Result<SwapSlot> {
        let slot = self
            .slots
            .lock()
            .scan_and_flip(false)
            .map(SwapSlot)
            .ok_or(VmError::SwapExhausted)?;

        let sector = slot.first_sector();
        for (sector, chunk) in (sector..).zip(page.0.chunks_exact(BLOCK_SECTOR_SIZE)) {
            if let Err(e) = self.device.write(sector, chunk) {
                self.release(slot);
                return Err(e.into());
            }
        }

        trace!("swap: wrote slot {}", slot.0);
        Ok(slot)
    }

    /// Read the page stored in `slot` into `dest` and free the slot.
    ///
    /// On a device error the slot stays claimed.
    pub fn read_and_release(&self, slot: SwapSlot, dest: &mut Page) -> Result<()> {
        let sector = slot.first_sector();
        for (sector, chunk) in (sector..).zip(dest.0.chunks_exact_mut(BLOCK_SECTOR_SIZE)) {
            self.device.read(sector, chunk)?;
        }

        self.release(slot);
        trace!("swap: read slot {}", slot.0);
        Ok(())
    }

    /// Free `slot` without reading it.
    pub fn release(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        assert!(slots.test(slot.0), "swap slot {} released twice", slot.0);
        slots.set(slot.0, false);
    }
}
