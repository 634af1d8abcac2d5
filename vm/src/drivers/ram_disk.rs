use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::mutex::Mutex;
use alloc::{vec, vec::Vec};

/// A block device backed by kernel memory.
///
/// Stands in for the swap partition during bring-up and in tests.
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sector_count: BlockSector) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sector_count as usize * BLOCK_SECTOR_SIZE]),
        }
    }

    fn range(&self, sector: BlockSector) -> core::ops::Range<usize> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        start..start + BLOCK_SECTOR_SIZE
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let sectors = self.sectors.lock();
        let src = sectors
            .get(self.range(sector))
            .ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = self.range(sector);
        let mut sectors = self.sectors.lock();
        let dst = sectors.get_mut(range).ok_or(BlockError::WriteError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}
