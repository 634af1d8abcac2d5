//! Builders for the in-memory collaborators the unit tests run against.

use crate::block::block_core::{Block, BlockDriver, BlockSector, BlockType, BLOCK_SECTOR_SIZE};
use crate::config::VmConfig;
use crate::drivers::ram_disk::RamDisk;
use crate::mem::physical::{Frame, PhysicalMemory};
use crate::mem::swap::SwapStore;
use crate::paging::SoftPageDirectory;
use crate::process::{AddressSpace, Pid};
use crate::system::VirtualMemory;
use alloc::boxed::Box;
use alloc::sync::Arc;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

pub(crate) const POOL_BASE: usize = 0x0100_0000;

pub(crate) fn swap_device(slots: u32) -> Block {
    let sectors = slots * (PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE) as BlockSector;
    Block::new(
        BlockType::Swap,
        "swap",
        sectors,
        BlockDriver::Ram(RamDisk::new(sectors)),
    )
}

pub(crate) fn swap_store(slots: u32) -> SwapStore {
    SwapStore::new(swap_device(slots))
}

pub(crate) fn virtual_memory(frames: usize, swap_slots: u32) -> VirtualMemory {
    VirtualMemory::new(
        PhysicalMemory::new(POOL_BASE, frames),
        swap_device(swap_slots),
        VmConfig::default(),
    )
}

pub(crate) fn address_space(pid: Pid) -> Arc<AddressSpace> {
    AddressSpace::new(pid, Box::new(SoftPageDirectory::new()))
}

/// Install a writable mapping of `frame` at `upage`.
pub(crate) fn map_frame(space: &AddressSpace, upage: usize, frame: Frame) {
    assert!(space.page_dir().set_page(upage, frame.addr(), true));
}
