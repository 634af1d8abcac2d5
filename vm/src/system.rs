use crate::block::block_core::Block;
use crate::config::VmConfig;
use crate::mem::frame_table::FrameTable;
use crate::mem::physical::PhysicalMemory;
use crate::mem::swap::SwapStore;
use crate::paging::PageDirectory;
use crate::process::{AddressSpace, Pid};
use alloc::boxed::Box;
use alloc::sync::Arc;
use log::{info, warn};
use once_cell::race::OnceBox;

/// The virtual memory subsystem: the user frame pool with its frame table, and
/// the swap partition.
///
/// One instance is built at boot and shared by every process.
pub struct VirtualMemory {
    frames: FrameTable,
    swap: SwapStore,
    config: VmConfig,
}

impl VirtualMemory {
    pub fn new(memory: PhysicalMemory, swap_device: Block, config: VmConfig) -> Self {
        let swap = SwapStore::new(swap_device);
        let frames = FrameTable::new(memory, config.clock_revolutions);
        info!(
            "virtual memory: {} frames, {} swap slots",
            frames.memory().frame_count(),
            swap.slot_count()
        );
        Self {
            frames,
            swap,
            config,
        }
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Start a process with an empty page table and no mappings.
    pub fn create_address_space(
        &self,
        pid: Pid,
        page_dir: Box<dyn PageDirectory>,
    ) -> Arc<AddressSpace> {
        AddressSpace::new(pid, page_dir)
    }

    /// Tear down `space` when its process exits.
    ///
    /// Mapped files are flushed first, so no dirty page is lost. Then every
    /// frame goes back to the pool and every swap slot is released.
    pub fn exit(&self, space: &Arc<AddressSpace>) {
        let ids = space.mmaps().ids();
        for id in ids {
            if let Err(e) = self.munmap(space, id) {
                warn!("process {}: unmapping {id} at exit: {e}", space.pid());
            }
        }

        let _faults = space.lock_faults();
        self.frames.release_owner(space);
        space.pages().destroy(&self.swap);
    }
}

static VIRTUAL_MEMORY: OnceBox<VirtualMemory> = OnceBox::new();

/// Make `vm` the system's virtual memory, reachable from trap handlers.
///
/// # Panics
///
/// If called more than once.
pub fn install(vm: VirtualMemory) -> &'static VirtualMemory {
    if VIRTUAL_MEMORY.set(Box::new(vm)).is_err() {
        panic!("virtual memory initialized twice");
    }
    get()
}

/// The virtual memory installed at boot.
pub fn get() -> &'static VirtualMemory {
    let Some(vm) = VIRTUAL_MEMORY.get() else {
        panic!("virtual memory not initialized");
    };
    vm
}
