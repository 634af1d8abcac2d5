//! The global frame table: which address space and page every user frame
//! currently backs.

mod clock;

use super::physical::{Frame, PhysicalMemory};
use super::swap::SwapStore;
use crate::error::{Result, VmError};
use crate::process::AddressSpace;
use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::sync::Arc;
use alloc::vec::Vec;
use log::{info, trace};

pub use clock::ClockHand;

/// Proof that the caller holds the eviction lock.
pub type EvictionGuard<'a> = MutexGuard<'a, ClockHand>;

pub struct FrameEntry {
    owner: Arc<AddressSpace>,
    upage: usize,
    /// Outstanding pins. A frame with any pin is never chosen for eviction.
    pin_count: usize,
    /// Set while the frame's contents are being persisted. The owner's mapping
    /// may already be gone.
    evicting: bool,
}

impl FrameEntry {
    fn new(owner: &Arc<AddressSpace>, upage: usize) -> Self {
        Self {
            owner: owner.clone(),
            upage,
            pin_count: 1,
            evicting: false,
        }
    }

    fn is(&self, owner: &Arc<AddressSpace>, upage: usize) -> bool {
        Arc::ptr_eq(&self.owner, owner) && self.upage == upage
    }

    fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// Every frame of the user pool, indexed by frame number.
///
/// `entries` is held only for bookkeeping, never across I/O. `clock` is the
/// eviction lock: at most one eviction is in flight, and a frame is handed to
/// its next owner only after its old contents are persisted.
pub struct FrameTable {
    memory: PhysicalMemory,
    entries: Mutex<Vec<Option<FrameEntry>>>,
    clock: Mutex<ClockHand>,
    revolutions: usize,
}

impl FrameTable {
    pub fn new(memory: PhysicalMemory, revolutions: usize) -> Self {
        let frame_count = memory.frame_count();
        info!("frame table: {} user frames", frame_count);

        let mut entries = Vec::with_capacity(frame_count);
        entries.resize_with(frame_count, || None);

        Self {
            memory,
            entries: Mutex::new(entries),
            clock: Mutex::new(ClockHand::default()),
            revolutions,
        }
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Number of frames currently assigned to a page.
    pub fn len(&self) -> usize {
        self.entries.lock().iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames assigned to `owner`, with the page each one backs.
    pub fn frames_of(&self, owner: &Arc<AddressSpace>) -> Vec<(Frame, usize)> {
        self.entries
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let entry = entry.as_ref()?;
                Arc::ptr_eq(&entry.owner, owner).then(|| (self.memory.frame_at(index), entry.upage))
            })
            .collect()
    }

    /// Get a frame for `upage` of `owner`, evicting another page if the pool is
    /// empty.
    ///
    /// The frame comes back pinned; unpin it once the mapping is installed. If
    /// `zero_fill` is set its contents are zeroed.
    ///
    /// # Panics
    ///
    /// If the pool is empty and no page can be evicted, or the victim cannot be
    /// persisted. There is no other place to reclaim memory from.
    pub fn allocate(
        &self,
        swap: &SwapStore,
        owner: &Arc<AddressSpace>,
        upage: usize,
        zero_fill: bool,
    ) -> Frame {
        if let Some(frame) = self.try_allocate(owner, upage) {
            if zero_fill {
                self.memory.contents(frame).zero();
            }
            return frame;
        }

        match self.evict(swap, owner, upage) {
            Ok(frame) => frame,
            Err(e) => panic!(
                "cannot allocate a frame for {upage:#X} of process {}: {e}",
                owner.pid()
            ),
        }
    }

    fn try_allocate(&self, owner: &Arc<AddressSpace>, upage: usize) -> Option<Frame> {
        let frame = self.memory.alloc()?;
        let index = self.memory.index_of(frame);
        let mut entries = self.entries.lock();
        debug_assert!(entries[index].is_none());
        entries[index] = Some(FrameEntry::new(owner, upage));
        Some(frame)
    }

    /// Remove `frame` from the table and return it to the pool.
    pub fn free(&self, owner: &Arc<AddressSpace>, frame: Frame) {
        let index = self.memory.index_of(frame);
        {
            let mut entries = self.entries.lock();
            let entry = entries[index].take();
            assert!(
                entry
                    .as_ref()
                    .is_some_and(|e| Arc::ptr_eq(&e.owner, owner) && !e.evicting),
                "frame {:#X} freed by a process that does not own it",
                frame.addr()
            );
        }
        self.memory.dealloc(frame);
    }

    /// Keep the frame backing `upage` from being evicted.
    ///
    /// Pins nest: the frame stays pinned until every pin has been matched by
    /// an [`unpin`](Self::unpin).
    ///
    /// Returns the frame, or [`VmError::NotResident`] if the page has no frame.
    /// A page caught mid-eviction is waited for and reported not resident.
    pub fn pin(&self, owner: &Arc<AddressSpace>, upage: usize) -> Result<Frame> {
        self.update_pins(owner, upage, |count| {
            *count += 1;
            Ok(())
        })
    }

    /// Drop one pin on the frame backing `upage`.
    ///
    /// Fails with [`VmError::InvalidState`] if the frame holds no pin.
    pub fn unpin(&self, owner: &Arc<AddressSpace>, upage: usize) -> Result<()> {
        self.update_pins(owner, upage, |count| {
            *count = count.checked_sub(1).ok_or(VmError::InvalidState)?;
            Ok(())
        })
        .map(|_| ())
    }

    fn update_pins(
        &self,
        owner: &Arc<AddressSpace>,
        upage: usize,
        update: impl FnOnce(&mut usize) -> Result<()>,
    ) -> Result<Frame> {
        let frame = owner
            .page_dir()
            .get_page(upage)
            .and_then(|addr| self.memory.frame_containing(addr));

        let mut entries = self.entries.lock();
        if let Some(frame) = frame {
            let index = self.memory.index_of(frame);
            if let Some(entry) = entries[index].as_mut().filter(|e| e.is(owner, upage)) {
                if !entry.evicting {
                    update(&mut entry.pin_count)?;
                    return Ok(frame);
                }
            }
        }

        let evicting = entries
            .iter()
            .flatten()
            .any(|e| e.evicting && e.is(owner, upage));
        drop(entries);
        if evicting {
            self.wait_for_eviction();
        }
        Err(VmError::NotResident)
    }

    /// Block until any eviction in flight has finished.
    pub fn wait_for_eviction(&self) {
        drop(self.clock.lock());
    }

    /// Take back every frame `owner` holds, clearing its mappings.
    pub fn release_owner(&self, owner: &Arc<AddressSpace>) {
        let mut released = Vec::new();
        loop {
            let mut entries = self.entries.lock();
            if entries
                .iter()
                .flatten()
                .any(|e| e.evicting && Arc::ptr_eq(&e.owner, owner))
            {
                drop(entries);
                self.wait_for_eviction();
                continue;
            }

            for (index, slot) in entries.iter_mut().enumerate() {
                if slot.as_ref().is_some_and(|e| Arc::ptr_eq(&e.owner, owner)) {
                    if let Some(entry) = slot.take() {
                        owner.page_dir().clear_page(entry.upage);
                    }
                    released.push(self.memory.frame_at(index));
                }
            }
            break;
        }

        trace!("released {} frames of process {}", released.len(), owner.pid());
        for frame in released {
            self.memory.dealloc(frame);
        }
    }

    /// Reclaim an assigned frame for `upage` of `owner`.
    fn evict(&self, swap: &SwapStore, owner: &Arc<AddressSpace>, upage: usize) -> Result<Frame> {
        let mut hand = self.clock.lock();

        // A frame may have been freed while we waited for the lock.
        if let Some(frame) = self.try_allocate(owner, upage) {
            self.memory.contents(frame).zero();
            return Ok(frame);
        }

        let (index, victim, victim_page) = {
            let mut entries = self.entries.lock();
            let index = hand.select_victim(&entries, self.revolutions)?;
            let Some(entry) = entries[index].as_mut() else {
                return Err(VmError::NoVictim);
            };
            entry.evicting = true;
            (index, entry.owner.clone(), entry.upage)
        };

        let frame = self.memory.frame_at(index);
        trace!(
            "evicting {victim_page:#X} of process {} from frame {:#X}",
            victim.pid(),
            frame.addr()
        );
        clock::persist(&hand, &self.memory, swap, &victim, victim_page, frame)?;

        self.entries.lock()[index] = Some(FrameEntry::new(owner, upage));
        Ok(frame)
    }
}
