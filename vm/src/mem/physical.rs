//! The user frame pool: the physical pages handed out to user address spaces.

use crate::sync::mutex::{Mutex, MutexGuard};
use alloc::boxed::Box;
use alloc::vec;
use bitbybit::bitfield;
use kidneyos_shared::mem::{is_page_aligned, PAGE_FRAME_SIZE};
use zerocopy::{FromBytes, FromZeroes};

/// Contents of one physical page.
#[derive(FromZeroes, FromBytes)]
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_FRAME_SIZE]);

impl Page {
    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}

/// Physical address of a page frame in the user pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame(usize);

impl Frame {
    pub const fn addr(self) -> usize {
        self.0
    }
}

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// Next-fit placement over single frames.
#[derive(Default)]
struct NextFit {
    /// The next frame number to start searching for a free frame.
    position: usize,
}

impl NextFit {
    fn place(&mut self, core_map: &[CoreMapEntry]) -> Option<usize> {
        let total_frames = core_map.len();
        let found = (0..total_frames)
            .map(|i| (self.position + i) % total_frames)
            .find(|&i| !core_map[i].allocated())?;
        self.position = (found + 1) % total_frames;
        Some(found)
    }
}

struct FramePool {
    core_map: Box<[CoreMapEntry]>,
    placement: NextFit,
    frames_allocated: usize,
}

/// A run of physical frames starting at `base`, with the core map that
/// records which of them are handed out.
pub struct PhysicalMemory {
    base: usize,
    frames: Box<[Mutex<Page>]>,
    pool: Mutex<FramePool>,
}

impl PhysicalMemory {
    pub fn new(base: usize, frame_count: usize) -> Self {
        assert!(is_page_aligned(base), "frame pool base {base:#X} not aligned");

        let frames = (0..frame_count)
            .map(|_| Mutex::new(Page::new_zeroed()))
            .collect();

        Self {
            base,
            frames,
            pool: Mutex::new(FramePool {
                core_map: vec![CoreMapEntry::DEFAULT; frame_count].into_boxed_slice(),
                placement: NextFit::default(),
                frames_allocated: 0,
            }),
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.pool.lock().frames_allocated
    }

    /// Take a free frame out of the pool, or `None` if every frame is in use.
    pub fn alloc(&self) -> Option<Frame> {
        let mut pool = self.pool.lock();
        let FramePool {
            core_map,
            placement,
            frames_allocated,
        } = &mut *pool;

        let index = placement.place(&core_map[..])?;
        core_map[index] = core_map[index].with_allocated(true);
        *frames_allocated += 1;
        Some(self.frame_at(index))
    }

    /// Return `frame` to the pool.
    pub fn dealloc(&self, frame: Frame) {
        let index = self.index_of(frame);
        let mut pool = self.pool.lock();
        assert!(
            pool.core_map[index].allocated(),
            "double free of frame {:#X}",
            frame.addr()
        );
        pool.core_map[index] = pool.core_map[index].with_allocated(false);
        pool.frames_allocated -= 1;
    }

    pub fn index_of(&self, frame: Frame) -> usize {
        let index = (frame.addr() - self.base) / PAGE_FRAME_SIZE;
        assert!(index < self.frames.len(), "{:#X} outside pool", frame.addr());
        index
    }

    pub fn frame_at(&self, index: usize) -> Frame {
        Frame(self.base + index * PAGE_FRAME_SIZE)
    }

    /// The frame whose physical address is `addr`, if it belongs to this pool.
    pub fn frame_containing(&self, addr: usize) -> Option<Frame> {
        let index = addr.checked_sub(self.base)? / PAGE_FRAME_SIZE;
        (index < self.frames.len()).then(|| self.frame_at(index))
    }

    /// Lock the contents of `frame`.
    pub fn contents(&self, frame: Frame) -> MutexGuard<Page> {
        self.frames[self.index_of(frame)].lock()
    }
}
