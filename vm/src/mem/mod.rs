mod fault;
pub mod frame_table;
pub mod mmap;
pub mod page;
pub mod physical;
pub mod swap;
mod user;

pub use frame_table::FrameTable;
pub use mmap::MapId;
pub use page::{FileSegment, PageDescriptor, PageKind, SupPageTable};
pub use physical::{Frame, Page, PhysicalMemory};
pub use swap::{SwapSlot, SwapStore};
