#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for KidneyOS user processes: the frame table
//! and its clock eviction, per-process supplemental page tables, the swap
//! partition, and memory-mapped files.

extern crate alloc;

pub mod block;
pub mod config;
pub mod drivers;
pub mod error;
pub mod file;
pub mod mem;
pub mod paging;
pub mod process;
pub mod sync;
pub mod system;

#[cfg(test)]
mod test_support;

pub use config::VmConfig;
pub use error::{Result, VmError};
pub use process::{AddressSpace, Pid};
pub use system::VirtualMemory;
