use crate::block::block_error::BlockError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// No supplemental page table entry covers the address.
    #[error("no page descriptor for address")]
    NotFound,
    /// The page already has a descriptor or a hardware mapping.
    #[error("page is already mapped")]
    AlreadyMapped,
    #[error("address is null or outside user space")]
    BadAddress,
    #[error("address is not page aligned")]
    Misaligned,
    #[error("console streams cannot be memory mapped")]
    ConsoleMapping,
    #[error("cannot map an empty file")]
    EmptyFile,
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("short write: expected {expected} bytes, wrote {actual}")]
    ShortWrite { expected: usize, actual: usize },
    #[error("could not reopen file for mapping")]
    ReopenFailed,
    /// The page has no frame in the frame table.
    #[error("page is not resident")]
    NotResident,
    #[error("write to read-only page")]
    ReadOnly,
    /// A descriptor or frame entry is not in a state the operation accepts,
    /// such as unpinning a frame that holds no pin.
    #[error("page in unexpected state")]
    InvalidState,
    #[error("swap space exhausted")]
    SwapExhausted,
    #[error("no evictable frame after a full clock sweep")]
    NoVictim,
    #[error("block device error: {0}")]
    Block(#[from] BlockError),
}

pub type Result<T> = core::result::Result<T, VmError>;
