use thiserror::Error;

/// Error type for block operations
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum BlockError {
    /// The sector is out of bounds (greater than the block size)
    #[error("sector out of bounds (greater than the block size)")]
    SectorOutOfBounds,
    /// The buffer has an invalid size (not `BLOCK_SECTOR_SIZE`)
    #[error("invalid buffer size (not `BLOCK_SECTOR_SIZE`)")]
    BufferInvalid,
    /// Error reading from the disk
    #[error("error reading from the block device")]
    ReadError,
    /// Error writing to the disk
    #[error("error writing to the block device")]
    WriteError,
    /// Attempted to write to a block owned by another operating system
    #[error("cannot write to foreign block")]
    ForeignWrite,
}
