//! Files as seen by the VM core: a source of page contents and a target for
//! write-back.

use crate::sync::mutex::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

/// An open file that pages can be read from and written back to.
///
/// Transfers report how many bytes were moved; a count below the requested
/// length is a short transfer.
pub trait BackingFile: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize;
    fn write_at(&self, offset: u64, buf: &[u8]) -> usize;
    /// Length of the file in bytes.
    fn length(&self) -> u64;
    /// Open an independent handle to the same file.
    fn reopen(&self) -> Option<FileRef>;
    /// Whether this handle is the console's input or output stream.
    fn is_console(&self) -> bool {
        false
    }
}

pub type FileRef = Arc<dyn BackingFile>;

#[derive(Default)]
struct MemInode {
    data: Mutex<Vec<u8>>,
    open_handles: AtomicUsize,
}

/// A handle to a file held entirely in kernel memory.
///
/// Handles opened with [`BackingFile::reopen`] share contents. The handle count
/// drops when a handle is dropped, which is how a mapping's close is observed.
pub struct MemFile {
    inode: Arc<MemInode>,
}

impl MemFile {
    pub fn new(contents: &[u8]) -> Arc<Self> {
        let inode = Arc::new(MemInode {
            data: Mutex::new(contents.to_vec()),
            open_handles: AtomicUsize::new(0),
        });
        Arc::new(Self::open(inode))
    }

    fn open(inode: Arc<MemInode>) -> Self {
        inode.open_handles.fetch_add(1, Ordering::SeqCst);
        Self { inode }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }

    /// Number of live handles to this file.
    pub fn open_handles(&self) -> usize {
        self.inode.open_handles.load(Ordering::SeqCst)
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.inode.open_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackingFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let data = self.inode.data.lock();
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let Some(src) = data.get(start..) else {
            return 0;
        };
        let count = src.len().min(buf.len());
        buf[..count].copy_from_slice(&src[..count]);
        count
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> usize {
        let Ok(start) = usize::try_from(offset) else {
            return 0;
        };
        let mut data = self.inode.data.lock();
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        buf.len()
    }

    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn reopen(&self) -> Option<FileRef> {
        Some(Arc::new(Self::open(self.inode.clone())))
    }
}

/// The console's standard streams. They have no pages to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdin,
    Stdout,
}

impl BackingFile for Console {
    fn read_at(&self, _offset: u64, _buf: &mut [u8]) -> usize {
        0
    }

    fn write_at(&self, _offset: u64, _buf: &[u8]) -> usize {
        0
    }

    fn length(&self) -> u64 {
        0
    }

    fn reopen(&self) -> Option<FileRef> {
        Some(Arc::new(*self))
    }

    fn is_console(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopened_handles_share_contents() {
        let file = MemFile::new(b"hello");
        let other = file.reopen().unwrap();
        assert_eq!(file.open_handles(), 2);

        assert_eq!(other.write_at(1, b"EL"), 2);
        assert_eq!(file.contents(), b"hELlo");

        drop(other);
        assert_eq!(file.open_handles(), 1);
    }

    #[test]
    fn reads_stop_at_end_of_file() {
        let file = MemFile::new(b"abc");
        let mut buf = [0u8; 8];
        assert_eq!(file.read_at(1, &mut buf), 2);
        assert_eq!(&buf[..2], b"bc");
        assert_eq!(file.read_at(10, &mut buf), 0);
    }

    #[test]
    fn writes_past_end_extend_the_file() {
        let file = MemFile::new(b"ab");
        assert_eq!(file.write_at(4, b"z"), 1);
        assert_eq!(file.contents(), b"ab\0\0z");
        assert_eq!(file.length(), 5);
    }
}
