//! Files that live in host memory.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{FileHandle, IoError};

/// Counters describing how a [`MemoryFile`] has been used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStats {
    /// Handles opened, including the first one.
    pub opens: usize,
    /// Handles closed.
    pub closes: usize,
    /// Read calls.
    pub reads: usize,
    /// Write calls.
    pub writes: usize,
}

impl FileStats {
    /// Returns the number of handles that are still open.
    pub fn open_handles(&self) -> usize {
        self.opens - self.closes
    }
}

#[derive(Default)]
struct Shared {
    data: Mutex<Vec<u8>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    reads: AtomicUsize,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

/// A handle to an in-memory file.
///
/// All handles opened from the same file share its contents and its [`FileStats`].
/// Writes never grow the file.
pub struct MemoryFile {
    shared: Arc<Shared>,
    position: usize,
}

impl MemoryFile {
    /// Creates a file holding `contents` and returns the first handle to it.
    pub fn new(contents: &[u8]) -> Self {
        let shared = Shared {
            data: Mutex::new(contents.to_vec()),
            ..Default::default()
        };
        shared.opens.store(1, Ordering::Release);
        Self {
            shared: Arc::new(shared),
            position: 0,
        }
    }

    /// Returns a snapshot of the file contents.
    pub fn contents(&self) -> Vec<u8> {
        self.shared.data.lock().clone()
    }

    /// Returns the usage counters of the file.
    pub fn stats(&self) -> FileStats {
        FileStats {
            opens: self.shared.opens.load(Ordering::Acquire),
            closes: self.shared.closes.load(Ordering::Acquire),
            reads: self.shared.reads.load(Ordering::Acquire),
            writes: self.shared.writes.load(Ordering::Acquire),
        }
    }

    /// Makes reads through every handle fail with [`IoError::Device`].
    pub fn fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::Release);
    }

    /// Makes writes through every handle fail with [`IoError::Device`].
    pub fn fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::Release);
    }

    /// Opens another handle to this file.
    pub fn duplicate(&self) -> MemoryFile {
        self.shared.opens.fetch_add(1, Ordering::AcqRel);
        MemoryFile {
            shared: self.shared.clone(),
            position: 0,
        }
    }
}

impl FileHandle for MemoryFile {
    fn reopen(&self) -> Result<Box<dyn FileHandle>, IoError> {
        Ok(Box::new(self.duplicate()))
    }

    fn length(&self) -> usize {
        self.shared.data.lock().len()
    }

    fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, IoError> {
        if self.shared.fail_reads.load(Ordering::Acquire) {
            return Err(IoError::Device);
        }
        let data = self.shared.data.lock();
        let start = self.position.min(data.len());
        let count = buffer.len().min(data.len() - start);
        buffer[..count].copy_from_slice(&data[start..start + count]);
        self.position += count;
        self.shared.reads.fetch_add(1, Ordering::AcqRel);
        Ok(count)
    }

    fn write(&mut self, buffer: &[u8]) -> Result<usize, IoError> {
        if self.shared.fail_writes.load(Ordering::Acquire) {
            return Err(IoError::Device);
        }
        let mut data = self.shared.data.lock();
        let start = self.position.min(data.len());
        let count = buffer.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&buffer[..count]);
        self.position += count;
        self.shared.writes.fetch_add(1, Ordering::AcqRel);
        Ok(count)
    }

    fn close(self: Box<Self>) {
        self.shared.closes.fetch_add(1, Ordering::AcqRel);
    }
}
