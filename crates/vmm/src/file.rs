//! The file interface consumed by memory-mapped regions and segment loaders.

use alloc::boxed::Box;

use crate::IoError;

/// An open file.
///
/// Every handle has its own position. All operations are synchronous and fail only on
/// I/O error.
pub trait FileHandle: Send {
    /// Opens an independent handle to the same file.
    fn reopen(&self) -> Result<Box<dyn FileHandle>, IoError>;

    /// Returns the length of the file in bytes.
    fn length(&self) -> usize;

    /// Moves the position of this handle.
    fn seek(&mut self, position: usize);

    /// Reads from the current position, returning the number of bytes read.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize, IoError>;

    /// Writes at the current position, returning the number of bytes written.
    fn write(&mut self, buffer: &[u8]) -> Result<usize, IoError>;

    /// Closes the handle.
    fn close(self: Box<Self>);

    /// Reads exactly `buffer.len()` bytes starting at `offset`.
    fn read_exact_at(&mut self, offset: usize, buffer: &mut [u8]) -> Result<(), IoError> {
        self.seek(offset);
        let actual = self.read(buffer)?;
        if actual != buffer.len() {
            return Err(IoError::ShortTransfer {
                expected: buffer.len(),
                actual,
            });
        }
        Ok(())
    }

    /// Writes all of `buffer` starting at `offset`.
    fn write_exact_at(&mut self, offset: usize, buffer: &[u8]) -> Result<(), IoError> {
        self.seek(offset);
        let actual = self.write(buffer)?;
        if actual != buffer.len() {
            return Err(IoError::ShortTransfer {
                expected: buffer.len(),
                actual,
            });
        }
        Ok(())
    }
}
