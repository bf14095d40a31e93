//! Capabilities the pipeline consumes: where bytes come from and where they go.
//!
//! Concrete adapters live in `duplex_io` (files, block devices, stdio) and in
//! [`crate::memory`] (in-memory fixtures for tests).

use std::io;

/// A readable input: a regular file, a block device or a character stream.
///
/// # Example
///
/// ```ignore
/// struct Image { bytes: Vec<u8> }
///
/// impl Source for Image {
///     fn read(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
///         // copy bytes[offset..] into buffer
///     }
///
///     fn size(&self) -> Option<u64> {
///         Some(self.bytes.len() as u64)
///     }
/// }
/// ```
pub trait Source: Send {
    /// Reads up to `buffer.len()` bytes starting at `offset`.
    ///
    /// # Arguments
    ///
    /// * `offset` - Absolute byte offset in the source
    /// * `buffer` - Destination for the bytes
    ///
    /// # Returns
    ///
    /// The number of bytes read. `Ok(0)` means end of source. An `Err` is a
    /// media error for this range; the caller decides whether to retry at a
    /// finer granularity.
    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize>;

    /// Total length in bytes, or `None` for streams of unknown length.
    fn size(&self) -> Option<u64>;

    fn is_block_device(&self) -> bool {
        false
    }

    /// Display name used in reports and logs.
    fn name(&self) -> &str;
}

/// A destination written by its own writer.
pub trait Sink: Send {
    /// Writes `bytes` at `offset`, returning how many were accepted.
    fn write(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize>;

    /// Reads back previously written bytes. Only used when verifying writes
    /// or computing output digests.
    fn reread(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize>;

    /// Drops any alignment constraint (such as `O_DIRECT`) so that a final
    /// short block can be written.
    fn reopen_without_alignment_constraint(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Whether [`Sink::reread`] is supported.
    fn can_reread(&self) -> bool {
        true
    }

    /// Whether writes must be 512-byte multiples.
    fn is_direct(&self) -> bool {
        false
    }

    /// Flushes buffered data at the end of the job.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

impl<S: Source + ?Sized> Source for Box<S> {
    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        (**self).read(offset, buffer)
    }

    fn size(&self) -> Option<u64> {
        (**self).size()
    }

    fn is_block_device(&self) -> bool {
        (**self).is_block_device()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn write(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(offset, bytes)
    }

    fn reread(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        (**self).reread(offset, buffer)
    }

    fn reopen_without_alignment_constraint(&mut self) -> io::Result<()> {
        (**self).reopen_without_alignment_constraint()
    }

    fn can_reread(&self) -> bool {
        (**self).can_reread()
    }

    fn is_direct(&self) -> bool {
        (**self).is_direct()
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
