//! Input adapter for image files, block devices and streams.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Stdin};
use std::path::Path;

use duplex_core::Source;
use tracing::{debug, info};

use crate::device::{self, FileKind};
use crate::error::{DeviceError, Result};

enum Input {
    File(File),
    Stdin(Stdin),
}

impl Read for Input {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Input::File(file) => file.read(buf),
            Input::Stdin(stdin) => stdin.read(buf),
        }
    }
}

/// A read-only [`Source`] over a file, a disk or standard input.
///
/// Regular files and block devices are read at absolute offsets. Streams
/// (character devices, pipes, stdin) are read front to back: a forward
/// offset discards the bytes in between, a backward one is an error.
///
/// # Example
///
/// ```ignore
/// use duplex_io::FileSource;
/// use duplex_core::Source;
///
/// let mut source = FileSource::open("/dev/sdb", true)?;
/// let mut sector = vec![0u8; 512];
/// let n = source.read(0, &mut sector)?;
/// ```
pub struct FileSource {
    input: Input,
    name: String,
    kind: FileKind,
    size: Option<u64>,
    direct: bool,
    /// Stream position, for non-seekable inputs.
    cursor: u64,
}

impl FileSource {
    /// Opens `path` read-only.
    ///
    /// # Arguments
    ///
    /// * `path` - Image file, block device or character device
    /// * `direct` - Try `O_DIRECT`, falling back to buffered reads
    ///
    /// # Returns
    ///
    /// A `FileSource`, or a `DeviceError` when the path does not exist, is
    /// not readable, or its size cannot be determined.
    pub fn open(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);

        let (file, direct) =
            device::open_with_direct(&options, path, direct).map_err(|e| DeviceError::open(path, e))?;
        let io_err = |source| DeviceError::Io {
            path: path.to_path_buf(),
            source,
        };
        let kind = FileKind::from_metadata(&file.metadata().map_err(io_err)?);
        let size = device::data_size(&file, kind).map_err(io_err)?;
        device::advise_sequential(&file);

        info!(
            path = %path.display(),
            kind = ?kind,
            size = ?size,
            direct,
            "Input opened"
        );
        Ok(Self {
            input: Input::File(file),
            name: path.display().to_string(),
            kind,
            size,
            direct,
            cursor: 0,
        })
    }

    pub fn stdin() -> Self {
        Self {
            input: Input::Stdin(io::stdin()),
            name: "stdin".to_string(),
            kind: FileKind::Fifo,
            size: None,
            direct: false,
            cursor: 0,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        let Input::File(file) = &mut self.input else {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        };
        file.seek(SeekFrom::Start(offset))?;
        match file.read(buffer) {
            Err(e) if self.direct && device::is_alignment_error(&e) => {
                debug!(offset, len = buffer.len(), "Unaligned direct read, dropping direct I/O");
                device::clear_direct(file)?;
                self.direct = false;
                file.seek(SeekFrom::Start(offset))?;
                file.read(buffer)
            }
            other => other,
        }
    }

    fn read_stream(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        if offset < self.cursor {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot read back to offset {offset} of a stream already at {}", self.cursor),
            ));
        }
        if offset > self.cursor {
            let gap = offset - self.cursor;
            let skipped = io::copy(&mut (&mut self.input).take(gap), &mut io::sink())?;
            self.cursor += skipped;
            if skipped < gap {
                return Ok(0);
            }
        }
        let n = self.input.read(buffer)?;
        self.cursor += n as u64;
        Ok(n)
    }
}

impl Source for FileSource {
    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        if self.kind.is_seekable() {
            self.read_at(offset, buffer)
        } else {
            self.read_stream(offset, buffer)
        }
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn is_block_device(&self) -> bool {
        self.kind == FileKind::BlockDevice
    }

    fn name(&self) -> &str {
        &self.name
    }
}
