//! Output adapter for image files, block devices and streams.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Stdout, Write};
use std::path::Path;

use duplex_core::Sink;
use tracing::{debug, info, warn};

use crate::device::{self, FileKind};
use crate::error::{DeviceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOptions {
    /// Try `O_DIRECT`, falling back to buffered writes.
    pub direct: bool,
    /// Truncate regular files on open.
    pub truncate: bool,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            direct: true,
            truncate: true,
        }
    }
}

enum Output {
    File(File),
    Stdout(Stdout),
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Output::File(file) => file.write(buf),
            Output::Stdout(stdout) => stdout.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::File(file) => file.flush(),
            Output::Stdout(stdout) => stdout.flush(),
        }
    }
}

/// A [`Sink`] writing to a file, a disk or standard output.
///
/// Seekable outputs are written at absolute offsets and can be read back
/// for verification. Streams are written in order and cannot be read back.
pub struct FileSink {
    output: Output,
    name: String,
    kind: FileKind,
    direct: bool,
    readable: bool,
    /// Stream position, for non-seekable outputs.
    cursor: u64,
}

impl FileSink {
    /// Opens or creates `path` for writing, and for reading back when the
    /// file permits it.
    pub fn open(path: impl AsRef<Path>, options: SinkOptions) -> Result<Self> {
        let path = path.as_ref();
        // O_TRUNC only applies to regular files; never truncate a device
        let existing = std::fs::metadata(path).ok().map(|m| FileKind::from_metadata(&m));
        let truncate = options.truncate && matches!(existing, None | Some(FileKind::Regular));

        let mut open = OpenOptions::new();
        open.read(true).write(true).create(true).truncate(truncate);

        let (file, direct, readable) = match device::open_with_direct(&open, path, options.direct) {
            Ok((file, direct)) => (file, direct, true),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), "Output is write-only, it will not be read back");
                open.read(false);
                let (file, direct) = device::open_with_direct(&open, path, options.direct)
                    .map_err(|e| DeviceError::open(path, e))?;
                (file, direct, false)
            }
            Err(e) => return Err(DeviceError::open(path, e)),
        };

        let metadata = file.metadata().map_err(|source| DeviceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let kind = FileKind::from_metadata(&metadata);

        info!(path = %path.display(), kind = ?kind, direct, truncate, "Output opened");
        Ok(Self {
            output: Output::File(file),
            name: path.display().to_string(),
            kind,
            direct,
            readable,
            cursor: 0,
        })
    }

    pub fn stdout() -> Self {
        Self {
            output: Output::Stdout(io::stdout()),
            name: "stdout".to_string(),
            kind: FileKind::Fifo,
            direct: false,
            readable: false,
            cursor: 0,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    /// Whether writes may land anywhere but the end: required for `seek`.
    pub fn is_seekable(&self) -> bool {
        self.kind.is_seekable()
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        let Output::File(file) = &mut self.output else {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        };
        file.seek(SeekFrom::Start(offset))?;
        match file.write(bytes) {
            Err(e) if self.direct && device::is_alignment_error(&e) => {
                debug!(offset, len = bytes.len(), "Unaligned direct write, dropping direct I/O");
                device::clear_direct(file)?;
                self.direct = false;
                file.seek(SeekFrom::Start(offset))?;
                file.write(bytes)
            }
            other => other,
        }
    }

    fn write_stream(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        if offset != self.cursor {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot write at offset {offset} of a stream already at {}", self.cursor),
            ));
        }
        let n = self.output.write(bytes)?;
        self.cursor += n as u64;
        Ok(n)
    }
}

impl Sink for FileSink {
    fn write(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        if self.kind.is_seekable() {
            self.write_at(offset, bytes)
        } else {
            self.write_stream(offset, bytes)
        }
    }

    fn reread(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        match &mut self.output {
            Output::File(file) if self.readable && self.kind.is_seekable() => {
                file.seek(SeekFrom::Start(offset))?;
                file.read(buffer)
            }
            _ => Err(io::Error::from(io::ErrorKind::Unsupported)),
        }
    }

    fn reopen_without_alignment_constraint(&mut self) -> io::Result<()> {
        if !self.direct {
            return Ok(());
        }
        if let Output::File(file) = &self.output {
            device::clear_direct(file)?;
        }
        debug!(sink = %self.name, "Direct I/O disabled");
        self.direct = false;
        Ok(())
    }

    fn can_reread(&self) -> bool {
        self.readable && self.kind.is_seekable()
    }

    fn is_direct(&self) -> bool {
        self.direct
    }

    fn finish(&mut self) -> io::Result<()> {
        match &mut self.output {
            Output::File(file) if self.kind.is_seekable() => file.sync_data(),
            output => output.flush(),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BUFFERED: SinkOptions = SinkOptions {
        direct: false,
        truncate: true,
    };

    #[test]
    fn test_write_and_reread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.dd");
        let mut sink = FileSink::open(&path, BUFFERED).unwrap();

        assert!(sink.can_reread());
        assert_eq!(sink.write(512, b"payload").unwrap(), 7);

        let mut back = [0u8; 7];
        assert_eq!(sink.reread(512, &mut back).unwrap(), 7);
        assert_eq!(&back, b"payload");
        sink.finish().unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(on_disk.len(), 519);
        assert!(on_disk[..512].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_truncate_option() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("image.dd");
        std::fs::write(&path, [9u8; 4096]).unwrap();

        let mut keep = FileSink::open(&path, SinkOptions { direct: false, truncate: false }).unwrap();
        keep.write(0, b"ab").unwrap();
        keep.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 4096);

        let mut sink = FileSink::open(&path, BUFFERED).unwrap();
        sink.write(0, b"ab").unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"ab");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_char_device_is_a_stream() {
        let mut sink = FileSink::open("/dev/null", BUFFERED).unwrap();
        assert!(!sink.is_seekable());
        assert!(!sink.can_reread());
        assert_eq!(sink.write(0, b"abc").unwrap(), 3);
        assert_eq!(sink.write(3, b"def").unwrap(), 3);
        assert!(sink.write(100, b"x").is_err());
        sink.finish().unwrap();
    }
}
