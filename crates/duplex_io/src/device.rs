//! Device probing and open helpers shared by sources and sinks.

use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::path::Path;

use tracing::debug;

/// What kind of file a path names. Only regular files and block devices
/// are seekable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    BlockDevice,
    CharDevice,
    Fifo,
    Other,
}

impl FileKind {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let file_type = metadata.file_type();
        if file_type.is_file() {
            return FileKind::Regular;
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::FileTypeExt;

            if file_type.is_block_device() {
                return FileKind::BlockDevice;
            }
            if file_type.is_char_device() {
                return FileKind::CharDevice;
            }
            if file_type.is_fifo() || file_type.is_socket() {
                return FileKind::Fifo;
            }
        }
        FileKind::Other
    }

    #[inline]
    pub fn is_seekable(self) -> bool {
        matches!(self, FileKind::Regular | FileKind::BlockDevice)
    }
}

/// Size in bytes of an open block device.
#[cfg(target_os = "linux")]
pub fn block_device_size(file: &File) -> io::Result<u64> {
    use std::os::unix::io::AsRawFd;

    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    let mut size: u64 = 0;
    let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };

    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn block_device_size(_file: &File) -> io::Result<u64> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Not supported on this platform",
    ))
}

/// Length of the data behind `file`, or `None` for streams.
pub(crate) fn data_size(file: &File, kind: FileKind) -> io::Result<Option<u64>> {
    match kind {
        FileKind::Regular => Ok(Some(file.metadata()?.len())),
        FileKind::BlockDevice => block_device_size(file).map(Some),
        _ => Ok(None),
    }
}

/// Opens `path` with `O_DIRECT` when asked, falling back to a buffered open
/// when the filesystem refuses it. Returns the file and whether direct I/O
/// is in effect.
pub(crate) fn open_with_direct(
    options: &OpenOptions,
    path: &Path,
    direct: bool,
) -> io::Result<(File, bool)> {
    #[cfg(target_os = "linux")]
    if direct {
        use std::os::unix::fs::OpenOptionsExt;

        let mut direct_options = options.clone();
        match direct_options.custom_flags(libc::O_DIRECT).open(path) {
            Ok(file) => return Ok((file, true)),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Direct I/O refused, using buffered I/O");
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = direct;

    options.open(path).map(|file| (file, false))
}

/// Drops `O_DIRECT` from an open descriptor.
#[cfg(target_os = "linux")]
pub(crate) fn clear_direct(file: &File) -> io::Result<()> {
    use rustix::fs::{OFlags, fcntl_getfl, fcntl_setfl};

    let mut flags = fcntl_getfl(file)?;
    flags.remove(OFlags::DIRECT);
    fcntl_setfl(file, flags)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn clear_direct(_file: &File) -> io::Result<()> {
    Ok(())
}

/// Tells the kernel the file is read once, front to back.
pub(crate) fn advise_sequential(file: &File) {
    #[cfg(target_os = "linux")]
    {
        use rustix::fs::{Advice, fadvise};

        let _ = fadvise(file, 0, None, Advice::Sequential);
        let _ = fadvise(file, 0, None, Advice::NoReuse);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = file;
}

/// `EINVAL` from a direct descriptor means the request broke an alignment
/// rule of the device.
pub(crate) fn is_alignment_error(err: &io::Error) -> bool {
    err.raw_os_error() == Some(22)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_regular_file_kind_and_size() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [1u8; 1000]).unwrap();

        let opened = File::open(file.path()).unwrap();
        let kind = FileKind::from_metadata(&opened.metadata().unwrap());
        assert_eq!(kind, FileKind::Regular);
        assert!(kind.is_seekable());
        assert_eq!(data_size(&opened, kind).unwrap(), Some(1000));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dev_null_is_a_stream() {
        let null = File::open("/dev/null").unwrap();
        let kind = FileKind::from_metadata(&null.metadata().unwrap());
        assert_eq!(kind, FileKind::CharDevice);
        assert!(!kind.is_seekable());
        assert_eq!(data_size(&null, kind).unwrap(), None);
    }

    #[test]
    fn test_direct_open_falls_back() {
        let file = NamedTempFile::new().unwrap();
        let mut options = OpenOptions::new();
        options.read(true);
        // tmpfs refuses O_DIRECT; either way the file opens
        let (_file, _direct) = open_with_direct(&options, file.path(), true).unwrap();
    }
}
