use std::io;
use std::path::{Path, PathBuf};

use duplex_core::CoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl DeviceError {
    pub(crate) fn open(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => DeviceError::NotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => DeviceError::PermissionDenied(path.to_path_buf()),
            _ => DeviceError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

impl From<DeviceError> for CoreError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Io { source, .. } => CoreError::Io(source),
            other => CoreError::InvalidConfig(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
