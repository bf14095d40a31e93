//! Operating-system adapters for the copy pipeline: regular files, block
//! devices, character devices and stdio.

mod device;
mod error;
mod sink;
mod source;

pub use device::{FileKind, block_device_size};
pub use error::{DeviceError, Result};
pub use sink::{FileSink, SinkOptions};
pub use source::FileSource;
