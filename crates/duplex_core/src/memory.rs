//! In-memory sources and sinks with fault injection, used by tests and by
//! callers that stream to or from buffers.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::settings::SECTOR_SIZE;
use crate::traits::{Sink, Source};

const SECTOR: u64 = SECTOR_SIZE as u64;

fn media_error() -> io::Error {
    // EIO, what a failing disk reports
    io::Error::from_raw_os_error(5)
}

/// Byte image served through [`Source`], with unreadable and flaky sectors.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Vec<u8>,
    bad_sectors: BTreeSet<u64>,
    transient: HashMap<u64, u32>,
    size_known: bool,
    block_device: bool,
    reads: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            name: "memory".to_string(),
            data,
            bad_sectors: BTreeSet::new(),
            transient: HashMap::new(),
            size_known: true,
            block_device: false,
            reads: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Every read touching the sector containing `offset` fails.
    pub fn with_bad_sector(mut self, offset: u64) -> Self {
        self.bad_sectors.insert(offset / SECTOR);
        self
    }

    /// The next `failures` reads touching the sector containing `offset` fail.
    pub fn with_transient_failure(mut self, offset: u64, failures: u32) -> Self {
        self.transient.insert(offset / SECTOR, failures);
        self
    }

    /// Behave like a character device: no known length.
    pub fn with_unknown_size(mut self) -> Self {
        self.size_known = false;
        self
    }

    pub fn as_block_device(mut self) -> Self {
        self.block_device = true;
        self
    }

    /// Number of `read` calls served so far, failed ones included.
    pub fn read_calls(&self) -> usize {
        self.reads
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Source for MemorySource {
    fn read(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        self.reads += 1;
        let len = self.data.len() as u64;
        if offset >= len || buffer.is_empty() {
            return Ok(0);
        }
        let end = (offset + buffer.len() as u64).min(len);
        let sectors = offset / SECTOR..end.div_ceil(SECTOR);

        if self.bad_sectors.range(sectors.clone()).next().is_some() {
            return Err(media_error());
        }
        let mut flaky = false;
        for sector in sectors {
            match self.transient.get_mut(&sector) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    flaky = true;
                }
                _ => {}
            }
        }
        if flaky {
            return Err(media_error());
        }

        let n = (end - offset) as usize;
        buffer[..n].copy_from_slice(&self.data[offset as usize..end as usize]);
        Ok(n)
    }

    fn size(&self) -> Option<u64> {
        self.size_known.then_some(self.data.len() as u64)
    }

    fn is_block_device(&self) -> bool {
        self.block_device
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Handle to the bytes held by a [`MemorySink`], usable after the sink has
/// been moved into a pipeline.
#[derive(Debug, Clone, Default)]
pub struct SharedBytes(Arc<Mutex<Vec<u8>>>);

impl SharedBytes {
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

#[derive(Debug)]
pub struct MemorySink {
    name: String,
    data: SharedBytes,
    fail_from: Option<u64>,
    corrupt_at: Option<u64>,
    direct: bool,
    rereadable: bool,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: SharedBytes::default(),
            fail_from: None,
            corrupt_at: None,
            direct: false,
            rereadable: true,
        }
    }

    pub fn handle(&self) -> SharedBytes {
        self.data.clone()
    }

    /// Writes reaching `offset` or beyond fail.
    pub fn failing_from(mut self, offset: u64) -> Self {
        self.fail_from = Some(offset);
        self
    }

    /// Re-reads return a flipped byte at `offset`, as a medium that silently
    /// stores wrong data would.
    pub fn corrupting_reread_at(mut self, offset: u64) -> Self {
        self.corrupt_at = Some(offset);
        self
    }

    /// Rejects writes that are not 512-byte multiples until reopened.
    pub fn direct(mut self) -> Self {
        self.direct = true;
        self
    }

    pub fn without_reread(mut self) -> Self {
        self.rereadable = false;
        self
    }
}

impl Sink for MemorySink {
    fn write(&mut self, offset: u64, bytes: &[u8]) -> io::Result<usize> {
        let end = offset + bytes.len() as u64;
        if self.fail_from.is_some_and(|from| end > from) {
            return Err(media_error());
        }
        if self.direct && !bytes.len().is_multiple_of(SECTOR_SIZE) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        let mut data = self.data.0.lock();
        if data.len() < end as usize {
            data.resize(end as usize, 0);
        }
        data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    fn reread(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<usize> {
        if !self.rereadable {
            return Err(io::Error::from(io::ErrorKind::Unsupported));
        }
        let data = self.data.0.lock();
        let len = data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let end = (offset + buffer.len() as u64).min(len);
        let n = (end - offset) as usize;
        buffer[..n].copy_from_slice(&data[offset as usize..end as usize]);

        if let Some(at) = self.corrupt_at.filter(|at| (offset..end).contains(at)) {
            buffer[(at - offset) as usize] ^= 0xFF;
        }
        Ok(n)
    }

    fn reopen_without_alignment_constraint(&mut self) -> io::Result<()> {
        self.direct = false;
        Ok(())
    }

    fn can_reread(&self) -> bool {
        self.rereadable
    }

    fn is_direct(&self) -> bool {
        self.direct
    }

    fn name(&self) -> &str {
        &self.name
    }
}
