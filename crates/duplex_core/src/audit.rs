//! Audit trail: per-block digests and unreadable regions.

use std::io::Write;

use crate::digest::BlockDigest;
use crate::error::{CoreError, Result};
use crate::reader::ErrorRegion;

/// Receives audit records from the reader as slots are filled.
pub trait AuditSink: Send {
    fn block_digest(&mut self, record: &BlockDigest) -> Result<()>;

    fn bad_region(&mut self, region: &ErrorRegion) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryAudit {
    pub blocks: Vec<BlockDigest>,
    pub regions: Vec<ErrorRegion>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for MemoryAudit {
    fn block_digest(&mut self, record: &BlockDigest) -> Result<()> {
        self.blocks.push(record.clone());
        Ok(())
    }

    fn bad_region(&mut self, region: &ErrorRegion) -> Result<()> {
        self.regions.push(*region);
        Ok(())
    }
}

impl<A: AuditSink + ?Sized> AuditSink for &mut A {
    fn block_digest(&mut self, record: &BlockDigest) -> Result<()> {
        (**self).block_digest(record)
    }

    fn bad_region(&mut self, region: &ErrorRegion) -> Result<()> {
        (**self).bad_region(region)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Writes block digests as text lines, one per block and algorithm:
///
/// ```text
/// block        0: 0000000000000000-0000000000000200: md5 - bf619eac0cdf3f68d496ea9344137e8b
/// ```
///
/// Unreadable regions go to the log, not to this file.
pub struct WriterAudit<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> WriterAudit<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> AuditSink for WriterAudit<W> {
    fn block_digest(&mut self, record: &BlockDigest) -> Result<()> {
        writeln!(self.out, "{record}").map_err(CoreError::Audit)
    }

    fn bad_region(&mut self, _region: &ErrorRegion) -> Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(CoreError::Audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{DigestAlgorithm, DigestTracker};

    #[test]
    fn test_writer_audit_lines() {
        let tracker = DigestTracker::new(vec![DigestAlgorithm::Md5, DigestAlgorithm::Sha1], 512, 512);
        let mut audit = WriterAudit::new(Vec::new());
        for record in tracker.digest_blocks(0, 0, &[0u8; 1024]) {
            audit.block_digest(&record).unwrap();
        }
        audit.flush().unwrap();

        let text = String::from_utf8(audit.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("block        0: 0000000000000000-0000000000000200: md5 - "));
        assert!(lines[3].starts_with("block        1: 0000000000000200-0000000000000400: sha1 - "));
    }

    #[test]
    fn test_memory_audit_collects() {
        let mut audit = MemoryAudit::new();
        audit.bad_region(&ErrorRegion { start: 512, end: 1024 }).unwrap();
        assert_eq!(audit.regions.len(), 1);
    }
}
