//! Block reader that survives media errors.
//!
//! A failing `ibs` step is retried once, then re-read in `reread_bs` chunks,
//! then sector by sector. Sectors that never read back are zero-filled and
//! reported as error regions, so the output keeps the source's geometry.

use std::fmt;
use std::io;

use serde::Serialize;
use tracing::{debug, warn};

use crate::settings::{JobSettings, SECTOR_SIZE};
use crate::traits::Source;

/// Unreadable byte range, zero-filled in the output. `end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ErrorRegion {
    pub start: u64,
    pub end: u64,
}

impl ErrorRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ErrorRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{:016x}", self.start, self.end)
    }
}

/// Appends `[start, end)`, merging it into the previous region when adjacent.
pub(crate) fn push_region(regions: &mut Vec<ErrorRegion>, start: u64, end: u64) {
    match regions.last_mut() {
        Some(last) if last.end == start => last.end = end,
        _ => regions.push(ErrorRegion { start, end }),
    }
}

/// Block counters in the `dd` sense: a block is complete when it has the
/// full step size, partial otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamCounters {
    pub complete_blocks: u64,
    pub partial_blocks: u64,
    pub bytes: u64,
}

impl StreamCounters {
    pub fn blocks(&self) -> u64 {
        self.complete_blocks + self.partial_blocks
    }

    /// Counts one transfer of `n` bytes against `block_size`.
    pub fn record(&mut self, n: usize, block_size: usize) {
        if n == 0 {
            return;
        }
        if n == block_size {
            self.complete_blocks += 1;
        } else {
            self.partial_blocks += 1;
        }
        self.bytes += n as u64;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FillOutcome {
    pub bytes: usize,
    pub is_last: bool,
    pub bad_regions: Vec<ErrorRegion>,
}

#[derive(Debug, Clone, Copy)]
struct Step {
    bytes: usize,
    eof: bool,
}

#[derive(Debug, Clone)]
pub struct ResilientReader {
    ibs: usize,
    reading_attempts: u32,
    reread_bs: usize,
    count: Option<u64>,
    counters: StreamCounters,
}

impl ResilientReader {
    pub fn new(settings: &JobSettings) -> Self {
        Self {
            ibs: settings.ibs,
            reading_attempts: settings.reading_attempts,
            reread_bs: settings.reread_bs,
            count: settings.count,
            counters: StreamCounters::default(),
        }
    }

    pub fn counters(&self) -> &StreamCounters {
        &self.counters
    }

    /// Whether the configured block count has been read.
    pub fn limit_reached(&self) -> bool {
        self.count.is_some_and(|count| self.counters.blocks() >= count)
    }

    /// Reads up to `want` bytes (bounded by `buf.len()`) from `position`,
    /// one `ibs` step at a time.
    pub fn fill<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        buf: &mut [u8],
        position: u64,
        want: usize,
    ) -> FillOutcome {
        let want = want.min(buf.len());
        let mut outcome = FillOutcome::default();

        while outcome.bytes < want {
            if self.limit_reached() {
                outcome.is_last = true;
                break;
            }
            let len = self.ibs.min(want - outcome.bytes);
            let at = position + outcome.bytes as u64;
            let chunk = &mut buf[outcome.bytes..outcome.bytes + len];

            let step = self.read_step(source, at, chunk, &mut outcome.bad_regions);
            self.counters.record(step.bytes, self.ibs);
            outcome.bytes += step.bytes;

            if step.eof || step.bytes == 0 {
                outcome.is_last = true;
                break;
            }
        }
        if self.limit_reached() {
            outcome.is_last = true;
        }
        outcome
    }

    fn read_step<S: Source + ?Sized>(
        &self,
        source: &mut S,
        at: u64,
        chunk: &mut [u8],
        regions: &mut Vec<ErrorRegion>,
    ) -> Step {
        let err = match read_full(source, at, chunk) {
            Ok(step) => return step,
            Err(err) => err,
        };
        warn!(
            start = at,
            end = at + chunk.len() as u64,
            error = %err,
            "Error reading block"
        );

        if self.reading_attempts == 0 {
            let len = readable(source, at, chunk.len());
            chunk[..len].fill(0);
            if len > 0 {
                push_region(regions, at, at + len as u64);
                warn!(start = at, end = at + len as u64, "Unable to read block, zero-filled");
            }
            return Step {
                bytes: len,
                eof: len < chunk.len(),
            };
        }

        if let Ok(step) = read_full(source, at, chunk) {
            debug!(start = at, "Block read on retry");
            return step;
        }

        if self.reread_bs > SECTOR_SIZE && self.reread_bs < chunk.len() {
            self.read_chunks(source, at, chunk, regions)
        } else {
            self.read_sectors(source, at, chunk, regions)
        }
    }

    fn read_chunks<S: Source + ?Sized>(
        &self,
        source: &mut S,
        at: u64,
        chunk: &mut [u8],
        regions: &mut Vec<ErrorRegion>,
    ) -> Step {
        debug!(start = at, reread_bs = self.reread_bs, "Switching to degraded read size");
        let mut done = 0;
        while done < chunk.len() {
            let len = self.reread_bs.min(chunk.len() - done);
            let sub_at = at + done as u64;
            let sub = &mut chunk[done..done + len];

            let step = match read_full(source, sub_at, sub) {
                Ok(step) => step,
                Err(err) => {
                    debug!(start = sub_at, error = %err, "Degraded read failed, reading sectors");
                    self.read_sectors(source, sub_at, sub, regions)
                }
            };
            done += step.bytes;
            if step.eof {
                return Step { bytes: done, eof: true };
            }
        }
        debug!("Returning to normal block size");
        Step {
            bytes: done,
            eof: false,
        }
    }

    fn read_sectors<S: Source + ?Sized>(
        &self,
        source: &mut S,
        at: u64,
        chunk: &mut [u8],
        regions: &mut Vec<ErrorRegion>,
    ) -> Step {
        debug!(start = at, end = at + chunk.len() as u64, "Reading sector by sector");
        let mut done = 0;
        while done < chunk.len() {
            let len = SECTOR_SIZE.min(chunk.len() - done);
            let sector_at = at + done as u64;
            let sector = &mut chunk[done..done + len];

            let mut attempt = 1;
            loop {
                match read_full(source, sector_at, sector) {
                    Ok(step) => {
                        done += step.bytes;
                        if step.eof {
                            return Step { bytes: done, eof: true };
                        }
                        break;
                    }
                    Err(err) if attempt < self.reading_attempts => {
                        debug!(
                            start = sector_at,
                            error = %err,
                            attempts_left = self.reading_attempts - attempt,
                            "Error reading sector"
                        );
                        attempt += 1;
                    }
                    Err(err) => {
                        let filled = readable(source, sector_at, len);
                        if filled == 0 {
                            return Step { bytes: done, eof: true };
                        }
                        warn!(
                            start = sector_at,
                            end = sector_at + filled as u64,
                            error = %err,
                            "Unable to read sector, zero-filled"
                        );
                        sector[..filled].fill(0);
                        push_region(regions, sector_at, sector_at + filled as u64);
                        done += filled;
                        if filled < len {
                            return Step { bytes: done, eof: true };
                        }
                        break;
                    }
                }
            }
        }
        Step {
            bytes: done,
            eof: false,
        }
    }
}

/// Bytes of `len` starting at `at` that lie inside the source. Streams of
/// unknown size are assumed to extend past any unreadable range, so a bad
/// final sector there is zero-filled in full.
fn readable<S: Source + ?Sized>(source: &S, at: u64, len: usize) -> usize {
    match source.size() {
        Some(size) => size.saturating_sub(at).min(len as u64) as usize,
        None => len,
    }
}

/// Reads until `buf` is full or the source ends. An error discards the
/// partial read; the caller retries the whole range.
fn read_full<S: Source + ?Sized>(source: &mut S, at: u64, buf: &mut [u8]) -> io::Result<Step> {
    let mut done = 0;
    while done < buf.len() {
        match source.read(at + done as u64, &mut buf[done..]) {
            Ok(0) => return Ok(Step { bytes: done, eof: true }),
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Step {
        bytes: done,
        eof: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;

    fn settings(ibs: usize, attempts: u32, reread_bs: usize) -> JobSettings {
        let mut s = JobSettings::default().with_block_sizes(Some(ibs), None, None);
        s.reading_attempts = attempts;
        s.reread_bs = reread_bs;
        s
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[test]
    fn test_clean_read_counts_blocks() {
        let mut source = MemorySource::new(pattern(4096 + 100));
        let mut reader = ResilientReader::new(&settings(1024, 1, 512));
        let mut buf = vec![0u8; 8192];

        let outcome = reader.fill(&mut source, &mut buf, 0, 8192);

        assert_eq!(outcome.bytes, 4196);
        assert!(outcome.is_last);
        assert!(outcome.bad_regions.is_empty());
        assert_eq!(reader.counters().complete_blocks, 4);
        assert_eq!(reader.counters().partial_blocks, 1);
        assert_eq!(&buf[..4196], source.data());
    }

    #[test]
    fn test_exact_end_needs_empty_read_to_terminate() {
        let mut source = MemorySource::new(pattern(2048));
        let mut reader = ResilientReader::new(&settings(1024, 1, 512));
        let mut buf = vec![0u8; 2048];

        let first = reader.fill(&mut source, &mut buf, 0, 2048);
        assert_eq!(first.bytes, 2048);
        assert!(!first.is_last);

        let second = reader.fill(&mut source, &mut buf, 2048, 2048);
        assert_eq!(second.bytes, 0);
        assert!(second.is_last);
        assert_eq!(reader.counters().blocks(), 2);
    }

    #[test]
    fn test_bad_sector_is_isolated() {
        let data = pattern(8192);
        let mut source = MemorySource::new(data.clone()).with_bad_sector(2560);
        let mut reader = ResilientReader::new(&settings(4096, 3, 512));
        let mut buf = vec![0xEEu8; 8192];

        let outcome = reader.fill(&mut source, &mut buf, 0, 8192);

        assert_eq!(outcome.bytes, 8192);
        assert_eq!(outcome.bad_regions, vec![ErrorRegion { start: 2560, end: 3072 }]);
        assert!(buf[2560..3072].iter().all(|&b| b == 0));
        assert_eq!(&buf[..2560], &data[..2560]);
        assert_eq!(&buf[3072..], &data[3072..]);
        assert_eq!(reader.counters().complete_blocks, 2);
    }

    #[test]
    fn test_adjacent_bad_sectors_are_coalesced() {
        let mut source = MemorySource::new(pattern(4096))
            .with_bad_sector(1024)
            .with_bad_sector(1536)
            .with_bad_sector(3584);
        let mut reader = ResilientReader::new(&settings(4096, 1, 512));
        let mut buf = vec![0u8; 4096];

        let outcome = reader.fill(&mut source, &mut buf, 0, 4096);

        assert_eq!(
            outcome.bad_regions,
            vec![
                ErrorRegion { start: 1024, end: 2048 },
                ErrorRegion { start: 3584, end: 4096 },
            ]
        );
    }

    #[test]
    fn test_transient_error_recovers_on_retry() {
        let data = pattern(4096);
        let mut source = MemorySource::new(data.clone()).with_transient_failure(1024, 1);
        let mut reader = ResilientReader::new(&settings(4096, 1, 512));
        let mut buf = vec![0u8; 4096];

        let outcome = reader.fill(&mut source, &mut buf, 0, 4096);

        assert!(outcome.bad_regions.is_empty());
        assert_eq!(buf, data);
        assert_eq!(source.read_calls(), 2);
    }

    #[test]
    fn test_sector_retries_use_all_attempts() {
        let data = pattern(2048);
        // fails the first read, the retry and two sector reads
        let mut source = MemorySource::new(data.clone()).with_transient_failure(512, 4);
        let mut reader = ResilientReader::new(&settings(2048, 3, 512));
        let mut buf = vec![0u8; 2048];

        let outcome = reader.fill(&mut source, &mut buf, 0, 2048);

        assert!(outcome.bad_regions.is_empty());
        assert_eq!(buf, data);
    }

    #[test]
    fn test_degraded_chunks_keep_good_data() {
        let data = pattern(16384);
        let mut source = MemorySource::new(data.clone()).with_bad_sector(9216);
        let mut reader = ResilientReader::new(&settings(16384, 2, 4096));
        let mut buf = vec![0u8; 16384];

        let outcome = reader.fill(&mut source, &mut buf, 0, 16384);

        assert_eq!(outcome.bad_regions, vec![ErrorRegion { start: 9216, end: 9728 }]);
        assert_eq!(&buf[..9216], &data[..9216]);
        assert_eq!(&buf[9728..], &data[9728..]);
        // 2 whole-block reads, 4 chunk reads, 8 sectors with 2 tries on the bad one
        assert_eq!(source.read_calls(), 2 + 4 + 8 + 1);
    }

    #[test]
    fn test_no_attempts_zero_fills_whole_step() {
        let data = pattern(4096);
        let mut source = MemorySource::new(data.clone()).with_bad_sector(1024);
        let mut reader = ResilientReader::new(&settings(2048, 0, 512));
        let mut buf = vec![0xAAu8; 4096];

        let outcome = reader.fill(&mut source, &mut buf, 0, 4096);

        assert_eq!(outcome.bad_regions, vec![ErrorRegion { start: 0, end: 2048 }]);
        assert!(buf[..2048].iter().all(|&b| b == 0));
        assert_eq!(&buf[2048..], &data[2048..]);
        assert_eq!(reader.counters().complete_blocks, 2);
    }

    #[test]
    fn test_bad_final_sector_stops_at_end_of_source() {
        let data = pattern(1000);
        let mut source = MemorySource::new(data.clone()).with_bad_sector(512);
        let mut reader = ResilientReader::new(&settings(1024, 1, 512));
        let mut buf = vec![0xEEu8; 1024];

        let outcome = reader.fill(&mut source, &mut buf, 0, 1024);

        assert_eq!(outcome.bytes, 1000);
        assert!(outcome.is_last);
        assert_eq!(outcome.bad_regions, vec![ErrorRegion { start: 512, end: 1000 }]);
        assert_eq!(&buf[..512], &data[..512]);
        assert!(buf[512..1000].iter().all(|&b| b == 0));
        assert_eq!(buf[1000], 0xEE);
        assert_eq!(reader.counters().partial_blocks, 1);
    }

    #[test]
    fn test_bad_final_sector_of_unknown_size_fills_whole_sector() {
        let mut source = MemorySource::new(pattern(1000))
            .with_bad_sector(512)
            .with_unknown_size();
        let mut reader = ResilientReader::new(&settings(1024, 1, 512));
        let mut buf = vec![0u8; 1024];

        let outcome = reader.fill(&mut source, &mut buf, 0, 1024);

        assert_eq!(outcome.bytes, 1024);
        assert_eq!(outcome.bad_regions, vec![ErrorRegion { start: 512, end: 1024 }]);
    }

    #[test]
    fn test_no_attempts_stops_at_end_of_source() {
        let mut source = MemorySource::new(pattern(3000)).with_bad_sector(2560);
        let mut reader = ResilientReader::new(&settings(2048, 0, 512));
        let mut buf = vec![0u8; 4096];

        let outcome = reader.fill(&mut source, &mut buf, 0, 4096);

        assert_eq!(outcome.bytes, 3000);
        assert!(outcome.is_last);
        assert_eq!(outcome.bad_regions, vec![ErrorRegion { start: 2048, end: 3000 }]);
    }

    #[test]
    fn test_count_limit() {
        let mut source = MemorySource::new(pattern(8192));
        let mut s = settings(512, 1, 512);
        s.count = Some(3);
        let mut reader = ResilientReader::new(&s);
        let mut buf = vec![0u8; 4096];

        let outcome = reader.fill(&mut source, &mut buf, 0, 4096);

        assert_eq!(outcome.bytes, 1536);
        assert!(outcome.is_last);
        assert!(reader.limit_reached());
    }

    #[test]
    fn test_counters_record() {
        let mut counters = StreamCounters::default();
        counters.record(512, 512);
        counters.record(100, 512);
        counters.record(0, 512);
        assert_eq!(counters.complete_blocks, 1);
        assert_eq!(counters.partial_blocks, 1);
        assert_eq!(counters.bytes, 612);
    }
}
