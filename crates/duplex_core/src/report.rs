//! End-of-job statistics.

use std::fmt;
use std::time::Duration;

use humansize::{BINARY, format_size};
use serde::{Serialize, Serializer};

use crate::digest::FinalDigest;
use crate::partition::{DecoderState, PartitionEntry};
use crate::reader::{ErrorRegion, StreamCounters};

#[derive(Debug, Clone, Serialize)]
pub struct StreamReport {
    pub name: String,
    pub counters: StreamCounters,
    pub digests: Vec<FinalDigest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkReport {
    pub name: String,
    pub counters: StreamCounters,
    /// Empty when the sink failed: a partial digest certifies nothing.
    pub digests: Vec<FinalDigest>,
    /// The fatal error that withdrew this sink, if any.
    pub error: Option<String>,
    /// Whether the sink drained the terminal slot.
    pub completed: bool,
}

impl SinkReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransformFailure {
    pub transform: String,
    pub message: String,
    /// Source offset of the slot being transformed.
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub input: StreamReport,
    pub outputs: Vec<SinkReport>,
    /// Bytes handed to sinks, after transforms.
    pub bytes_published: u64,
    pub bad_regions: Vec<ErrorRegion>,
    pub partitions: Vec<PartitionEntry>,
    pub partition_state: Option<DecoderState>,
    pub transform_errors: Vec<TransformFailure>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub cancelled: bool,
}

fn serialize_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

impl JobReport {
    /// Bytes that could not be read and were zero-filled.
    pub fn bad_bytes(&self) -> u64 {
        self.bad_regions.iter().map(ErrorRegion::len).sum()
    }

    pub fn failed_outputs(&self) -> usize {
        self.outputs.iter().filter(|o| !o.is_ok()).count()
    }

    /// Input throughput in bytes per second.
    pub fn rate(&self) -> u64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            (self.input.counters.bytes as f64 / secs) as u64
        } else {
            self.input.counters.bytes
        }
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let input = &self.input.counters;
        writeln!(
            f,
            "{}: {}+{} blocks in",
            self.input.name, input.complete_blocks, input.partial_blocks
        )?;
        for output in &self.outputs {
            writeln!(
                f,
                "{}: {}+{} blocks out",
                output.name, output.counters.complete_blocks, output.counters.partial_blocks
            )?;
        }
        write!(
            f,
            "{} bytes read, {:.3} sec., {}/sec",
            input.bytes,
            self.elapsed.as_secs_f64(),
            format_size(self.rate(), BINARY)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> JobReport {
        JobReport {
            input: StreamReport {
                name: "/dev/sdb".into(),
                counters: StreamCounters {
                    complete_blocks: 4,
                    partial_blocks: 1,
                    bytes: 2100,
                },
                digests: Vec::new(),
            },
            outputs: vec![SinkReport {
                name: "image.dd".into(),
                counters: StreamCounters {
                    complete_blocks: 4,
                    partial_blocks: 1,
                    bytes: 2100,
                },
                digests: Vec::new(),
                error: None,
                completed: true,
            }],
            bytes_published: 2100,
            bad_regions: vec![ErrorRegion { start: 512, end: 1536 }],
            partitions: Vec::new(),
            partition_state: None,
            transform_errors: Vec::new(),
            elapsed: Duration::from_secs(2),
            cancelled: false,
        }
    }

    #[test]
    fn test_statistics_lines() {
        let text = report().to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "/dev/sdb: 4+1 blocks in");
        assert_eq!(lines[1], "image.dd: 4+1 blocks out");
        assert!(lines[2].starts_with("2100 bytes read, 2.000 sec., "));
        assert!(lines[2].ends_with("B/sec"));
    }

    #[test]
    fn test_summary_helpers() {
        let mut report = report();
        assert_eq!(report.bad_bytes(), 1024);
        assert_eq!(report.rate(), 1050);
        assert_eq!(report.failed_outputs(), 0);

        report.outputs[0].error = Some("write error".into());
        assert_eq!(report.failed_outputs(), 1);
    }
}
