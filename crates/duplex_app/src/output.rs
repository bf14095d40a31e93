//! Everything printed or saved once the job is over.

use std::fmt::Write as _;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use duplex_core::{FinalDigest, JobReport, JobSettings, PartitionEntry, partition_type_name};
use serde::Serialize;

/// `<hex> - <algorithm> - <stream name>`, one line per digest.
pub fn digest_lines(name: &str, digests: &[FinalDigest]) -> String {
    let mut out = String::new();
    for digest in digests {
        let _ = writeln!(out, "{} - {} - {}", digest.hex(), digest.algorithm, name);
    }
    out
}

/// Renders the decoded partition table, block numbers in 512-byte sectors.
pub fn partition_table(entries: &[PartitionEntry]) -> String {
    if entries.is_empty() {
        return "unable to read partition table\n".to_string();
    }

    let width = entries
        .iter()
        .map(|e| e.label.len())
        .max()
        .unwrap_or(0)
        .max("device".len());

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>width$}  boot           start             end          length  type  description",
        "device"
    );
    for entry in entries {
        let _ = writeln!(
            out,
            "{:>width$}{:>5}{:>17}{:>16}{:>16}{:>6x}  {}",
            entry.label,
            if entry.bootable { "*" } else { " " },
            entry.start_block,
            entry.end_block,
            entry.length_block,
            entry.type_code,
            partition_type_name(entry.type_code).unwrap_or("Unknown"),
        );
    }
    out
}

/// Full end-of-job summary for stderr.
pub fn summary(report: &JobReport, settings: &JobSettings) -> String {
    let mut out = format!("{report}\n");
    if report.cancelled {
        out.push_str("job interrupted\n");
    }

    out.push_str(&digest_lines(&report.input.name, &report.input.digests));
    for output in &report.outputs {
        out.push_str(&digest_lines(&output.name, &output.digests));
        if let Some(error) = &output.error {
            let _ = writeln!(out, "{}: {}", output.name, error);
        }
    }

    if settings.partition_table {
        out.push_str(&partition_table(&report.partitions));
    }
    for failure in &report.transform_errors {
        let _ = writeln!(
            out,
            "{}: {} (offset {})",
            failure.transform, failure.message, failure.offset
        );
    }
    if !report.bad_regions.is_empty() {
        let _ = writeln!(
            out,
            "{} unreadable region(s), {} bytes zero-filled",
            report.bad_regions.len(),
            report.bad_bytes()
        );
    }
    out
}

#[derive(Serialize)]
struct ReportFile<'a> {
    tool: &'static str,
    version: &'static str,
    started: String,
    settings: &'a JobSettings,
    report: &'a JobReport,
}

pub fn write_json(
    path: &Path,
    started: DateTime<Local>,
    settings: &JobSettings,
    report: &JobReport,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    let envelope = ReportFile {
        tool: "duplex",
        version: env!("CARGO_PKG_VERSION"),
        started: started.to_rfc3339(),
        settings,
        report,
    };
    serde_json::to_writer_pretty(BufWriter::new(file), &envelope)
        .with_context(|| format!("Failed to write report file: {}", path.display()))
}
