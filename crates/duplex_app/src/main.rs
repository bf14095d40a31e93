//! Duplex - Forensic Block Copy
//!
//! Copies one input to any number of outputs, digesting, verifying and
//! zero-filling unreadable sectors along the way.

mod cli;
mod logging;
mod output;
mod progress;
mod prompt;
mod units;

use std::fs::File;
use std::io::{BufWriter, IsTerminal};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use duplex_core::transform::{self, Transform};
use duplex_core::{CancellationToken, JobSettings, Pipeline, Sink, Source, WriterAudit};
use duplex_io::{FileSink, FileSource, SinkOptions};
use tracing::{info, warn};

use cli::Args;
use prompt::PromptHandler;

fn main() -> Result<()> {
    let args = Args::parse();

    let mut transforms = transform::builtin();
    if args.list_modules {
        print_modules(&transforms);
        return Ok(());
    }

    logging::init(args.log.as_deref(), args.debug)?;
    let started = Local::now();

    let settings = args.settings()?;
    for (key, value) in args.module_options() {
        transform::configure(&mut transforms, key, value)
            .with_context(|| format!("Invalid module option: {key}"))?;
    }

    let (source, label) = open_input(&args, &settings)?;
    let input_size = source.size();
    let sinks = open_outputs(&args, &settings)?;
    let output_names: Vec<String> = sinks.iter().map(|s| s.name().to_string()).collect();
    logging::log_settings(&settings, source.name(), &output_names);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel()).context("Failed to set Ctrl+C handler")?;

    let mut pipeline = Pipeline::new(settings.clone(), source, sinks)
        .with_transforms(transforms)
        .with_cancellation(cancel)
        .with_device_label(label);

    if let Some(path) = &args.hash_blocks_save {
        let file = File::create(path)
            .with_context(|| format!("Failed to create block digest file: {}", path.display()))?;
        pipeline = pipeline.with_audit(Box::new(WriterAudit::new(BufWriter::new(file))));
    }

    let progress = if args.wants_progress(input_size) {
        let (pb, callback) = progress::bar(expected_bytes(&settings, input_size))?;
        pipeline = pipeline.with_progress(callback);
        Some(pb)
    } else {
        None
    };

    if !settings.ignore_transform_errors && std::io::stderr().is_terminal() {
        pipeline = pipeline.with_error_handler(Box::new(PromptHandler::new(progress.clone())));
    }

    let result = pipeline.run();
    if let Some(pb) = &progress {
        pb.finish_and_clear();
    }
    let report = result.context("Copy failed")?;

    eprint!("{}", output::summary(&report, &settings));
    if let Some(path) = &args.report_json {
        output::write_json(path, started, &settings, &report)?;
        info!(path = %path.display(), "Report written");
    }

    let failed = report.failed_outputs();
    if failed > 0 {
        anyhow::bail!("{failed} of {} output(s) failed", report.outputs.len());
    }
    Ok(())
}

fn open_input(args: &Args, settings: &JobSettings) -> Result<(Box<dyn Source>, String)> {
    let Some(path) = &args.input else {
        return Ok((Box::new(FileSource::stdin()), "stdin".to_string()));
    };
    let source = FileSource::open(path, settings.direct_input)
        .with_context(|| format!("Failed to open input: {}", path.display()))?;
    Ok((Box::new(source), device_label(path)))
}

fn open_outputs(args: &Args, settings: &JobSettings) -> Result<Vec<Box<dyn Sink>>> {
    if args.output.is_empty() {
        if settings.seek > 0 {
            anyhow::bail!("--seek needs a seekable output, not stdout");
        }
        return Ok(vec![Box::new(FileSink::stdout())]);
    }

    let options = SinkOptions {
        direct: settings.direct_output,
        truncate: settings.truncate_output,
    };
    let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(args.output.len());
    for path in &args.output {
        let sink = FileSink::open(path, options)
            .with_context(|| format!("Failed to open output: {}", path.display()))?;
        if settings.seek > 0 && !sink.is_seekable() {
            anyhow::bail!("--seek needs a seekable output: {}", path.display());
        }
        if settings.needs_reread() && !sink.can_reread() {
            warn!(output = %path.display(), "Output can not be read back, it will not be verified");
        }
        sinks.push(Box::new(sink));
    }
    Ok(sinks)
}

/// Partition labels follow the device name: `sda` gives `sda1`, `sda5`...
fn device_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn expected_bytes(settings: &JobSettings, input_size: Option<u64>) -> u64 {
    let available = input_size.map(|size| size.saturating_sub(settings.skip_bytes()));
    match (settings.count_bytes(), available) {
        (Some(count), Some(available)) => count.min(available),
        (Some(count), None) => count,
        (None, Some(available)) => available,
        (None, None) => 0,
    }
}

fn print_modules(transforms: &[Box<dyn Transform>]) {
    println!("Modules, configured with --module KEY[=VALUE]:\n");
    for transform in transforms {
        println!("{}", transform.help());
    }
}
