use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use duplex_core::{DigestAlgorithm, JobSettings};

use crate::units::{parse_block_size, parse_size};

/// Forensic block copy: one input, any number of outputs, with digests,
/// read error recovery and partition table decoding.
#[derive(Parser, Debug)]
#[command(name = "duplex")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Input file or device [default: stdin]
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Output file or device, repeatable [default: stdout]
    #[arg(short, long)]
    pub output: Vec<PathBuf>,

    /// Read and write up to BYTES at a time; overrides --ibs and --obs
    #[arg(long, value_parser = parse_block_size)]
    pub bs: Option<usize>,

    /// Read BYTES at a time
    #[arg(long, value_parser = parse_block_size)]
    pub ibs: Option<usize>,

    /// Write BYTES at a time
    #[arg(long, value_parser = parse_block_size)]
    pub obs: Option<usize>,

    /// Copy only N input blocks
    #[arg(long, value_parser = parse_size)]
    pub count: Option<u64>,

    /// Skip N ibs-sized blocks at the start of the input
    #[arg(long, value_parser = parse_size, default_value = "0")]
    pub skip: u64,

    /// Skip N obs-sized blocks at the start of every output
    #[arg(long, value_parser = parse_size, default_value = "0")]
    pub seek: u64,

    /// Reads per sector before it is zero-filled; 0 zero-fills failing blocks at once
    #[arg(long, default_value_t = 1)]
    pub reading_attempts: u32,

    /// Chunk size used to narrow down a read error
    #[arg(long, value_parser = parse_block_size, default_value = "512")]
    pub reread_bs: usize,

    /// Block digest algorithms, comma separated
    #[arg(long, default_value = "md5")]
    pub hash_blocks: String,

    /// Stream digest algorithms, comma separated
    #[arg(long, default_value = "md5")]
    pub hash_files: String,

    /// Save every block digest to FILE
    #[arg(long, value_name = "FILE")]
    pub hash_blocks_save: Option<PathBuf>,

    /// Read back every output and compare against the input block digests
    #[arg(short = 'c', long)]
    pub hash_blocks_check: bool,

    /// Digest the input stream
    #[arg(long)]
    pub hash_file_in: bool,

    /// Digest every output stream
    #[arg(long)]
    pub hash_file_out: bool,

    /// Digest the input and every output stream
    #[arg(short = 'f', long)]
    pub hash_file_all: bool,

    #[arg(long)]
    pub no_direct_input: bool,

    #[arg(long)]
    pub no_direct_output: bool,

    /// Decode and print the MBR partition table of the input
    #[arg(long)]
    pub get_partition_table: bool,

    /// No read retries, 16M blocks
    #[arg(long)]
    pub fast: bool,

    /// Run the reader and every writer on a single thread
    #[arg(short = 'p', long)]
    pub no_parallel: bool,

    #[arg(long)]
    pub no_progress_bar: bool,

    /// Never stop for a module error
    #[arg(long)]
    pub ignore_modules_errors: bool,

    /// Log to FILE
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Log debug messages
    #[arg(long)]
    pub debug: bool,

    /// Write the job report as JSON to FILE
    #[arg(long, value_name = "FILE")]
    pub report_json: Option<PathBuf>,

    /// Module option, KEY or KEY=VALUE, repeatable
    #[arg(short, long = "module", value_name = "KEY[=VALUE]")]
    pub module: Vec<String>,

    /// Describe the available modules and exit
    #[arg(long)]
    pub list_modules: bool,
}

impl Args {
    /// Builds the job settings. Validation is left to the pipeline.
    pub fn settings(&self) -> Result<JobSettings> {
        let mut settings = JobSettings::default();
        if self.fast {
            settings = settings.fast();
        }
        if self.bs.is_some() || self.ibs.is_some() || self.obs.is_some() {
            settings = settings.with_block_sizes(self.bs, self.ibs, self.obs);
        }
        settings.skip = self.skip;
        settings.seek = self.seek;
        settings.count = self.count;
        if !self.fast {
            settings.reading_attempts = self.reading_attempts;
        }
        settings.reread_bs = self.reread_bs;

        settings.block_digests = DigestAlgorithm::parse_list(&self.hash_blocks)
            .context("Invalid --hash-blocks")?;
        settings.file_digests =
            DigestAlgorithm::parse_list(&self.hash_files).context("Invalid --hash-files")?;
        settings.save_block_digests = self.hash_blocks_save.is_some();
        settings.verify_blocks = self.hash_blocks_check;
        settings.digest_input = self.hash_file_in || self.hash_file_all;
        settings.digest_outputs = self.hash_file_out || self.hash_file_all;

        settings.partition_table = self.get_partition_table;
        settings.direct_input = !self.no_direct_input;
        settings.direct_output = !self.no_direct_output;
        settings.parallel = !self.no_parallel;
        settings.ignore_transform_errors = self.ignore_modules_errors;

        settings.normalize();
        Ok(settings)
    }

    /// Splits every `--module` argument into its key and optional value.
    pub fn module_options(&self) -> Vec<(&str, Option<&str>)> {
        self.module
            .iter()
            .map(|option| match option.split_once('=') {
                Some((key, value)) => (key, Some(value)),
                None => (option.as_str(), None),
            })
            .collect()
    }

    /// Whether the progress bar can show anything useful.
    pub fn wants_progress(&self, input_size: Option<u64>) -> bool {
        !self.no_progress_bar && (input_size.is_some() || self.count.is_some())
    }
}
