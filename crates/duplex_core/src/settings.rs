use serde::Serialize;
use tracing::info;

use crate::digest::DigestAlgorithm;
use crate::error::{CoreError, Result};

pub const SECTOR_SIZE: usize = 512;
const DEFAULT_BLOCK_SIZE: usize = 512;

/// Job configuration. Built once before the pipeline starts and only read by it.
#[derive(Debug, Clone, Serialize)]
pub struct JobSettings {
    /// Slot capacity in bytes.
    pub bs: usize,
    /// Read step.
    pub ibs: usize,
    /// Write step.
    pub obs: usize,
    /// Input blocks (`ibs`) skipped before copying.
    pub skip: u64,
    /// Output blocks (`obs`) skipped on every sink before writing.
    pub seek: u64,
    /// Maximum number of input blocks, complete plus partial.
    pub count: Option<u64>,
    /// Reads per sector before it is given up. 0 zero-fills failing steps outright.
    pub reading_attempts: u32,
    /// Chunk size of the intermediate degraded read.
    pub reread_bs: usize,
    pub block_digests: Vec<DigestAlgorithm>,
    pub file_digests: Vec<DigestAlgorithm>,
    /// Emit per-block audit records.
    pub save_block_digests: bool,
    /// Re-read every sink and compare against the block digests.
    pub verify_blocks: bool,
    pub digest_input: bool,
    pub digest_outputs: bool,
    pub partition_table: bool,
    pub direct_input: bool,
    pub direct_output: bool,
    pub truncate_output: bool,
    pub parallel: bool,
    pub ignore_transform_errors: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            bs: DEFAULT_BLOCK_SIZE,
            ibs: DEFAULT_BLOCK_SIZE,
            obs: DEFAULT_BLOCK_SIZE,
            skip: 0,
            seek: 0,
            count: None,
            reading_attempts: 1,
            reread_bs: SECTOR_SIZE,
            block_digests: vec![DigestAlgorithm::Md5],
            file_digests: vec![DigestAlgorithm::Md5],
            save_block_digests: false,
            verify_blocks: false,
            digest_input: false,
            digest_outputs: false,
            partition_table: false,
            direct_input: true,
            direct_output: true,
            truncate_output: true,
            parallel: true,
            ignore_transform_errors: false,
        }
    }
}

impl JobSettings {
    /// Resolves the three block sizes the way `dd` does: `bs` sets all of
    /// them; otherwise `bs` is the larger of `ibs`/`obs` and a missing one
    /// defaults to 512.
    pub fn with_block_sizes(mut self, bs: Option<usize>, ibs: Option<usize>, obs: Option<usize>) -> Self {
        match (bs, ibs, obs) {
            (Some(bs), _, _) => {
                self.bs = bs;
                self.ibs = bs;
                self.obs = bs;
            }
            (None, None, None) => {
                self.bs = DEFAULT_BLOCK_SIZE;
                self.ibs = DEFAULT_BLOCK_SIZE;
                self.obs = DEFAULT_BLOCK_SIZE;
            }
            (None, ibs, obs) => {
                self.ibs = ibs.unwrap_or(DEFAULT_BLOCK_SIZE);
                self.obs = obs.unwrap_or(DEFAULT_BLOCK_SIZE);
                self.bs = self.ibs.max(self.obs);
            }
        }
        self
    }

    /// Fast profile: no retries, 16 MiB slots.
    pub fn fast(self) -> Self {
        let mut settings = self.with_block_sizes(Some(16 * 1024 * 1024), None, None);
        settings.reading_attempts = 0;
        settings
    }

    pub fn skip_bytes(&self) -> u64 {
        self.skip * self.ibs as u64
    }

    pub fn seek_bytes(&self) -> u64 {
        self.seek * self.obs as u64
    }

    pub fn count_bytes(&self) -> Option<u64> {
        self.count.map(|c| c * self.ibs as u64)
    }

    /// Whether sinks must be read back after writing.
    pub fn needs_reread(&self) -> bool {
        self.verify_blocks || self.digest_outputs
    }

    /// Rejects inconsistent configurations before any buffer is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.bs == 0 || self.ibs == 0 || self.obs == 0 {
            return Err(CoreError::InvalidConfig(
                "block sizes must be greater than 0".into(),
            ));
        }

        let (small, large) = if self.ibs <= self.obs {
            (self.ibs, self.obs)
        } else {
            (self.obs, self.ibs)
        };
        if !large.is_multiple_of(small) {
            return Err(CoreError::InvalidConfig(format!(
                "obs ({}) must be a multiple of ibs ({}) or vice versa",
                self.obs, self.ibs
            )));
        }
        if self.bs != large {
            return Err(CoreError::InvalidConfig(format!(
                "bs ({}) must equal the larger of ibs and obs ({large})",
                self.bs
            )));
        }

        if self.reading_attempts > 0 {
            if self.reread_bs < SECTOR_SIZE || self.reread_bs > self.ibs {
                return Err(CoreError::InvalidConfig(format!(
                    "reread-bs ({}) must be between {SECTOR_SIZE} and ibs ({})",
                    self.reread_bs, self.ibs
                )));
            }
            if !self.reread_bs.is_multiple_of(SECTOR_SIZE) {
                return Err(CoreError::InvalidConfig(format!(
                    "reread-bs ({}) must be a multiple of {SECTOR_SIZE}",
                    self.reread_bs
                )));
            }
        }

        if self.partition_table {
            if self.skip > 0 {
                return Err(CoreError::InvalidConfig(
                    "partition detection needs the input from its first byte (skip=0)".into(),
                ));
            }
            if !self.ibs.is_multiple_of(SECTOR_SIZE) || !self.obs.is_multiple_of(SECTOR_SIZE) {
                return Err(CoreError::InvalidConfig(
                    "buffers must be a multiple of 512 to enable partition detection".into(),
                ));
            }
        }

        if (self.verify_blocks || self.save_block_digests) && self.block_digests.is_empty() {
            return Err(CoreError::InvalidConfig(
                "no digest algorithm configured for blocks".into(),
            ));
        }
        if (self.digest_input || self.digest_outputs) && self.file_digests.is_empty() {
            return Err(CoreError::InvalidConfig(
                "no digest algorithm configured for files".into(),
            ));
        }

        Ok(())
    }

    /// Adjusts flags that conflict with the chosen geometry.
    pub fn normalize(&mut self) {
        let unaligned = [self.bs, self.ibs, self.obs]
            .iter()
            .any(|size| !size.is_multiple_of(SECTOR_SIZE));
        if unaligned && (self.direct_input || self.direct_output) {
            info!(
                bs = self.bs,
                ibs = self.ibs,
                obs = self.obs,
                "Block sizes are not multiples of 512, disabling direct I/O"
            );
            self.direct_input = false;
            self.direct_output = false;
        }
        if self.seek > 0 && self.truncate_output {
            info!(seek = self.seek, "Seek requested, output files will not be truncated");
            self.truncate_output = false;
        }
    }
}
