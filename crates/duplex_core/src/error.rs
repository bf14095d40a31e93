use std::io;
use thiserror::Error;

use crate::digest::DigestAlgorithm;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown message digest: {0}")]
    UnknownDigest(String),

    #[error("Failed to allocate {size} bytes with {alignment} alignment")]
    Allocation { size: usize, alignment: usize },

    #[error("Source error at offset {offset}: {source}")]
    Source { offset: u64, source: io::Error },

    #[error("Audit log error: {0}")]
    Audit(io::Error),

    #[error("Pipeline thread panicked: {0}")]
    Panicked(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Fatal, sink-specific failures. They withdraw the sink from the ring and are
/// reported per sink; the job continues for the remaining sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("write error at offset {offset}: {source}")]
    Write { offset: u64, source: io::Error },

    #[error("sink accepted no bytes at offset {offset}")]
    ShortWrite { offset: u64 },

    #[error("re-read error at offset {offset}: {source}")]
    Reread { offset: u64, source: io::Error },

    #[error("unable to load data just written: expected {expected} bytes, read {actual}")]
    ShortReread { expected: usize, actual: usize },

    #[error(
        "{algorithm} block check failed for {start:016x}-{end:016x}: expected {expected}, found {actual}"
    )]
    VerificationFailed {
        start: u64,
        end: u64,
        algorithm: DigestAlgorithm,
        expected: String,
        actual: String,
    },

    #[error("unable to drop direct I/O: {0}")]
    Reopen(io::Error),

    #[error("unable to allocate verification buffer of {size} bytes")]
    Allocation { size: usize },
}

#[derive(Debug, Clone, Error)]
#[error("{transform}: {message}")]
pub struct TransformError {
    pub transform: String,
    pub message: String,
}

impl TransformError {
    pub fn new(transform: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            transform: transform.into(),
            message: message.into(),
        }
    }
}
