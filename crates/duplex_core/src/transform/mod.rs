//! Optional slot transforms run by the reader between digesting and
//! handing a slot to the sinks.
//!
//! Transforms are configured through `key` or `key=value` options, routed to
//! the first transform that accepts the key. Each transform keeps its own
//! state; nothing is shared between instances.

mod conv;
mod gzip;
mod pattern;

pub use conv::ConvTransform;
pub use gzip::GzipTransform;
pub use pattern::RegexTransform;

use crate::error::TransformError;
use crate::partition::PartitionDecoder;
use crate::settings::JobSettings;

/// Mutable view of a slot's bytes. `length` may shrink or grow up to the
/// slot capacity.
pub struct SlotBytes<'a> {
    buffer: &'a mut [u8],
    length: usize,
}

impl<'a> SlotBytes<'a> {
    pub fn new(buffer: &'a mut [u8], length: usize) -> Self {
        let length = length.min(buffer.len());
        Self { buffer, length }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.length]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[..self.length]
    }

    /// Replaces the contents with as much of `bytes` as fits and returns the
    /// number of bytes taken.
    pub fn replace(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.buffer.len());
        self.buffer[..n].copy_from_slice(&bytes[..n]);
        self.length = n;
        n
    }
}

/// What a transform knows about the slot it is applied to.
pub struct TransformContext<'a> {
    /// Source offset of the slot's first byte.
    pub start_offset: u64,
    pub is_last: bool,
    pub ibs: usize,
    pub partitions: Option<&'a PartitionDecoder>,
}

pub trait Transform: Send {
    fn name(&self) -> &str;

    /// Inactive transforms are skipped.
    fn is_active(&self) -> bool;

    fn accepts(&self, key: &str) -> bool;

    /// Applies a `key` flag or a `key=value` operand.
    fn configure(&mut self, key: &str, value: Option<&str>) -> Result<(), TransformError>;

    /// Validates the configuration against the job, once, before any slot.
    fn prepare(&mut self, _settings: &JobSettings) -> Result<(), TransformError> {
        Ok(())
    }

    /// Extra slot capacity this transform may need beyond `bs`.
    fn headroom(&self, _bs: usize) -> usize {
        0
    }

    fn needs_partitions(&self) -> bool {
        false
    }

    fn apply(&mut self, slot: &mut SlotBytes<'_>, ctx: &TransformContext<'_>) -> Result<(), TransformError>;

    /// Ends the output on a terminal slot the job reached early: after a
    /// cancellation or a stop decision. `ctx.is_last` is set. The slot may
    /// already have been through `apply`, or may not have reached this
    /// transform at all. Only transforms that owe trailing output act.
    fn close(&mut self, _slot: &mut SlotBytes<'_>, _ctx: &TransformContext<'_>) -> Result<(), TransformError> {
        Ok(())
    }

    /// Reports output left unfinished at the end of the job.
    fn finish(&mut self) -> Result<(), TransformError> {
        Ok(())
    }

    fn help(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformDecision {
    /// Keep going with this slot.
    Continue,
    /// End the job after this slot.
    Stop,
    /// Keep going and stop asking.
    IgnoreAll,
}

/// Decides what happens after a transform fails. Called on the reader, so a
/// slow decision pauses intake only.
pub trait TransformErrorHandler: Send {
    fn decide(&mut self, error: &TransformError) -> TransformDecision;
}

/// Ends the job on the first transform error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StopOnError;

impl TransformErrorHandler for StopOnError {
    fn decide(&mut self, _error: &TransformError) -> TransformDecision {
        TransformDecision::Stop
    }
}

/// Never stops for transform errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreErrors;

impl TransformErrorHandler for IgnoreErrors {
    fn decide(&mut self, _error: &TransformError) -> TransformDecision {
        TransformDecision::IgnoreAll
    }
}

/// One instance of every built-in transform, all inactive until configured.
/// Searching runs before compression so patterns see the copied bytes.
pub fn builtin() -> Vec<Box<dyn Transform>> {
    vec![
        Box::new(ConvTransform::new()),
        Box::new(RegexTransform::new()),
        Box::new(GzipTransform::new()),
    ]
}

/// Routes an option to the first transform accepting `key`.
pub fn configure(
    transforms: &mut [Box<dyn Transform>],
    key: &str,
    value: Option<&str>,
) -> Result<(), TransformError> {
    match transforms.iter_mut().find(|t| t.accepts(key)) {
        Some(transform) => transform.configure(key, value),
        None => Err(TransformError::new("duplex", format!("unknown module option '{key}'"))),
    }
}
