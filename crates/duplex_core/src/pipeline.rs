//! Job driver: one reader filling the ring, one writer per sink draining it.
//!
//! In parallel mode the reader and every writer run on their own scoped
//! thread. In sequential mode the same steps run in one loop: the reader
//! fills a slot, then each writer drains it in turn.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::aligned_buffer::AlignedBuffer;
use crate::audit::AuditSink;
use crate::digest::{DigestTracker, StreamDigest};
use crate::error::{CoreError, Result, SinkError, TransformError};
use crate::partition::PartitionDecoder;
use crate::reader::{ErrorRegion, ResilientReader, StreamCounters, push_region};
use crate::report::{JobReport, SinkReport, StreamReport, TransformFailure};
use crate::ring::{RingCoordinator, SinkId, SlotPayload};
use crate::settings::{JobSettings, SECTOR_SIZE};
use crate::traits::{Sink, Source};
use crate::transform::{
    IgnoreErrors, SlotBytes, StopOnError, Transform, TransformContext, TransformDecision,
    TransformErrorHandler,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// A slot was published. `position` is the next source offset to read.
    Advanced {
        position: u64,
        bytes_read: u64,
        total: Option<u64>,
    },
    BadRegion(ErrorRegion),
}

pub type ProgressCallback = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Cooperative stop request, checked by the reader before each cycle.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Pipeline {
    settings: JobSettings,
    source: Box<dyn Source>,
    sinks: Vec<Box<dyn Sink>>,
    transforms: Vec<Box<dyn Transform>>,
    audit: Option<Box<dyn AuditSink>>,
    handler: Option<Box<dyn TransformErrorHandler>>,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    device_label: Option<String>,
}

impl Pipeline {
    pub fn new(settings: JobSettings, source: Box<dyn Source>, sinks: Vec<Box<dyn Sink>>) -> Self {
        Self {
            settings,
            source,
            sinks,
            transforms: Vec::new(),
            audit: None,
            handler: None,
            progress: None,
            cancel: CancellationToken::new(),
            device_label: None,
        }
    }

    pub fn with_transforms(mut self, transforms: Vec<Box<dyn Transform>>) -> Self {
        self.transforms = transforms;
        self
    }

    /// Receives block digests (when `save_block_digests` is set) and
    /// unreadable regions.
    pub fn with_audit(mut self, audit: Box<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Defaults to [`StopOnError`], or [`IgnoreErrors`] with
    /// `ignore_transform_errors`.
    pub fn with_error_handler(mut self, handler: Box<dyn TransformErrorHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Prefix for partition labels. Defaults to the source name.
    pub fn with_device_label(mut self, label: impl Into<String>) -> Self {
        self.device_label = Some(label.into());
        self
    }

    /// Runs the job to completion.
    ///
    /// Sink failures do not fail the job; they are reported per sink in the
    /// returned [`JobReport`].
    ///
    /// # Errors
    ///
    /// * `CoreError::InvalidConfig` - Settings or transform options rejected
    /// * `CoreError::Allocation` - Slot buffers could not be allocated
    /// * `CoreError::Audit` - The audit trail could not be written
    /// * `CoreError::Panicked` - A pipeline thread panicked
    pub fn run(self) -> Result<JobReport> {
        let started = Instant::now();
        let Pipeline {
            settings,
            source,
            sinks,
            mut transforms,
            audit,
            handler,
            progress,
            cancel,
            device_label,
        } = self;

        settings.validate()?;
        if sinks.is_empty() {
            return Err(CoreError::InvalidConfig("at least one output is required".into()));
        }

        for transform in transforms.iter_mut().filter(|t| t.is_active()) {
            transform
                .prepare(&settings)
                .map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        }
        transforms.retain(|t| t.is_active());

        let skip = settings.skip_bytes();
        let size = source.size();
        if let Some(size) = size.filter(|size| skip > *size) {
            return Err(CoreError::InvalidConfig(format!(
                "cannot skip to offset {skip}: input is only {size} bytes"
            )));
        }
        let total = size.map(|size| {
            let left = size - skip;
            settings.count_bytes().map_or(left, |limit| limit.min(left))
        });

        let headroom = transforms
            .iter()
            .map(|t| t.headroom(settings.bs))
            .max()
            .unwrap_or(0);
        let capacity = settings.bs + headroom;
        let ring = RingCoordinator::new(sinks.len(), capacity)?;

        info!(
            input = source.name(),
            outputs = sinks.len(),
            bs = settings.bs,
            ibs = settings.ibs,
            obs = settings.obs,
            parallel = settings.parallel,
            transforms = transforms.len(),
            "Starting copy"
        );

        let decoder = (settings.partition_table || transforms.iter().any(|t| t.needs_partitions()))
            .then(|| PartitionDecoder::new(device_label.unwrap_or_else(|| source.name().to_string())));
        let handler = handler.unwrap_or_else(|| {
            if settings.ignore_transform_errors {
                Box::new(IgnoreErrors)
            } else {
                Box::new(StopOnError)
            }
        });

        let mut reader = ReaderTask {
            reader: ResilientReader::new(&settings),
            tracker: DigestTracker::new(settings.block_digests.clone(), settings.ibs, settings.obs),
            input_digest: if settings.digest_input {
                StreamDigest::new(&settings.file_digests)
            } else {
                StreamDigest::disabled()
            },
            source,
            decoder,
            transforms,
            audit,
            audit_error: None,
            handler,
            ignore_all: settings.ignore_transform_errors,
            progress,
            cancel,
            total,
            slot: 0,
            position: skip,
            cycle: 0,
            bytes_published: 0,
            bad_regions: Vec::new(),
            transform_errors: Vec::new(),
            cancelled: false,
            settings: settings.clone(),
        };
        let mut writers: Vec<WriterTask> = sinks
            .into_iter()
            .enumerate()
            .map(|(id, sink)| WriterTask::new(id, sink, &settings, capacity))
            .collect();

        if settings.parallel {
            let (r, w) = run_threaded(&ring, reader, writers)?;
            reader = r;
            writers = w;
        } else {
            run_sequential(&ring, &mut reader, &mut writers);
        }

        let outputs: Vec<SinkReport> = writers.into_iter().map(WriterTask::finish).collect();
        let report = reader.finish(outputs, started)?;

        info!(
            bytes = report.input.counters.bytes,
            bad_regions = report.bad_regions.len(),
            failed_outputs = report.failed_outputs(),
            cancelled = report.cancelled,
            "Copy finished"
        );
        Ok(report)
    }
}

fn run_sequential(ring: &RingCoordinator, reader: &mut ReaderTask, writers: &mut [WriterTask]) {
    loop {
        let more = reader.step(ring);
        for writer in writers.iter_mut().filter(|w| !w.done) {
            writer.step(ring);
        }
        if !more {
            break;
        }
    }
}

fn run_threaded(
    ring: &RingCoordinator,
    mut reader: ReaderTask,
    writers: Vec<WriterTask>,
) -> Result<(ReaderTask, Vec<WriterTask>)> {
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(writers.len());
        for mut writer in writers {
            let spawned = thread::Builder::new()
                .name(format!("duplex-writer-{}", writer.id))
                .spawn_scoped(scope, move || {
                    let _guard = WithdrawOnPanic { ring, sink: writer.id };
                    while writer.step(ring) {}
                    writer
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    ring.shutdown();
                    return Err(CoreError::Io(e));
                }
            }
        }

        let reader_handle = thread::Builder::new()
            .name("duplex-reader".into())
            .spawn_scoped(scope, move || {
                let _guard = ShutdownOnPanic { ring };
                while reader.step(ring) {}
                reader
            });
        let reader_handle = match reader_handle {
            Ok(handle) => handle,
            Err(e) => {
                ring.shutdown();
                return Err(CoreError::Io(e));
            }
        };

        let reader = reader_handle
            .join()
            .map_err(|e| CoreError::Panicked(panic_message(e.as_ref())))?;
        let mut writers = Vec::with_capacity(handles.len());
        for handle in handles {
            writers.push(
                handle
                    .join()
                    .map_err(|e| CoreError::Panicked(panic_message(e.as_ref())))?,
            );
        }
        Ok((reader, writers))
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Closes the ring if the reader unwinds, so writers stop waiting.
struct ShutdownOnPanic<'a> {
    ring: &'a RingCoordinator,
}

impl Drop for ShutdownOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.ring.shutdown();
        }
    }
}

/// Withdraws a writer's sink if it unwinds, so the reader is not held back.
struct WithdrawOnPanic<'a> {
    ring: &'a RingCoordinator,
    sink: SinkId,
}

impl Drop for WithdrawOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.ring.deactivate_sink(self.sink);
        }
    }
}

struct ReaderTask {
    settings: JobSettings,
    source: Box<dyn Source>,
    reader: ResilientReader,
    tracker: DigestTracker,
    input_digest: StreamDigest,
    decoder: Option<PartitionDecoder>,
    transforms: Vec<Box<dyn Transform>>,
    audit: Option<Box<dyn AuditSink>>,
    audit_error: Option<CoreError>,
    handler: Box<dyn TransformErrorHandler>,
    ignore_all: bool,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
    total: Option<u64>,
    slot: usize,
    position: u64,
    cycle: u64,
    bytes_published: u64,
    bad_regions: Vec<ErrorRegion>,
    transform_errors: Vec<TransformFailure>,
    cancelled: bool,
}

impl ReaderTask {
    /// Fills and publishes one slot. Returns `false` once the terminal slot
    /// has been published or the ring has closed.
    fn step(&mut self, ring: &RingCoordinator) -> bool {
        if self.cancel.is_cancelled() {
            warn!(position = self.position, "Cancellation requested, ending copy");
            self.cancelled = true;
            if let Some(mut guard) = ring.acquire_for_fill(self.slot) {
                let payload: &mut SlotPayload = &mut guard;
                let first_block = self.reader.counters().blocks();
                let length = self.close_transforms(payload.buffer.as_mut_slice(), 0);
                self.seal(payload, 0, length, first_block);
                guard.publish(length, true);
            }
            return false;
        }

        let Some(mut guard) = ring.acquire_for_fill(self.slot) else {
            debug!(position = self.position, "No active outputs left, reader stopping");
            return false;
        };
        let payload: &mut SlotPayload = &mut guard;

        let bs = self.settings.bs;
        let first_block = self.reader.counters().blocks();
        let outcome = self
            .reader
            .fill(self.source.as_mut(), &mut payload.buffer[..bs], self.position, bs);
        let mut is_last = outcome.is_last;

        for region in &outcome.bad_regions {
            self.emit(&ProgressEvent::BadRegion(*region));
            if let Some(audit) = self.audit.as_mut() {
                if let Err(e) = audit.bad_region(region) {
                    self.audit_error.get_or_insert(e);
                }
            }
            push_region(&mut self.bad_regions, region.start, region.end);
        }

        let read = &payload.buffer[..outcome.bytes];
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.observe(read, self.position);
        }
        if self.settings.save_block_digests {
            if let Some(audit) = self.audit.as_mut() {
                for record in self.tracker.digest_blocks(first_block, self.position, read) {
                    if let Err(e) = audit.block_digest(&record) {
                        self.audit_error.get_or_insert(e);
                        break;
                    }
                }
            }
        }
        self.input_digest.update(read);

        if self.audit_error.is_some() {
            error!(position = self.position, "Audit trail failed, ending copy");
            is_last = true;
        }

        let (length, stopped) = self.apply_transforms(payload.buffer.as_mut_slice(), outcome.bytes, is_last);
        let is_last = is_last || stopped;

        self.seal(payload, outcome.bytes, length, first_block);
        guard.publish(length, is_last);

        self.emit(&ProgressEvent::Advanced {
            position: self.position,
            bytes_read: self.reader.counters().bytes,
            total: self.total,
        });
        self.slot = RingCoordinator::next(self.slot);
        !is_last
    }

    /// Runs the active transforms over the slot. Returns the new length and
    /// whether a stop decision made this the terminal slot.
    fn apply_transforms(&mut self, buffer: &mut [u8], length: usize, is_last: bool) -> (usize, bool) {
        if self.transforms.is_empty() {
            return (length, false);
        }
        let ctx = TransformContext {
            start_offset: self.position,
            is_last,
            ibs: self.settings.ibs,
            partitions: self.decoder.as_ref(),
        };
        let mut bytes = SlotBytes::new(buffer, length);
        let mut stopped = false;
        for transform in self.transforms.iter_mut().filter(|t| t.is_active()) {
            let Err(err) = transform.apply(&mut bytes, &ctx) else {
                continue;
            };
            error!(transform = transform.name(), offset = self.position, error = %err.message, "Transform failed");
            let decision = if self.ignore_all {
                TransformDecision::IgnoreAll
            } else {
                self.handler.decide(&err)
            };
            self.transform_errors.push(failure(err, self.position));
            match decision {
                TransformDecision::Continue => {}
                TransformDecision::IgnoreAll => {
                    info!("Ignoring further transform errors");
                    self.ignore_all = true;
                }
                TransformDecision::Stop => {
                    warn!(offset = self.position, "Stopping after transform error");
                    stopped = true;
                    break;
                }
            }
        }
        let length = bytes.len();
        if stopped {
            return (self.close_transforms(buffer, length), true);
        }
        (length, false)
    }

    /// Lets every active transform end its output on the terminal slot.
    fn close_transforms(&mut self, buffer: &mut [u8], length: usize) -> usize {
        let ctx = TransformContext {
            start_offset: self.position,
            is_last: true,
            ibs: self.settings.ibs,
            partitions: self.decoder.as_ref(),
        };
        let mut bytes = SlotBytes::new(buffer, length);
        for transform in self.transforms.iter_mut().filter(|t| t.is_active()) {
            if let Err(err) = transform.close(&mut bytes, &ctx) {
                error!(transform = transform.name(), offset = self.position, error = %err.message, "Transform could not close its output");
                self.transform_errors.push(failure(err, self.position));
            }
        }
        bytes.len()
    }

    /// Stamps the payload and advances the reader past it.
    fn seal(&mut self, payload: &mut SlotPayload, read: usize, length: usize, first_block: u64) {
        payload.checks = if self.settings.verify_blocks {
            self.tracker
                .check_digests(self.bytes_published, &payload.buffer[..length])
        } else {
            Vec::new()
        };
        payload.offset = self.position;
        payload.output_offset = self.bytes_published;
        payload.cycle = self.cycle;
        payload.first_block = first_block;

        self.position += read as u64;
        self.bytes_published += length as u64;
        self.cycle += 1;
    }

    fn emit(&self, event: &ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    fn finish(mut self, outputs: Vec<SinkReport>, started: Instant) -> Result<JobReport> {
        for transform in &mut self.transforms {
            if let Err(err) = transform.finish() {
                warn!(transform = transform.name(), error = %err.message, "Transform did not finish cleanly");
                self.transform_errors.push(failure(err, self.position));
            }
        }
        if let Some(e) = self.audit_error.take() {
            return Err(e);
        }
        if let Some(audit) = self.audit.as_mut() {
            audit.flush()?;
        }

        let (partitions, partition_state) = match &self.decoder {
            Some(decoder) => (decoder.snapshot(), Some(decoder.state().clone())),
            None => (Vec::new(), None),
        };
        Ok(JobReport {
            input: StreamReport {
                name: self.source.name().to_string(),
                counters: *self.reader.counters(),
                digests: self.input_digest.finalize(),
            },
            outputs,
            bytes_published: self.bytes_published,
            bad_regions: self.bad_regions,
            partitions,
            partition_state,
            transform_errors: self.transform_errors,
            elapsed: started.elapsed(),
            cancelled: self.cancelled,
        })
    }
}

fn failure(err: TransformError, offset: u64) -> TransformFailure {
    TransformFailure {
        transform: err.transform,
        message: err.message,
        offset,
    }
}

struct WriterTask {
    id: SinkId,
    sink: Box<dyn Sink>,
    obs: usize,
    /// Output offset of the first byte, from `seek`.
    base: u64,
    capacity: usize,
    counters: StreamCounters,
    digest: StreamDigest,
    tracker: DigestTracker,
    verify: bool,
    reread: bool,
    reread_buffer: Option<AlignedBuffer>,
    slot: usize,
    error: Option<SinkError>,
    completed: bool,
    done: bool,
}

impl WriterTask {
    fn new(id: SinkId, sink: Box<dyn Sink>, settings: &JobSettings, capacity: usize) -> Self {
        let mut verify = settings.verify_blocks;
        let mut reread = settings.needs_reread();
        if reread && !sink.can_reread() {
            warn!(
                sink = sink.name(),
                "Output cannot be read back: skipping verification, digesting written bytes"
            );
            verify = false;
            reread = false;
        }
        let digest = if settings.digest_outputs {
            StreamDigest::new(&settings.file_digests)
        } else {
            StreamDigest::disabled()
        };
        Self {
            id,
            sink,
            obs: settings.obs,
            base: settings.seek_bytes(),
            capacity,
            counters: StreamCounters::default(),
            digest,
            tracker: DigestTracker::new(settings.block_digests.clone(), settings.ibs, settings.obs),
            verify,
            reread,
            reread_buffer: None,
            slot: 0,
            error: None,
            completed: false,
            done: false,
        }
    }

    /// Drains one slot. Returns `false` once this writer is done.
    fn step(&mut self, ring: &RingCoordinator) -> bool {
        let Some(guard) = ring.acquire_for_drain(self.slot, self.id) else {
            // still active here means the stream ended with an empty slot
            self.completed = self.error.is_none() && ring.is_active(self.id);
            self.done = true;
            return false;
        };

        match self.drain(&guard) {
            Ok(()) => {
                let is_last = guard.is_last;
                guard.mark_drained();
                self.slot = RingCoordinator::next(self.slot);
                if is_last {
                    self.completed = true;
                    self.done = true;
                }
                !is_last
            }
            Err(err) => {
                error!(sink = self.sink.name(), error = %err, "Output failed, withdrawing it");
                self.error = Some(err);
                self.done = true;
                guard.deactivate();
                false
            }
        }
    }

    fn drain(&mut self, payload: &SlotPayload) -> std::result::Result<(), SinkError> {
        let data = payload.data();
        if data.is_empty() {
            return Ok(());
        }
        let start = self.base + payload.output_offset;

        if self.sink.is_direct() && !data.len().is_multiple_of(SECTOR_SIZE) {
            debug!(sink = self.sink.name(), length = data.len(), "Partial block, dropping direct I/O");
            self.sink
                .reopen_without_alignment_constraint()
                .map_err(SinkError::Reopen)?;
        }

        for (i, chunk) in data.chunks(self.obs).enumerate() {
            let at = start + (i * self.obs) as u64;
            write_all(self.sink.as_mut(), at, chunk)?;
            self.counters.record(chunk.len(), self.obs);
        }

        if !self.reread {
            self.digest.update(data);
            return Ok(());
        }

        if self.reread_buffer.is_none() {
            let buffer = AlignedBuffer::new_default(self.capacity)
                .map_err(|_| SinkError::Allocation { size: self.capacity })?;
            self.reread_buffer = Some(buffer);
        }
        let Some(buffer) = self.reread_buffer.as_mut() else {
            return Err(SinkError::Allocation { size: self.capacity });
        };
        let back = &mut buffer[..data.len()];
        for (i, chunk) in back.chunks_mut(self.obs).enumerate() {
            let at = start + (i * self.obs) as u64;
            read_back(self.sink.as_mut(), at, chunk)?;
        }

        self.digest.update(back);
        if self.verify {
            self.tracker.verify(&payload.checks, payload.output_offset, back)?;
        }
        Ok(())
    }

    fn finish(mut self) -> SinkReport {
        if self.error.is_none() {
            if let Err(e) = self.sink.finish() {
                error!(sink = self.sink.name(), error = %e, "Unable to close output");
                self.error = Some(SinkError::Write {
                    offset: self.base + self.counters.bytes,
                    source: e,
                });
            }
        }
        let digests = if self.error.is_none() {
            self.digest.finalize()
        } else {
            Vec::new()
        };
        SinkReport {
            name: self.sink.name().to_string(),
            counters: self.counters,
            digests,
            error: self.error.map(|e| e.to_string()),
            completed: self.completed,
        }
    }
}

fn write_all(sink: &mut dyn Sink, at: u64, bytes: &[u8]) -> std::result::Result<(), SinkError> {
    let mut done = 0;
    while done < bytes.len() {
        let offset = at + done as u64;
        match sink.write(offset, &bytes[done..]) {
            Ok(0) => return Err(SinkError::ShortWrite { offset }),
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(SinkError::Write { offset, source }),
        }
    }
    Ok(())
}

fn read_back(sink: &mut dyn Sink, at: u64, buf: &mut [u8]) -> std::result::Result<(), SinkError> {
    let mut done = 0;
    while done < buf.len() {
        let offset = at + done as u64;
        match sink.reread(offset, &mut buf[done..]) {
            Ok(0) => {
                return Err(SinkError::ShortReread {
                    expected: buf.len(),
                    actual: done,
                });
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => return Err(SinkError::Reread { offset, source }),
        }
    }
    Ok(())
}
