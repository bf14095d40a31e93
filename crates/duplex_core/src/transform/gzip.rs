//! Streams the whole job output through gzip.

use std::io::Write;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::debug;

use crate::error::TransformError;
use crate::settings::JobSettings;
use crate::transform::{SlotBytes, Transform, TransformContext};

const NAME: &str = "gzip";
const DEFAULT_LEVEL: u32 = 6;
const HEADROOM: usize = 256 * 1024;

/// Replaces each slot with the compressed bytes produced so far. Output that
/// does not fit a slot is carried into the next one; the terminal slot
/// closes the gzip stream.
pub struct GzipTransform {
    level: u32,
    active: bool,
    encoder: Option<GzEncoder<Vec<u8>>>,
    pending: Vec<u8>,
    /// Source offset of the last slot compressed.
    last_slot: Option<u64>,
}

impl Default for GzipTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipTransform {
    pub fn new() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            active: false,
            encoder: None,
            pending: Vec::new(),
            last_slot: None,
        }
    }

    fn compress(&mut self, slot: &mut SlotBytes<'_>, offset: u64, is_last: bool) -> Result<(), TransformError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(Self::error("compression stream is not initialised"));
        };
        self.last_slot = Some(offset);
        encoder
            .write_all(slot.data())
            .map_err(|e| Self::error(format!("compression failed: {e}")))?;
        if is_last {
            encoder
                .try_finish()
                .map_err(|e| Self::error(format!("unable to finish gzip stream: {e}")))?;
        }
        self.pending.append(encoder.get_mut());

        let taken = slot.replace(&self.pending);
        self.pending.drain(..taken);

        if is_last {
            self.end_stream()?;
        }
        Ok(())
    }

    /// Appends the trailer after output already in the slot.
    fn seal(&mut self, slot: &mut SlotBytes<'_>) -> Result<(), TransformError> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        encoder
            .try_finish()
            .map_err(|e| Self::error(format!("unable to finish gzip stream: {e}")))?;
        self.pending.append(encoder.get_mut());

        let mut out = Vec::with_capacity(slot.len() + self.pending.len());
        out.extend_from_slice(slot.data());
        out.append(&mut self.pending);
        let taken = slot.replace(&out);
        self.pending.extend_from_slice(&out[taken..]);
        self.end_stream()
    }

    fn end_stream(&mut self) -> Result<(), TransformError> {
        self.encoder = None;
        self.active = false;
        if !self.pending.is_empty() {
            return Err(Self::error(format!(
                "{} compressed bytes do not fit in the final block",
                self.pending.len()
            )));
        }
        Ok(())
    }

    fn error(message: impl Into<String>) -> TransformError {
        TransformError::new(NAME, message)
    }
}

impl Transform for GzipTransform {
    fn name(&self) -> &str {
        NAME
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn accepts(&self, key: &str) -> bool {
        key == "compression"
    }

    fn configure(&mut self, key: &str, value: Option<&str>) -> Result<(), TransformError> {
        if key != "compression" {
            return Err(Self::error(format!("invalid operand '{key}'")));
        }
        let level = value
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|level| *level <= 9)
            .ok_or_else(|| Self::error("invalid compression level (expected 0-9)"))?;
        self.level = level;
        self.active = true;
        Ok(())
    }

    fn prepare(&mut self, settings: &JobSettings) -> Result<(), TransformError> {
        if !self.active {
            return Ok(());
        }
        if settings.seek > 0 {
            self.active = false;
            return Err(Self::error("compression cannot be combined with seek on output"));
        }
        self.encoder = Some(GzEncoder::new(Vec::new(), Compression::new(self.level)));
        debug!(level = self.level, "Gzip compression enabled");
        Ok(())
    }

    fn headroom(&self, _bs: usize) -> usize {
        if self.active { HEADROOM } else { 0 }
    }

    fn apply(&mut self, slot: &mut SlotBytes<'_>, ctx: &TransformContext<'_>) -> Result<(), TransformError> {
        self.compress(slot, ctx.start_offset, ctx.is_last)
    }

    fn close(&mut self, slot: &mut SlotBytes<'_>, ctx: &TransformContext<'_>) -> Result<(), TransformError> {
        if self.encoder.is_none() {
            return Ok(());
        }
        if self.last_slot == Some(ctx.start_offset) {
            return self.seal(slot);
        }
        self.compress(slot, ctx.start_offset, true)
    }

    fn finish(&mut self) -> Result<(), TransformError> {
        if self.encoder.take().is_some() {
            self.active = false;
            return Err(Self::error("gzip stream was never closed, the output is truncated"));
        }
        Ok(())
    }

    fn help(&self) -> &'static str {
        "   COMPRESSION\n\
         \x20  compression=LEVEL  gzip the output (LEVEL 0-9, default 6). Output digests\n\
         \x20                     then certify the compressed stream.\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn ctx(is_last: bool) -> TransformContext<'static> {
        TransformContext {
            start_offset: 0,
            is_last,
            ibs: 512,
            partitions: None,
        }
    }

    #[test]
    fn test_stream_decompresses_to_input() {
        let mut gzip = GzipTransform::new();
        gzip.configure("compression", Some("9")).unwrap();
        gzip.prepare(&JobSettings::default()).unwrap();
        assert_eq!(gzip.headroom(4096), HEADROOM);

        let input: Vec<u8> = (0..3 * 4096).map(|i| (i / 7) as u8).collect();
        let mut compressed = Vec::new();
        let chunks: Vec<_> = input.chunks(4096).collect();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut storage = vec![0u8; 4096 + HEADROOM];
            storage[..chunk.len()].copy_from_slice(chunk);
            let mut slot = SlotBytes::new(&mut storage, chunk.len());
            gzip.apply(&mut slot, &ctx(i + 1 == chunks.len())).unwrap();
            compressed.extend_from_slice(slot.data());
        }
        assert!(!gzip.is_active());

        let mut decoded = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, input);
    }

    fn slot_ctx(start_offset: u64, is_last: bool) -> TransformContext<'static> {
        TransformContext {
            start_offset,
            ..ctx(is_last)
        }
    }

    fn started() -> GzipTransform {
        let mut gzip = GzipTransform::new();
        gzip.configure("compression", Some("6")).unwrap();
        gzip.prepare(&JobSettings::default()).unwrap();
        gzip
    }

    fn run(gzip: &mut GzipTransform, bytes: &[u8], offset: u64, close: bool) -> Vec<u8> {
        let mut storage = vec![0u8; 4096 + HEADROOM];
        storage[..bytes.len()].copy_from_slice(bytes);
        let mut slot = SlotBytes::new(&mut storage, bytes.len());
        if close {
            gzip.close(&mut slot, &slot_ctx(offset, true)).unwrap();
        } else {
            gzip.apply(&mut slot, &slot_ctx(offset, false)).unwrap();
        }
        slot.data().to_vec()
    }

    fn decode(compressed: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        GzDecoder::new(compressed).read_to_end(&mut decoded).unwrap();
        decoded
    }

    #[test]
    fn test_close_compresses_unseen_slot() {
        let mut gzip = started();
        let mut compressed = run(&mut gzip, &[1u8; 4096], 0, false);
        compressed.extend(run(&mut gzip, &[2u8; 1000], 4096, true));
        assert!(!gzip.is_active());
        assert!(gzip.finish().is_ok());

        let decoded = decode(&compressed);
        assert_eq!(decoded.len(), 5096);
        assert!(decoded[4096..].iter().all(|b| *b == 2));
    }

    #[test]
    fn test_close_seals_slot_already_compressed() {
        let mut gzip = started();
        let mut compressed = run(&mut gzip, &[1u8; 4096], 0, false);

        // Same slot again: its compressed bytes are in the slot, only the
        // trailer is appended.
        let mut storage = vec![0u8; 4096 + HEADROOM];
        let mut slot = SlotBytes::new(&mut storage, 0);
        gzip.apply(&mut slot, &slot_ctx(4096, false)).unwrap();
        let before = slot.data().to_vec();
        gzip.close(&mut slot, &slot_ctx(4096, true)).unwrap();
        assert!(slot.data().starts_with(&before));
        compressed.extend_from_slice(slot.data());

        assert_eq!(decode(&compressed), vec![1u8; 4096]);
    }

    #[test]
    fn test_finish_reports_open_stream() {
        let mut gzip = started();
        run(&mut gzip, &[3u8; 512], 0, false);
        let err = gzip.finish().unwrap_err();
        assert!(err.message.contains("truncated"));
        assert!(gzip.finish().is_ok());
    }

    #[test]
    fn test_invalid_level() {
        let mut gzip = GzipTransform::new();
        assert!(gzip.configure("compression", Some("10")).is_err());
        assert!(gzip.configure("compression", None).is_err());
        assert!(!gzip.is_active());
    }

    #[test]
    fn test_rejects_seek() {
        let mut gzip = GzipTransform::new();
        gzip.configure("compression", Some("1")).unwrap();
        let settings = JobSettings {
            seek: 2,
            ..JobSettings::default()
        };
        assert!(gzip.prepare(&settings).is_err());
        assert!(!gzip.is_active());
    }
}
