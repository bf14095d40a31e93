//! Pattern search over the copied bytes.
//!
//! Each match becomes one line in the results writer:
//!
//! ```text
//! <pattern> <block> <offset> <length> <bytes> <partition>
//! ```
//!
//! `bytes` is hex unless human-readable output was requested. The slot is
//! left untouched.
//!
//! The last [`CARRY`] bytes of each slot are searched again with the next
//! slot, so a match crossing a slot boundary is reported whole, once. A
//! match still running at the end of the searched bytes is prefixed with
//! `? `: it may continue past what was seen.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use regex::bytes::Regex;

use crate::error::TransformError;
use crate::settings::JobSettings;
use crate::transform::{SlotBytes, Transform, TransformContext};

const NAME: &str = "regex";
const CARRY: usize = 4096;

pub struct RegexTransform {
    patterns: Vec<Regex>,
    /// End offset of the last match reported, per pattern.
    reported: Vec<u64>,
    output: Option<Box<dyn Write + Send>>,
    simple: bool,
    human_readable: bool,
    active: bool,
    /// Bytes not yet searched to completion, starting at `window_start`.
    window: Vec<u8>,
    window_start: u64,
}

impl Default for RegexTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl RegexTransform {
    pub fn new() -> Self {
        Self {
            patterns: Vec::new(),
            reported: Vec::new(),
            output: None,
            simple: false,
            human_readable: false,
            active: false,
            window: Vec::new(),
            window_start: 0,
        }
    }

    /// Sends results to `output` instead of a file.
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn add_pattern(&mut self, pattern: &str) -> Result<(), TransformError> {
        let regex = Regex::new(pattern).map_err(|e| {
            TransformError::new(NAME, format!("<{pattern}> is not a valid regular expression ({e})"))
        })?;
        self.patterns.push(regex);
        self.reported.push(0);
        self.active = true;
        Ok(())
    }

    fn load_patterns(&mut self, path: &str) -> Result<(), TransformError> {
        let file = File::open(path)
            .map_err(|e| TransformError::new(NAME, format!("can not open '{path}': {e}")))?;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| TransformError::new(NAME, format!("reading '{path}': {e}")))?;
            if line.is_empty() {
                break;
            }
            self.add_pattern(&line)?;
        }
        Ok(())
    }

    fn open_results(&mut self, path: &str) -> Result<(), TransformError> {
        let file = File::create(path).map_err(|e| {
            TransformError::new(NAME, format!("error opening pattern matching output file '{path}': {e}"))
        })?;
        self.output = Some(Box::new(BufWriter::new(file)));
        Ok(())
    }

    /// One line per pattern found anywhere in the slot.
    fn write_block_matches(&mut self, data: &[u8], ctx: &TransformContext<'_>) -> std::io::Result<()> {
        let Some(out) = self.output.as_mut() else {
            return Ok(());
        };
        let start = ctx.start_offset;
        for (j, regex) in self.patterns.iter().enumerate() {
            if let Some(m) = regex.find(data) {
                writeln!(
                    out,
                    "matches found for regex {j} in input block {:>10}: {:016x}-{:016x}",
                    start + m.start() as u64,
                    start,
                    start + data.len() as u64
                )?;
            }
        }
        Ok(())
    }

    /// Reports matches starting before the carried tail, or every match when
    /// nothing follows, then drops the searched bytes.
    fn write_window_matches(&mut self, ctx: &TransformContext<'_>, is_last: bool) -> std::io::Result<()> {
        let limit = if is_last {
            self.window.len()
        } else {
            self.window.len().saturating_sub(CARRY)
        };
        if let Some(out) = self.output.as_mut() {
            let ibs = ctx.ibs.max(1) as u64;
            for (j, regex) in self.patterns.iter().enumerate() {
                for m in regex.find_iter(&self.window) {
                    if m.start() >= limit {
                        break;
                    }
                    let offset = self.window_start + m.start() as u64;
                    if m.is_empty() || offset < self.reported[j] {
                        continue;
                    }
                    self.reported[j] = offset + m.len() as u64;

                    let marker = if !is_last && m.end() == self.window.len() { "? " } else { "" };
                    let bytes = if self.human_readable {
                        String::from_utf8_lossy(m.as_bytes()).into_owned()
                    } else {
                        hex::encode(m.as_bytes())
                    };
                    let partition = ctx
                        .partitions
                        .and_then(|p| p.classify(offset))
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    writeln!(out, "{marker}{j} {} {offset} {} {bytes} {partition}", offset / ibs, m.len())?;
                }
            }
        }
        self.window.drain(..limit);
        self.window_start += limit as u64;
        Ok(())
    }

    fn write_error(e: std::io::Error) -> TransformError {
        TransformError::new(NAME, format!("unable to write matches: {e}"))
    }
}

impl Transform for RegexTransform {
    fn name(&self) -> &str {
        NAME
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn accepts(&self, key: &str) -> bool {
        matches!(
            key,
            "find-regex"
                | "pattern-file"
                | "pattern-matching-results"
                | "simple-regex-match"
                | "human-readable-regex-match"
        )
    }

    fn configure(&mut self, key: &str, value: Option<&str>) -> Result<(), TransformError> {
        let required = || TransformError::new(NAME, format!("{key} requires a value"));
        match key {
            "find-regex" => self.add_pattern(value.ok_or_else(required)?),
            "pattern-file" => self.load_patterns(value.ok_or_else(required)?),
            "pattern-matching-results" => self.open_results(value.ok_or_else(required)?),
            "simple-regex-match" => {
                self.simple = true;
                Ok(())
            }
            "human-readable-regex-match" => {
                self.human_readable = true;
                Ok(())
            }
            _ => Err(TransformError::new(NAME, format!("invalid option '{key}'"))),
        }
    }

    fn prepare(&mut self, _settings: &JobSettings) -> Result<(), TransformError> {
        if self.patterns.is_empty() {
            self.active = false;
            return Ok(());
        }
        if self.output.is_none() {
            self.active = false;
            return Err(TransformError::new(NAME, "pattern-matching-results is not set"));
        }
        Ok(())
    }

    fn needs_partitions(&self) -> bool {
        self.active && !self.simple
    }

    fn apply(&mut self, slot: &mut SlotBytes<'_>, ctx: &TransformContext<'_>) -> Result<(), TransformError> {
        if self.simple {
            return self.write_block_matches(slot.data(), ctx).map_err(Self::write_error);
        }
        if self.window_start + self.window.len() as u64 != ctx.start_offset {
            self.window.clear();
            self.window_start = ctx.start_offset;
        }
        self.window.extend_from_slice(slot.data());
        self.write_window_matches(ctx, ctx.is_last).map_err(Self::write_error)
    }

    fn close(&mut self, _slot: &mut SlotBytes<'_>, ctx: &TransformContext<'_>) -> Result<(), TransformError> {
        self.write_window_matches(ctx, true).map_err(Self::write_error)
    }

    fn finish(&mut self) -> Result<(), TransformError> {
        if let Some(out) = self.output.as_mut() {
            out.flush().map_err(Self::write_error)?;
        }
        Ok(())
    }

    fn help(&self) -> &'static str {
        "   PATTERN MATCHING\n\
         \x20  find-regex=REGEX             search every block for REGEX\n\
         \x20  pattern-file=FILE            search for the regexes listed one per line in FILE\n\
         \x20  pattern-matching-results=FILE\n\
         \x20                               write matches to FILE as\n\
         \x20                               'regex block offset length bytes partition';\n\
         \x20                               a leading '? ' marks a match cut off at the\n\
         \x20                               end of the data searched\n\
         \x20  simple-regex-match           only report which regexes each block contains\n\
         \x20  human-readable-regex-match   write matching bytes as text instead of hex\n"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionDecoder;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn search(transform: &mut RegexTransform, data: &[u8], start_offset: u64, partitions: Option<&PartitionDecoder>) {
        search_slot(transform, data, start_offset, true, partitions);
    }

    fn search_slot(
        transform: &mut RegexTransform,
        data: &[u8],
        start_offset: u64,
        is_last: bool,
        partitions: Option<&PartitionDecoder>,
    ) {
        let mut storage = data.to_vec();
        let len = storage.len();
        let mut slot = SlotBytes::new(&mut storage, len);
        let ctx = TransformContext {
            start_offset,
            is_last,
            ibs: 512,
            partitions,
        };
        transform.apply(&mut slot, &ctx).unwrap();
        assert_eq!(slot.data(), data);
    }

    #[test]
    fn test_match_lines() {
        let capture = Capture::default();
        let mut regex = RegexTransform::new().with_output(Box::new(capture.clone()));
        regex.configure("find-regex", Some("secret")).unwrap();
        regex.prepare(&JobSettings::default()).unwrap();

        let mut data = vec![0u8; 1024];
        data[600..606].copy_from_slice(b"secret");
        search(&mut regex, &data, 4096, None);

        assert_eq!(capture.text(), "0 9 4696 6 736563726574 -\n");
    }

    #[test]
    fn test_human_readable_with_partition() {
        let capture = Capture::default();
        let mut regex = RegexTransform::new().with_output(Box::new(capture.clone()));
        regex.configure("find-regex", Some("[0-9]{4}")).unwrap();
        regex.configure("human-readable-regex-match", None).unwrap();
        regex.prepare(&JobSettings::default()).unwrap();
        assert!(regex.needs_partitions());

        let mut mbr = vec![0u8; 512];
        mbr[446 + 4] = 0x83;
        mbr[446 + 8..446 + 12].copy_from_slice(&1u32.to_le_bytes());
        mbr[446 + 12..446 + 16].copy_from_slice(&10u32.to_le_bytes());
        mbr[510] = 0x55;
        mbr[511] = 0xAA;
        let mut decoder = PartitionDecoder::new("img");
        decoder.observe(&mbr, 0);

        let mut data = vec![b' '; 512];
        data[10..14].copy_from_slice(b"2024");
        search(&mut regex, &data, 1024, Some(&decoder));

        assert_eq!(capture.text(), "0 2 1034 4 2024 img1\n");
    }

    #[test]
    fn test_simple_mode_reports_once_per_block() {
        let capture = Capture::default();
        let mut regex = RegexTransform::new().with_output(Box::new(capture.clone()));
        regex.configure("find-regex", Some("ab")).unwrap();
        regex.configure("simple-regex-match", None).unwrap();
        regex.prepare(&JobSettings::default()).unwrap();

        search(&mut regex, b"xxabxxabxx", 0, None);

        assert_eq!(
            capture.text(),
            "matches found for regex 0 in input block          2: 0000000000000000-000000000000000a\n"
        );
    }

    fn searcher(pattern: &str) -> (RegexTransform, Capture) {
        let capture = Capture::default();
        let mut regex = RegexTransform::new().with_output(Box::new(capture.clone()));
        regex.configure("find-regex", Some(pattern)).unwrap();
        regex.prepare(&JobSettings::default()).unwrap();
        (regex, capture)
    }

    #[test]
    fn test_match_across_slots_is_reported_once() {
        let (mut regex, capture) = searcher("secret");

        let mut first = vec![0u8; 8192];
        first[8189..].copy_from_slice(b"sec");
        first[5000..5006].copy_from_slice(b"secret");
        let mut second = vec![0u8; 8192];
        second[..3].copy_from_slice(b"ret");

        search_slot(&mut regex, &first, 0, false, None);
        assert_eq!(capture.text(), "");
        search_slot(&mut regex, &second, 8192, true, None);

        assert_eq!(
            capture.text(),
            "0 9 5000 6 736563726574 -
0 15 8189 6 736563726574 -
"
        );
    }

    #[test]
    fn test_tail_matches_are_not_repeated() {
        let (mut regex, capture) = searcher("a+");

        let mut first = vec![b'.'; 8192];
        first[6000..6010].fill(b'a');
        first[8190..].fill(b'a');
        let mut second = vec![b'.'; 1024];
        second[..2].fill(b'a');

        search_slot(&mut regex, &first, 0, false, None);
        search_slot(&mut regex, &second, 8192, false, None);
        search_slot(&mut regex, &[], 9216, true, None);

        assert_eq!(
            capture.text(),
            "0 11 6000 10 61616161616161616161 -
0 15 8190 4 61616161 -
"
        );
    }

    #[test]
    fn test_match_longer_than_carry_is_marked_partial() {
        let (mut regex, capture) = searcher("x+");

        let mut first = vec![b'x'; 8192];
        first[..100].fill(b'.');
        search_slot(&mut regex, &first, 0, false, None);

        let line = capture.text();
        assert!(line.starts_with("? 0 0 100 8092 "), "{line}");
    }

    #[test]
    fn test_close_reports_carried_tail() {
        let (mut regex, capture) = searcher("end");

        let mut first = vec![0u8; 8192];
        first[8000..8003].copy_from_slice(b"end");
        search_slot(&mut regex, &first, 0, false, None);
        assert_eq!(capture.text(), "");

        let mut empty: [u8; 0] = [];
        let mut slot = SlotBytes::new(&mut empty, 0);
        let ctx = TransformContext {
            start_offset: 8192,
            is_last: true,
            ibs: 512,
            partitions: None,
        };
        regex.close(&mut slot, &ctx).unwrap();

        assert_eq!(capture.text(), "0 15 8000 3 656e64 -
");
    }

    #[test]
    fn test_configuration_errors() {
        let mut regex = RegexTransform::new();
        assert!(regex.configure("find-regex", Some("(unclosed")).is_err());
        assert!(regex.configure("find-regex", None).is_err());

        regex.configure("find-regex", Some("x")).unwrap();
        assert!(regex.prepare(&JobSettings::default()).is_err());

        let mut idle = RegexTransform::new();
        idle.prepare(&JobSettings::default()).unwrap();
        assert!(!idle.is_active());
    }
}
