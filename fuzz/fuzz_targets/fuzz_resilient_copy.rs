#![no_main]

use duplex_core::memory::{MemorySink, MemorySource};
use duplex_core::{JobSettings, Pipeline};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let ibs = (usize::from(data[0] % 8) + 1) * 512;
    let obs = ibs * (usize::from(data[1] % 3) + 1);
    let bad_sector = u64::from(data[2]) * 512;
    let image = data[3..].to_vec();

    let mut settings = JobSettings::default().with_block_sizes(None, Some(ibs), Some(obs));
    settings.direct_input = false;
    settings.direct_output = false;
    settings.parallel = false;

    let mut source = MemorySource::new(image.clone());
    // a final partial sector is zero-filled up to the end of the image only
    let bad_sector = (bad_sector < image.len() as u64).then_some(bad_sector);
    if let Some(offset) = bad_sector {
        source = source.with_bad_sector(offset);
    }
    let sink = MemorySink::new("fuzz");
    let handle = sink.handle();
    let Ok(report) = Pipeline::new(settings, Box::new(source), vec![Box::new(sink)]).run() else {
        return;
    };

    let copied = handle.snapshot();
    assert_eq!(copied.len(), image.len());
    assert_eq!(report.input.counters.bytes, image.len() as u64);
    for (i, (a, b)) in copied.iter().zip(&image).enumerate() {
        let in_bad = bad_sector.is_some_and(|s| (s..s + 512).contains(&(i as u64)));
        assert!(if in_bad { *a == 0 } else { a == b });
    }
});
