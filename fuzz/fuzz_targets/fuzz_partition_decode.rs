#![no_main]

use duplex_core::PartitionDecoder;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    // first byte picks the window size the image is streamed in
    let window = usize::from(data[0]).max(1) * 64;
    let image = &data[1..];

    let mut decoder = PartitionDecoder::new("fuzz");
    let mut start = 0u64;
    for chunk in image.chunks(window) {
        decoder.observe(chunk, start);
        start += chunk.len() as u64;
    }
    for offset in (0..start).step_by(512) {
        let _ = decoder.classify(offset);
    }
    let _ = decoder.snapshot();
});
