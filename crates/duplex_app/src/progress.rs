use anyhow::{Context, Result};
use duplex_core::{ProgressCallback, ProgressEvent};
use indicatif::{ProgressBar, ProgressStyle};

/// Builds the progress bar and the pipeline callback feeding it.
pub fn bar(total: u64) -> Result<(ProgressBar, ProgressCallback)> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:50.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );

    let handle = pb.clone();
    let callback: ProgressCallback = Box::new(move |event| match event {
        ProgressEvent::Advanced { bytes_read, .. } => handle.set_position(*bytes_read),
        ProgressEvent::BadRegion(region) => handle.println(format!(
            "unreadable sectors {:#x}-{:#x} zero-filled",
            region.start, region.end
        )),
    });
    Ok((pb, callback))
}
