//! Subscriber setup: a plain log file when asked for one, warnings on
//! stderr otherwise.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Local;
use duplex_core::JobSettings;
use tracing::Level;

pub fn init(log_file: Option<&Path>, debug: bool) -> Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let builder = tracing_subscriber::fmt().with_target(false);

    let result = match log_file {
        Some(path) => {
            let mut file = File::create(path)
                .with_context(|| format!("Failed to create log file: {}", path.display()))?;
            write_header(&mut file).context("Failed to write log header")?;
            builder
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder
            .with_max_level(if debug { Level::DEBUG } else { Level::WARN })
            .with_writer(std::io::stderr)
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install logger: {e}"))
}

fn write_header(out: &mut impl Write) -> std::io::Result<()> {
    writeln!(
        out,
        "duplex {} - start job {}",
        env!("CARGO_PKG_VERSION"),
        Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

/// Records the effective job configuration once the pipeline is about to run.
pub fn log_settings(settings: &JobSettings, input: &str, outputs: &[String]) {
    tracing::info!(
        input,
        outputs = ?outputs,
        bs = settings.bs,
        ibs = settings.ibs,
        obs = settings.obs,
        skip = settings.skip,
        seek = settings.seek,
        count = ?settings.count,
        reading_attempts = settings.reading_attempts,
        reread_bs = settings.reread_bs,
        parallel = settings.parallel,
        "Job settings"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_names_version() {
        let mut out = Vec::new();
        write_header(&mut out).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.starts_with(&format!("duplex {} - start job ", env!("CARGO_PKG_VERSION"))));
        assert!(line.ends_with('\n'));
    }
}
