//! Pieces shared by the `mm600-download` and `mm600-decode` binaries.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Args;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use mm600_lib::{DriverConfig, FixedTimezone};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Driver settings, from an optional JSON file overridden by flags.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// JSON file with driver settings
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Name of the timezone the pump clock is set to
    #[arg(long)]
    pub tz_name: Option<String>,
    /// Offset of that timezone from UTC, in minutes
    #[arg(long, allow_hyphen_values = true)]
    pub tz_offset: Option<i32>,
    /// Days of history to request
    #[arg(long)]
    pub days: Option<u32>,
    /// Retries before a history download gives up
    #[arg(long)]
    pub retries: Option<u32>,
    /// Serial printed on the pump, to pair a bridge not yet linked to it
    #[arg(long)]
    pub pump_serial: Option<String>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<DriverConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path).with_context(|| format!("Failed to read config {:?}", path))?;
                serde_json::from_str(&text).with_context(|| format!("Invalid config {:?}", path))?
            }
            None => DriverConfig::default(),
        };
        if self.tz_name.is_some() || self.tz_offset.is_some() {
            config.timezone = FixedTimezone::new(
                self.tz_name.clone().unwrap_or_else(|| config.timezone.name.clone()),
                self.tz_offset.unwrap_or(config.timezone.offset_minutes),
            );
        }
        if let Some(days) = self.days {
            config.history_days = days;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(serial) = &self.pump_serial {
            config.pump_serial = Some(serial.clone());
        }
        Ok(config)
    }
}

/// Console logging plus an optional log file. Keep the guard alive until
/// the program exits or buffered file output is lost.
pub fn setup_logging(log_file_path: Option<&Path>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .without_time();

    let (file_layer, guard) = match log_file_path {
        Some(path) => {
            let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
            let (writer, guard) = tracing_appender::non_blocking(log_file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // INFO by default, DEBUG with -v, TRACE with -vv
    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}

/// History pages stored as hex, one page per line.
pub fn read_hex_pages(path: &Path) -> Result<Vec<Bytes>> {
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read pages from {:?}", path))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            hex::decode(line.trim())
                .map(Bytes::from)
                .with_context(|| format!("{:?} line {}: not a hex page", path, number + 1))
        })
        .collect()
}

pub fn write_hex_pages(path: &Path, pages: &[Bytes]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
    let mut out = BufWriter::new(file);
    for page in pages {
        writeln!(out, "{}", hex::encode(page))?;
    }
    out.flush()?;
    Ok(())
}

/// Pretty JSON to `path`, or to stdout without one.
pub fn write_json<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
            let mut out = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
            out.flush()?;
            info!("Wrote {:?}", path);
        }
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            serde_json::to_writer_pretty(&mut out, value)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_defaults() {
        let args = ConfigArgs {
            config: None,
            tz_name: Some("Europe/Berlin".to_string()),
            tz_offset: None,
            days: Some(7),
            retries: None,
            pump_serial: Some("NG1234567H".to_string()),
        };
        let config = args.load().unwrap();
        assert_eq!(config.timezone, FixedTimezone::new("Europe/Berlin", 0));
        assert_eq!(config.history_days, 7);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.pump_serial.as_deref(), Some("NG1234567H"));
    }

    #[test]
    fn hex_pages_skip_blank_lines() {
        let path = std::env::temp_dir().join(format!("mm600-pages-{}.hex", std::process::id()));
        let pages = vec![Bytes::from_static(&[0xDE, 0xAD]), Bytes::from_static(&[0x01])];
        write_hex_pages(&path, &pages).unwrap();
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("\n  \n");
        fs::write(&path, text).unwrap();
        assert_eq!(read_hex_pages(&path).unwrap(), pages);
        fs::remove_file(&path).unwrap();
    }
}
