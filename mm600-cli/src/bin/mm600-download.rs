use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use mm600_cli::{ConfigArgs, setup_logging, write_hex_pages, write_json};
use mm600_lib::records::Record;
use mm600_lib::{Driver, SessionMetadata, UsbChannel, process_history};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// Download pump settings and history through a Contour Next Link 2.4.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Where to write the session metadata and records (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Also keep the raw pages and settings in this directory, for mm600-decode
    #[arg(long)]
    raw_dir: Option<PathBuf>,
    #[command(flatten)]
    config: ConfigArgs,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Serialize)]
struct Upload {
    metadata: SessionMetadata,
    records: Vec<Record>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    if let Err(e) = run_download(&cli).await {
        error!("Download failed: {:?}", e);
        process::exit(1);
    }
    Ok(())
}

async fn run_download(cli: &Cli) -> Result<()> {
    let config = cli.config.load()?;
    let start = Utc::now();

    let mut driver = Driver::new(UsbChannel::new(), config.clone());
    let mut last_reported = -1.0;
    let data = driver
        .fetch(|percent| {
            if percent - last_reported >= 5.0 || percent >= 100.0 {
                info!("Progress {:.0}%", percent);
                last_reported = percent;
            }
        })
        .await
        .context("Failed to read the pump")?;
    info!(
        "Read {} pump pages and {} sensor pages from {}",
        data.pages.len(),
        data.cbg_pages.len(),
        data.model_and_serial
    );

    if let Some(dir) = &cli.raw_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;
        write_hex_pages(&dir.join("pages.hex"), &data.pages)?;
        write_hex_pages(&dir.join("cbg_pages.hex"), &data.cbg_pages)?;
        write_json(Some(&dir.join("settings.json")), &data.settings)?;
    }

    let decoded = process_history(data.settings.clone(), &data.pages, &data.cbg_pages, &config)
        .context("Failed to decode pump history")?;
    let metadata = SessionMetadata::new(&data.settings, start, decoded.time_processing, &config);
    let upload = Upload {
        metadata,
        records: decoded.records,
    };
    write_json(cli.output.as_deref(), &upload)
}
