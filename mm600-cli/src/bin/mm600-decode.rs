use anyhow::{Context, Result};
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use mm600_cli::{ConfigArgs, read_hex_pages, setup_logging, write_json};
use mm600_lib::process_history;
use mm600_lib::records::PumpSettings;
use std::fs;
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

/// Decode captured history pages into clinical records.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Pump history pages, hex, one page per line
    #[arg(long)]
    pages: PathBuf,
    /// Sensor history pages in the same format
    #[arg(long)]
    cbg_pages: Option<PathBuf>,
    /// Pump settings read at download time, as JSON
    #[arg(long)]
    settings: PathBuf,
    /// Where to write the records (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[command(flatten)]
    config: ConfigArgs,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_deref(), &cli.verbose)?;

    if let Err(e) = run_decode(&cli) {
        error!("Decode failed: {:?}", e);
        process::exit(1);
    }
    Ok(())
}

fn run_decode(cli: &Cli) -> Result<()> {
    let config = cli.config.load()?;
    let text = fs::read_to_string(&cli.settings).with_context(|| format!("Failed to read {:?}", cli.settings))?;
    let settings: PumpSettings =
        serde_json::from_str(&text).with_context(|| format!("Invalid pump settings in {:?}", cli.settings))?;

    let pages = read_hex_pages(&cli.pages)?;
    let cbg_pages = match &cli.cbg_pages {
        Some(path) => read_hex_pages(path)?,
        None => Vec::new(),
    };
    info!("Decoding {} pump and {} sensor pages", pages.len(), cbg_pages.len());

    let decoded = process_history(settings, &pages, &cbg_pages, &config).context("Failed to decode history")?;
    info!("Time processing: {:?}", decoded.time_processing);
    write_json(cli.output.as_deref(), &decoded.records)
}
