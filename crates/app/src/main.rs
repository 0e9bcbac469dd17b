use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::Context;

/// Scan receipt photos into text and keep a searchable record of them.
#[derive(Debug, Parser)]
#[command(name = "receiptscan", version)]
struct Cli {
    /// Scanner config file. Defaults to `receiptscan.toml` in the user config directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Where the receipt database and page images live.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Tesseract `tessdata` directory (only used by builds with the `tesseract` feature).
    #[arg(long, global = true, env = "TESSDATA_PREFIX")]
    tessdata: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recognize the text of one receipt, one image per page.
    Scan {
        #[arg(required = true)]
        pages: Vec<PathBuf>,
        /// Hand the pages to the engine as-is.
        #[arg(long)]
        no_preprocess: bool,
        /// Store the receipt and its page images.
        #[arg(long)]
        save: bool,
        /// Merchant name; stored as Unknown when omitted.
        #[arg(long)]
        merchant: Option<String>,
        /// Purchase date (YYYY-MM-DD); today when omitted.
        #[arg(long)]
        date: Option<chrono::NaiveDate>,
    },
    /// Scan every image dropped into a folder until interrupted.
    Watch {
        /// Folder to watch. Defaults to `intake/` under the data directory.
        #[arg(long)]
        dir: Option<PathBuf>,
        #[arg(long)]
        no_preprocess: bool,
        #[arg(long)]
        save: bool,
    },
    /// List stored receipts, newest first.
    List {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one stored receipt with its items and page text.
    Show { id: i64 },
    /// Delete a stored receipt.
    Delete { id: i64 },
    /// Spending totals across stored receipts.
    Stats,
    /// Recognition languages the engine accepts.
    Languages,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let project_dirs = directories::ProjectDirs::from("com", "receiptscan", "ReceiptScan");
    let data_dir = match (cli.data_dir, &project_dirs) {
        (Some(dir), _) => dir,
        (None, Some(dirs)) => dirs.data_dir().to_path_buf(),
        (None, None) => anyhow::bail!("no home directory found; pass --data-dir"),
    };
    let config_path = match (cli.config, &project_dirs) {
        (Some(path), _) => Some(path),
        (None, Some(dirs)) => Some(dirs.config_dir().join("receiptscan.toml")),
        (None, None) => None,
    };

    let config = match &config_path {
        Some(path) => receiptscan_ocr::ScannerConfig::load_or_default(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => receiptscan_ocr::ScannerConfig::default(),
    };

    let ctx = Context::new(config, data_dir, cli.tessdata);

    match cli.command {
        Command::Scan { pages, no_preprocess, save, merchant, date } => {
            commands::scan(&ctx, &pages, !no_preprocess, save, merchant, date).await
        }
        Command::Watch { dir, no_preprocess, save } => {
            commands::watch(&ctx, dir, !no_preprocess, save).await
        }
        Command::List { limit } => commands::list(&ctx, limit).await,
        Command::Show { id } => commands::show(&ctx, id).await,
        Command::Delete { id } => commands::delete(&ctx, id).await,
        Command::Stats => commands::stats(&ctx).await,
        Command::Languages => commands::languages(&ctx),
    }
}
