pub mod batch;
pub mod cache;
pub mod commands;
pub mod config;
pub mod excel;
pub mod normalize;
pub mod ocr;
pub mod services;
pub mod types;

pub use batch::{process_batch, process_batch_cached, Batch, BatchRow, ItemFailure, ItemOutcome};
pub use config::AppConfig;
pub use normalize::{normalize, RecordError};
pub use ocr::{BaiduClient, InvoiceRecognizer, OcrError, TokenSource};
pub use types::{BatchInput, ImageSource, InvoiceRecord, WordsResult};

use clap::Parser;
use commands::{AppState, Cli};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn run() -> anyhow::Result<()> {
    // Credentials may live in ./.env or the user config dir
    config::load_env();

    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "vat_invoice_lib=debug"
    } else {
        "vat_invoice_lib=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    commands::dispatch(&AppState::new(), &cli.command)
}
