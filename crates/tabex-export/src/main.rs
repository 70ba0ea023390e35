//! Tabex - Main entry point

use clap::Parser;
use std::process;
use tabex_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tabex_export::cli::{self, Cli, EXIT_SETUP_FAILED};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Warn
        })
        .output(LogOutput::Console)
        .log_file_prefix("tabex")
        .build();

    // Environment variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The exporter works without logging
    let guard = init_logging(&log_config).ok();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping at the next batch boundary");
            on_signal.cancel();
        }
    });

    let code = match cli::run(cli, cancel).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Export could not start");
            eprintln!("Error: {:#}", e);
            EXIT_SETUP_FAILED
        },
    };

    // Flush file logs before exiting
    drop(guard);
    process::exit(code);
}
