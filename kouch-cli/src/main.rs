//! kouch-tail: print a database's changes as they happen.
//!
//! Usage:
//!   kouch-tail notes --since 0 --include-docs
//!
//! Runs until interrupted (Ctrl-C) or until `--max-events` changes have been
//! printed. Reconnects on its own when the server goes away.

use anyhow::Result;
use clap::Parser;
use kouch_cli::{Args, tail};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let printed = tail(&args, &mut out, shutdown).await?;
    info!("printed {} changes", printed);
    Ok(())
}
