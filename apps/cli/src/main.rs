//! kbingest CLI — ingest URLs into a local, searchable knowledge store.
//!
//! Fetches, deduplicates, extracts and indexes web content, and manages the
//! tag taxonomy used to group ingested URLs.

mod commands;
mod progress;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
