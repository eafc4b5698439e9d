//! newsfeed CLI: gather, filter, enrich, summarize, and deliver news about
//! a list of tracked entities.
//!
//! Every stage persists its artifact, so a run can start from any stage.

mod commands;

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
