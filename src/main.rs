mod backends;
mod block;
mod cli;
mod error;
mod pipeline;
mod plugins;
mod state;
mod util;

use anyhow::Context;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::get_opts();

    // Initialize logging; RUST_LOG wins over --debug
    let default_level = if opts.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    let flags = opts.command.run_flags();
    match &opts.command {
        cli::Command::Run { blocks, .. } => {
            pipeline::run(&opts.project, blocks, flags).await.context("run failed")?;
        }
        cli::Command::Validate { blocks } => {
            pipeline::validate(&opts.project, blocks)?;
        }
    }

    Ok(())
}
