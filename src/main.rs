use clap::Parser;
use matchsync::cli::Cli;

mod main_dispatch;
mod main_runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    main_dispatch::run(&cli).await
}
