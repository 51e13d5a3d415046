use clap::Parser;
use tracing_subscriber::EnvFilter;

use circletube::cli::{self, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("circletube=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    cli::run(args).await
}
