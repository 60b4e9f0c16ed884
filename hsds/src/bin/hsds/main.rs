use anyhow::Result;
use clap::Parser;
use hsds::cli::interface::{HsdsCLI, run_cli};

#[tokio::main]
async fn main() -> Result<()> {
    #[cfg(feature = "logs")]
    hsds::initialize_tracing();

    let cli = HsdsCLI::parse();
    run_cli(cli).await
}
