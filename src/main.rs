use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "faucet-settler", version, about)]
struct Args {
    /// Path to the TOML configuration file. Environment variables with
    /// the FAUCET__ prefix override file values.
    #[clap(short, long, env = "FAUCET_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = faucet_settler::config::load_config(args.config.as_deref())?;

    faucet_settler::run(config).await
}
