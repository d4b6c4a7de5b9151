use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use clap::Parser;
use dotenv::dotenv;
use tracing::Level;

use s3resign::config::ConfigLoader;
use s3resign::proxy;

/// Re-signing S3 proxy in front of Ceph RGW.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// TOML configuration file. Without it `./config.toml` is tried, then the
    /// environment.
    #[arg(long, env = "S3RESIGN_CONFIG")]
    config: Option<PathBuf>,

    /// Print the environment variable reference and exit.
    #[arg(long)]
    env_help: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let cli = Cli::parse();
    if cli.env_help {
        ConfigLoader::print_help();
        return Ok(());
    }

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    ConfigLoader::validate(&config)?;

    tracing_subscriber::fmt()
        .with_max_level(
            Level::from_str(&config.log_level)
                .map_err(|_| anyhow!("invalid log level {}", config.log_level))?,
        )
        .with_level(true)
        .with_thread_names(true)
        .with_target(true)
        .init();

    proxy::run(config).await
}
