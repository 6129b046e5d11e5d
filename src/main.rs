use anyhow::Result;
use clap::Parser;

use baton::cli::{self, Cli};
use baton::config::BatonConfig;
use baton::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    BatonConfig::load_env_file()?;
    let config = BatonConfig::load()?;
    init_telemetry(&config.observability)?;

    let code = cli::execute(cli, config).await?;
    std::process::exit(code);
}
