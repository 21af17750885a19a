//! dump-keeper - backup metadata maintenance CLI

use clap::Parser;

use dump_keeper_backend::cli::{self, commands::error, Cli};
use dump_keeper_backend::telemetry;

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let format = cli.format.clone();

    let config = match cli::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error(&format, e.code(), &e.to_string());
            std::process::exit(2);
        }
    };

    telemetry::init_tracing(&config.log_level);
    tracing::debug!(?config, "Loaded configuration");

    if let Err(e) = cli::run(cli, config).await {
        tracing::debug!(error = ?e, "Command failed");
        error(&format, e.code(), &e.to_string());
        std::process::exit(1);
    }
}
