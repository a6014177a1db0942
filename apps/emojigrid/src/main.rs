mod app;
mod cli;

use clap::Parser;
use cli::Cli;
use emojigrid_client::telemetry::logging;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(err) = logging::init(&cli.logging.to_config()) {
        eprintln!("❌ failed to initialise logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = app::run(cli).await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}
