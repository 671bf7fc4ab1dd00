use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use meshplane::{config, observability, startup};

#[derive(Parser, Debug)]
#[command(name = "meshplane", version, about = "Multi-zone service-mesh control plane core")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> meshplane::Result<()> {
    let cli = Cli::parse();
    let app_config = config::load_config(cli.config.as_deref())?;

    observability::init_logging(&app_config.observability)?;
    observability::init_metrics(&app_config.observability)?;

    info!(
        version = meshplane::VERSION,
        mode = ?app_config.mode,
        "Starting meshplane control plane"
    );

    let stop = CancellationToken::new();
    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signal_stop.cancel();
        }
    });

    startup::run(app_config, stop).await
}
