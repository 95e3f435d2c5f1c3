// outpost: main entry point

use outpost::{Config, Supervisor};
use std::env;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Some(config_path) = env::args().nth(1) else {
        error!("usage: outpost <config.json>");
        std::process::exit(1);
    };
    let config = match Config::from_file(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("cannot load configuration: {}", err);
            std::process::exit(1);
        }
    };

    info!("starting outpost with configuration from {}", config_path);
    let supervisor = Supervisor::new(config);
    match supervisor.run().await {
        Ok(()) => {
            info!("all daemons have stopped");
        }
        Err(err) => {
            error!("daemon error: {}", err);
            std::process::exit(1);
        }
    }
}
