use offgrid::{config, logging, server};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            // Logging is not up yet
            let _guard = logging::init(None);
            error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = logging::init(config.log_file.as_deref());

    info!("Starting offgrid {}", env!("CARGO_PKG_VERSION"));
    info!("Running in {} mode", if config.is_dev { "DEV" } else { "PROD" });

    if let Err(e) = server::start(config).await {
        error!("Failed to start server: {}", e);
        std::process::exit(1);
    }
}
