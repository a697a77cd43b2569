use std::io::{self, BufReader};

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vision_server::{backend, metrics, Dispatcher, DocumentExtractor, ProtocolLoop, ServerConfig};

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match ServerConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    // All diagnostics go to stderr; stdout carries only protocol lines.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    info!(
        "Starting embedding server (backend={}, model={})",
        config.model.backend, config.model.model_id
    );

    metrics::install(&config.metrics);

    let backend = match backend::init_backend(&config.model) {
        Ok(backend) => backend,
        Err(e) => {
            error!("Failed to initialize backend: {}", e);
            std::process::exit(1);
        }
    };
    let mut dispatcher = Dispatcher::new(backend, DocumentExtractor::new());

    // Inference is synchronous and requests are served one at a time, so the
    // whole protocol loop runs on a blocking thread while the async runtime
    // keeps the metrics exporter alive.
    let served = tokio::task::spawn_blocking(move || {
        let reader = BufReader::new(io::stdin().lock());
        let writer = io::stdout().lock();
        ProtocolLoop::new(reader, writer).run(&mut dispatcher)
    })
    .await;

    match served {
        Ok(Ok(())) => info!("Server stopped"),
        Ok(Err(e)) => {
            error!("Protocol loop failed: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Protocol loop panicked: {}", e);
            std::process::exit(1);
        }
    }
}
