use clap::Parser;
use shroud_oob::service::{self, OobState};
use shroud_proto::config::load_oob_config;
use shroud_proto::session::SessionRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Duration;

#[derive(Parser)]
#[command(name = "shroud-oob", about = "Shroud OOB peer — brokers target handshakes for shroud clients")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/shroud/oob.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load config
    let config = load_oob_config(&cli.config)?;

    // Setup logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("Shroud OOB peer starting");

    let registry = Arc::new(SessionRegistry::new(Duration::from_secs(
        config.sessions.idle_timeout_secs,
    )));
    registry.start_cleanup(Duration::from_secs(config.sessions.cleanup_interval_secs));

    let state = Arc::new(OobState { registry });
    let app = service::router(state);

    let bind_addr = format!("{}:{}", config.server.listen, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("OOB peer listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shroud OOB peer stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("failed to setup SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }
}
