use clap::Parser;
use shroud_client::handler::{self, ProxyState};
use shroud_client::oob::OobClient;
use shroud_proto::config::load_client_config;
use shroud_proto::session::SessionRegistry;
use shroud_proto::ticket::TicketCache;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::Duration;

#[derive(Parser)]
#[command(name = "shroud-client", about = "Shroud client — local proxy that hides SNI behind an out-of-band peer")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/shroud/client.toml")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load config
    let config = load_client_config(&cli.config)?;

    // Setup logging
    let log_level = cli.log_level.as_deref().unwrap_or(&config.client.log_level);
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    tracing::info!("Shroud client starting");

    // Pick the OOB transport
    let oob = if config.oob.peer.is_empty() {
        tracing::info!("No OOB peer configured, using in-process direct transport");
        if config.concealment.full_client_hello {
            tracing::warn!(
                "Full ClientHello concealment needs a remote OOB peer; \
                 the direct transport cannot broker handshakes"
            );
        }
        let registry = Arc::new(SessionRegistry::default());
        registry.start_cleanup(Duration::from_secs(300));
        OobClient::direct(registry)
    } else {
        tracing::info!("OOB peer at {}", config.oob.peer);
        OobClient::http(&config.oob.peer)
    };

    let listen_addr = format!("{}:{}", config.client.listen, config.client.port);
    let state = Arc::new(ProxyState {
        concealment: config.concealment,
        oob,
        tickets: TicketCache::new(),
    });

    // Run proxy (with graceful shutdown on SIGINT/SIGTERM)
    let proxy_handle = tokio::spawn(handler::run_proxy(listen_addr, state));

    tokio::select! {
        result = proxy_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("Proxy failed: {}", e),
                Err(e) => tracing::error!("Proxy task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
    }

    tracing::info!("Shroud client stopped");
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
