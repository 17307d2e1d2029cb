#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use hermes::config::{Args, ServerConfig};
use hermes::configuration::ConfigStore;
use hermes::metrics::{start_metrics_server, Readiness};
use hermes::server::ServerState;
use hermes::tokens::TokenStore;
use hermes::watch::ConfigWatcher;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(args: &Args) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let directive = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        EnvFilter::new(directive)
    };

    if let Some(ref path) = args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open log file {path:?}: {e}"))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("cannot listen for SIGTERM: {}", e),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;
    let config: ServerConfig = args.into();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let tokens = Arc::new(TokenStore::new(config.tokens_path.clone()));
    let store = Arc::new(
        ConfigStore::open(config.config_path.clone(), tokens)
            .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?,
    );
    let (_watcher, events) = ConfigWatcher::spawn(store.path())?;

    let readiness = Readiness::new();
    tokio::spawn({
        let readiness = readiness.clone();
        let metrics_addr = config.metrics_addr;
        async move {
            if let Err(e) = start_metrics_server(metrics_addr, readiness).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let state = Arc::new(ServerState::new(Arc::clone(&store), config));
    readiness.set(true);

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(());
    let mut server = tokio::spawn(hermes::run_with_shutdown(listener, state, async move {
        let _ = shutdown_rx.changed().await;
    }));

    let outcome = tokio::select! {
        result = &mut server => {
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::anyhow!("server error: {e}")),
                Err(e) => Err(anyhow::anyhow!("server task failed: {e}")),
            }
        }
        result = store.watch(events) => {
            match result {
                Ok(()) => Err(anyhow::anyhow!("configuration watcher stopped")),
                Err(e) => Err(anyhow::anyhow!(e)),
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(())
        }
    };

    readiness.set(false);
    if let Err(ref e) = outcome {
        error!("{}", e);
    }
    drop(shutdown_tx);
    if !server.is_finished() {
        if let Ok(Err(e)) = server.await {
            error!("server error during shutdown: {}", e);
        }
    }

    outcome
}
