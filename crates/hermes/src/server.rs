use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::configuration::ConfigStore;
use crate::connection::{handle_communicator, handle_echo};
use crate::error::RelayError;
use crate::metrics::counters;
use crate::registry::ConnectionRegistry;
use crate::tokens::TokenStore;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Form, Router};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Body of `GET /`.
pub const WELCOME: &str =
    "Welcome to the hermes relay! POST /service to publish, connect to /communicator to receive.\n";

/// Shared state for the relay.
pub struct ServerState {
    /// Live configuration generation and its reconciliation.
    pub config: Arc<ConfigStore>,
    /// Bound communicator sockets.
    pub registry: Arc<ConnectionRegistry>,
    /// Fan-out of published messages.
    pub broadcaster: Broadcaster,
    /// Runtime server configuration.
    pub settings: ServerConfig,
}

impl ServerState {
    /// Wire the registry and broadcaster around a loaded configuration store.
    #[must_use]
    pub fn new(config: Arc<ConfigStore>, settings: ServerConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(Arc::clone(config.tokens())));
        config.attach_registry(Arc::clone(&registry));
        let broadcaster = Broadcaster::new(Arc::clone(&config), Arc::clone(&registry));
        Self {
            config,
            registry,
            broadcaster,
            settings,
        }
    }

    /// The identity store shared with the configuration.
    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenStore> {
        self.config.tokens()
    }
}

#[derive(Debug, Deserialize)]
struct PublishForm {
    #[serde(default)]
    token: String,
    #[serde(default)]
    msg: String,
}

async fn welcome() -> &'static str {
    WELCOME
}

async fn publish(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Form(form): Form<PublishForm>,
) -> (StatusCode, String) {
    match state.broadcaster.publish(&form.token, &form.msg) {
        Ok(receipt) => {
            counters::auth_total("service", "accepted");
            debug!(peer = %peer, service = %receipt.service, envelopes = receipt.dispatched, "message published");
            (
                StatusCode::OK,
                format!(
                    "Message \"{}\" by {} has been passed on.\n",
                    form.msg, receipt.service
                ),
            )
        }
        Err(RelayError::Unauthorized) => {
            counters::auth_total("service", "rejected");
            debug!(peer = %peer, "publish rejected, invalid token");
            (StatusCode::UNAUTHORIZED, "Invalid token\n".to_string())
        }
        Err(e) => {
            tracing::error!("publish failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error\n".to_string(),
            )
        }
    }
}

async fn communicator(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_communicator(socket, peer, state).await {
            debug!("communicator connection from {} closed: {}", peer, e);
        }
    })
}

async fn echo(ws: WebSocketUpgrade, ConnectInfo(peer): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_echo(socket, peer).await {
            debug!("echo connection from {} closed: {}", peer, e);
        }
    })
}

/// Build the relay's HTTP routes.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(welcome))
        .route("/service", post(publish))
        .route("/communicator", get(communicator))
        .route("/echo", get(echo))
        .with_state(state)
}

/// # Errors
///
/// Returns an error if the listener fails.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RelayError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Serve the relay until `shutdown` resolves.
///
/// Open communicator sockets are left to finish on their own tasks.
///
/// # Errors
///
/// Returns an error if the listener fails.
pub async fn run_with_shutdown<F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    info!("relay listening on {}", local_addr);
    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("relay shut down gracefully");
    Ok(())
}
