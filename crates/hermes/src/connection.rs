use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::registry::{ConnHandle, ConnInbox, Eviction};
use crate::server::ServerState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocket, Message>;
type WsRecv = SplitStream<WebSocket>;

/// Close reason sent to communicators presenting an unknown token.
pub const INVALID_TOKEN_REASON: &str = "Invalid token";

fn close_frame(code: u16, reason: impl Into<Cow<'static, str>>) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}

fn takeover_reason(by: SocketAddr) -> String {
    format!("{by} has taken over this connection")
}

/// Wait for the first data frame, which carries the bearer token.
async fn read_token(ws_rx: &mut WsRecv) -> Result<Vec<u8>, RelayError> {
    loop {
        match ws_rx.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
            Some(Ok(Message::Binary(data))) => return Ok(data),
            Some(Ok(Message::Close(_))) | None => return Err(RelayError::ConnectionClosed),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(RelayError::WebSocket(e)),
        }
    }
}

/// Present the token handshake and return the authenticated communicator
/// name with the token it presented.
async fn perform_auth(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    state: &ServerState,
) -> Result<(String, Vec<u8>), RelayError> {
    let deadline = Duration::from_secs(state.settings.auth_timeout);
    let token = match timeout(deadline, read_token(ws_rx)).await {
        Ok(result) => result?,
        Err(_) => {
            counters::auth_total("communicator", "timeout");
            let _ = ws_tx
                .send(close_frame(close_code::POLICY, "Authentication timed out"))
                .await;
            return Err(RelayError::AuthTimeout);
        }
    };

    let generation = state.config.current();
    let authenticated = state.registry.authenticate(&token, &generation);
    match authenticated {
        Ok(name) => {
            counters::auth_total("communicator", "accepted");
            Ok((name, token))
        }
        Err(e) => {
            counters::auth_total("communicator", "rejected");
            let _ = ws_tx
                .send(close_frame(close_code::POLICY, INVALID_TOKEN_REASON))
                .await;
            debug!("sent invalid token close frame");
            Err(e)
        }
    }
}

/// Write queued envelopes to the socket until it closes or the binding is
/// displaced.
async fn run_delivery_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    inbox: &mut ConnInbox,
    name: &str,
) -> Result<(), RelayError> {
    loop {
        tokio::select! {
            // eviction first: a displaced handle also closes the queue
            biased;

            eviction = &mut inbox.evicted => {
                match eviction {
                    Ok(Eviction::TakenOver(by)) => {
                        debug!(name = %name, by = %by, "connection displaced");
                        let _ = ws_tx.send(close_frame(close_code::NORMAL, takeover_reason(by))).await;
                    }
                    Ok(Eviction::Revoked) => {
                        debug!(name = %name, "token revoked");
                        let _ = ws_tx
                            .send(close_frame(close_code::POLICY, INVALID_TOKEN_REASON))
                            .await;
                    }
                    Err(_) => {}
                }
                return Ok(());
            }
            payload = inbox.rx.recv() => {
                let Some(payload) = payload else { return Ok(()) };
                ws_tx.send(Message::Text(payload)).await?;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!(name = %name, "ignoring frame from communicator");
                    }
                    // tungstenite answers pings itself
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                }
            }
        }
    }
}

pub(crate) async fn handle_communicator(
    socket: WebSocket,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (name, token) = perform_auth(&mut ws_tx, &mut ws_rx, &state).await?;

    let (handle, mut inbox) = ConnHandle::new(peer, state.settings.send_queue);
    let id = handle.id;
    if let Some(displaced) = state.registry.bind(&name, handle) {
        counters::takeovers_total();
        warn!(name = %name, peer = %peer, displaced = %displaced, "took over communicator connection");
    }
    // a reload between authenticate and bind may have revoked the token
    if state
        .registry
        .authenticate(&token, &state.config.current())
        .is_err()
    {
        state.registry.unbind(&name, id);
        let _ = ws_tx
            .send(close_frame(close_code::POLICY, INVALID_TOKEN_REASON))
            .await;
        return Err(RelayError::Unauthorized);
    }
    info!(name = %name, peer = %peer, "communicator connected");
    gauges::inc_communicators_connected();

    let result = run_delivery_loop(&mut ws_tx, &mut ws_rx, &mut inbox, &name).await;

    state.registry.unbind(&name, id);
    gauges::dec_communicators_connected();
    info!(name = %name, peer = %peer, "communicator disconnected");

    result
}

pub(crate) async fn handle_echo(socket: WebSocket, peer: SocketAddr) -> Result<(), RelayError> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    while let Some(msg) = ws_rx.next().await {
        match msg? {
            Message::Text(text) => {
                debug!(peer = %peer, "echo: {}", text);
                ws_tx.send(Message::Text(text)).await?;
            }
            Message::Binary(data) => ws_tx.send(Message::Binary(data)).await?,
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takeover_reason_names_new_peer() {
        let by: SocketAddr = "10.0.0.7:5555".parse().unwrap();
        assert_eq!(takeover_reason(by), "10.0.0.7:5555 has taken over this connection");
    }

    #[test]
    fn invalid_token_close_frame() {
        let Message::Close(Some(frame)) = close_frame(close_code::POLICY, INVALID_TOKEN_REASON) else {
            panic!("expected close frame");
        };
        assert_eq!(frame.code, 1008);
        assert_eq!(frame.reason, "Invalid token");
    }
}
