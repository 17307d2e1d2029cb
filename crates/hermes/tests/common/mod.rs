#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use hermes::broadcast::Envelope;
use hermes::config::ServerConfig;
use hermes::configuration::ConfigStore;
use hermes::server::ServerState;
use hermes::tokens::TokenStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

pub const SCENARIO: &str = r#"{
    "services": [{"name": "weather"}],
    "communicators": [{"name": "bot", "id-index": 0}],
    "recipients": [{"name": "alice", "ids": ["A1"], "subscriptions": ["weather"]}]
}"#;

pub fn test_config(dir: &tempfile::TempDir, listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        config_path: dir.path().join("config.json"),
        tokens_path: dir.path().join("tokens.txt"),
        auth_timeout: 5,
        send_queue: 64,
    }
}

pub struct TestRelay {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub dir: tempfile::TempDir,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestRelay {
    pub async fn start(descriptor: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let settings = test_config(&dir, addr);
        std::fs::write(&settings.config_path, descriptor).unwrap();

        let tokens = Arc::new(TokenStore::new(settings.tokens_path.clone()));
        let store = Arc::new(ConfigStore::open(settings.config_path.clone(), tokens).unwrap());
        let state = Arc::new(ServerState::new(store, settings));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let state_clone = state.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = hermes::run_with_shutdown(listener, state_clone, shutdown).await {
                eprintln!("server error in test: {e}");
            }
        });

        Self {
            addr,
            state,
            dir,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.state.settings.config_path.clone()
    }

    pub fn token(&self, name: &str) -> String {
        self.state.tokens().resolve_name(name).unwrap()
    }

    pub fn rewrite_config(&self, descriptor: &str) {
        std::fs::write(self.config_path(), descriptor).unwrap();
    }

    pub async fn publish(&self, token: &str, msg: &str) -> (u16, String) {
        let resp = reqwest::Client::new()
            .post(format!("http://{}/service", self.addr))
            .form(&[("token", token), ("msg", msg)])
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    pub async fn get(&self, path: &str) -> (u16, String) {
        let resp = reqwest::get(format!("http://{}{path}", self.addr))
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    pub async fn wait_until<F>(&self, mut condition: F)
    where
        F: FnMut(&ServerState) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition(&self.state) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timeout waiting for relay state"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_connected(&self, name: &str) {
        self.wait_until(|state| state.registry.is_connected(name)).await;
    }

    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct TestClient {
    pub ws_tx: futures_util::stream::SplitSink<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        Message,
    >,
    pub ws_rx: futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
}

impl TestClient {
    pub async fn connect(addr: &SocketAddr, path: &str) -> Self {
        let url = format!("ws://{addr}{path}");
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (ws_tx, ws_rx) = ws.split();
        Self { ws_tx, ws_rx }
    }

    /// Connect to `/communicator` and present `token`.
    pub async fn communicator(addr: &SocketAddr, token: &str) -> Self {
        let mut client = Self::connect(addr, "/communicator").await;
        client.send_text(token).await;
        client
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    pub async fn recv_text(&mut self) -> String {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.ws_rx.next())
                .await
                .expect("timeout waiting for message")
                .unwrap()
                .unwrap();
            match msg {
                Message::Text(text) => return text,
                Message::Ping(_) | Message::Pong(_) => {}
                other => panic!("expected text frame, got {other:?}"),
            }
        }
    }

    pub async fn recv_envelope(&mut self) -> Envelope {
        let text = self.recv_text().await;
        serde_json::from_str(&text).unwrap()
    }

    /// Next text frame within `timeout`, `None` if nothing arrives.
    pub async fn recv_text_timeout(&mut self, timeout: Duration) -> Option<String> {
        tokio::time::timeout(timeout, self.recv_text()).await.ok()
    }

    /// Wait for the server's close frame; `None` if the stream ends without one.
    pub async fn recv_close(&mut self) -> Option<CloseFrame<'static>> {
        let wait = async {
            while let Some(msg) = self.ws_rx.next().await {
                match msg {
                    Ok(Message::Close(frame)) => return frame,
                    Ok(Message::Text(text)) => panic!("expected close, got text {text}"),
                    Ok(_) => {}
                    Err(_) => return None,
                }
            }
            None
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("timeout waiting for close frame")
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.send(Message::Close(None)).await;
    }
}
