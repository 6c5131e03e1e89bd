//! Command link to the supervised application over its WebSocket API.
//!
//! [`ApplicationClient`] keeps one connection open, reconnecting with backoff,
//! and authenticates with the configured token. [`ApplicationLink`] is the
//! cloneable handle the backup engine uses to send quiesce commands; each
//! command is acknowledged by a `result` message carrying the same `id`.
//! Commands issued while disconnected fail immediately instead of queueing,
//! so a late "backup/start" can never follow the matching "backup/end".

use crate::config::ApplicationConfig;
use async_trait::async_trait;
use backup_core::freeze::QuiesceChannel;
use backup_core::{BackupError, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = HashMap<u64, oneshot::Sender<Result<()>>>;

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

struct LinkRequest {
    command: &'static str,
    reply: oneshot::Sender<Result<()>>,
}

/// Handle for sending commands to the application.
#[derive(Clone)]
pub struct ApplicationLink {
    requests: mpsc::Sender<LinkRequest>,
}

impl ApplicationLink {
    async fn request(&self, command: &'static str) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(LinkRequest { command, reply })
            .await
            .map_err(|_| BackupError::Component("application link is stopped".to_string()))?;
        response
            .await
            .map_err(|_| BackupError::Component("application link dropped the request".to_string()))?
    }
}

#[async_trait]
impl QuiesceChannel for ApplicationLink {
    async fn begin_quiesce(&self) -> Result<()> {
        self.request("backup/start").await
    }

    async fn end_quiesce(&self) -> Result<()> {
        self.request("backup/end").await
    }
}

/// Messages received from the application.
#[derive(Debug, Deserialize)]
struct Incoming {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Connection owner. Drive it with [`ApplicationClient::run`].
pub struct ApplicationClient {
    url: String,
    token: Option<String>,
    requests: mpsc::Receiver<LinkRequest>,
    shutdown: CancellationToken,
}

/// Create a connected pair of handle and connection owner.
pub fn link(config: &ApplicationConfig, shutdown: CancellationToken) -> (ApplicationLink, ApplicationClient) {
    let (requests_tx, requests_rx) = mpsc::channel(8);
    (
        ApplicationLink { requests: requests_tx },
        ApplicationClient {
            url: config.url.clone(),
            token: config.token.clone(),
            requests: requests_rx,
            shutdown,
        },
    )
}

impl ApplicationClient {
    /// Run the client with automatic reconnection until shutdown.
    pub async fn run(mut self) {
        let mut backoff_ms: u64 = 1000;
        let max_backoff_ms: u64 = 30000;

        loop {
            if self.shutdown.is_cancelled() {
                info!("Application link shutting down");
                return;
            }

            match self.connect_and_run().await {
                Ok(()) => {
                    info!("Application connection closed");
                    backoff_ms = 1000;
                }
                Err(e) => warn!("Application connection error: {:#}", e),
            }

            if self.shutdown.is_cancelled() {
                return;
            }

            info!("Reconnecting to application in {}ms...", backoff_ms);
            let sleep = tokio::time::sleep(Duration::from_millis(backoff_ms));
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = self.shutdown.cancelled() => return,
                    request = self.requests.recv() => match request {
                        Some(request) => {
                            let _ = request.reply.send(Err(BackupError::Component(
                                "not connected to the application".to_string(),
                            )));
                        }
                        None => return,
                    },
                }
            }

            backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
        }
    }

    async fn connect_and_run(&mut self) -> anyhow::Result<()> {
        info!("Connecting to application WebSocket: {}", self.url);
        let (mut ws, _) = connect_async(self.url.as_str()).await?;
        tokio::time::timeout(AUTH_TIMEOUT, authenticate(&mut ws, self.token.as_deref()))
            .await
            .map_err(|_| anyhow::anyhow!("authentication timed out"))??;
        info!("Connected to application");

        let mut pending = HashMap::new();
        let result = self.serve(ws, &mut pending).await;
        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(BackupError::Component(
                "connection to the application was lost".to_string(),
            )));
        }
        result
    }

    /// Forward commands and route acknowledgments until the connection ends.
    async fn serve(&mut self, ws: WsStream, pending: &mut Pending) -> anyhow::Result<()> {
        let (mut write, mut read) = ws.split();
        let mut next_id: u64 = 1;

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else { return Ok(()) };
                    if request.reply.is_closed() {
                        debug!(command = request.command, "Caller gave up before send, dropping");
                        continue;
                    }
                    let id = next_id;
                    next_id += 1;
                    let message = serde_json::json!({ "id": id, "type": request.command });
                    write.send(Message::Text(message.to_string().into())).await?;
                    debug!(id, command = request.command, "Sent command to application");
                    pending.insert(id, request.reply);
                }

                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => handle_message(text.as_str(), pending),
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },

                _ = self.shutdown.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
        }
    }
}

async fn authenticate(ws: &mut WsStream, token: Option<&str>) -> anyhow::Result<()> {
    loop {
        let incoming = match ws.next().await {
            Some(Ok(Message::Text(text))) => serde_json::from_str::<Incoming>(text.as_str())?,
            Some(Ok(Message::Ping(data))) => {
                ws.send(Message::Pong(data)).await?;
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
            None => anyhow::bail!("connection closed during authentication"),
        };

        match incoming.kind.as_str() {
            "auth_required" => {
                let Some(token) = token else {
                    anyhow::bail!("application requires an access token");
                };
                let auth = serde_json::json!({ "type": "auth", "access_token": token });
                ws.send(Message::Text(auth.to_string().into())).await?;
            }
            "auth_ok" => return Ok(()),
            "auth_invalid" => anyhow::bail!(
                "access token rejected: {}",
                incoming.message.unwrap_or_default()
            ),
            other => anyhow::bail!("unexpected message during authentication: {}", other),
        }
    }
}

/// Resolve the pending request a `result` message answers.
fn handle_message(text: &str, pending: &mut Pending) {
    let incoming: Incoming = match serde_json::from_str(text) {
        Ok(incoming) => incoming,
        Err(e) => {
            warn!("Unparseable message from application: {} (raw: {})", e, text);
            return;
        }
    };
    if incoming.kind != "result" {
        debug!(kind = %incoming.kind, "Ignoring application message");
        return;
    }
    let Some(reply) = incoming.id.and_then(|id| pending.remove(&id)) else {
        debug!(id = ?incoming.id, "Result for unknown request");
        return;
    };

    let outcome = if incoming.success.unwrap_or(false) {
        Ok(())
    } else {
        let detail = incoming
            .error
            .map(|e| format!("{}: {}", e.code.unwrap_or_default(), e.message.unwrap_or_default()))
            .unwrap_or_else(|| "no details".to_string());
        Err(BackupError::Component(format!("application rejected command ({})", detail)))
    };
    let _ = reply.send(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_result_resolves_matching_request() {
        let mut pending = HashMap::new();
        let (tx_ok, mut rx_ok) = oneshot::channel();
        let (tx_err, mut rx_err) = oneshot::channel();
        pending.insert(1, tx_ok);
        pending.insert(2, tx_err);

        handle_message(r#"{"id": 2, "type": "result", "success": false, "error": {"code": "busy", "message": "recorder"}}"#, &mut pending);
        handle_message(r#"{"id": 1, "type": "result", "success": true, "result": null}"#, &mut pending);
        handle_message(r#"{"id": 9, "type": "result", "success": true}"#, &mut pending);
        handle_message(r#"{"type": "event", "event": {}}"#, &mut pending);

        assert!(pending.is_empty());
        assert!(rx_ok.try_recv().unwrap().is_ok());
        match rx_err.try_recv().unwrap() {
            Err(BackupError::Component(message)) => assert!(message.contains("busy")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    /// Minimal application: authenticates, then acknowledges every command.
    async fn fake_application(listener: TcpListener, received: mpsc::UnboundedSender<String>) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(r#"{"type":"auth_required"}"#.to_string().into()))
            .await
            .unwrap();
        let Some(Ok(Message::Text(auth))) = ws.next().await else {
            panic!("expected auth message");
        };
        assert!(auth.as_str().contains("secret-token"));
        ws.send(Message::Text(r#"{"type":"auth_ok"}"#.to_string().into()))
            .await
            .unwrap();

        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let command: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            received.send(command["type"].as_str().unwrap().to_string()).unwrap();
            let ack = serde_json::json!({ "id": command["id"], "type": "result", "success": true });
            ws.send(Message::Text(ack.to_string().into())).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_quiesce_round_trip_over_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, mut received_rx) = mpsc::unbounded_channel();
        tokio::spawn(fake_application(listener, received_tx));

        let shutdown = CancellationToken::new();
        let config = ApplicationConfig {
            url: format!("ws://{}/api/websocket", addr),
            token: Some("secret-token".to_string()),
        };
        let (link, client) = link(&config, shutdown.clone());
        tokio::spawn(client.run());

        // The first attempt may race the connection; retry until connected.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match link.begin_quiesce().await {
                Ok(()) => break,
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => panic!("never connected: {}", e),
            }
        }
        link.end_quiesce().await.unwrap();

        assert_eq!(received_rx.recv().await.unwrap(), "backup/start");
        assert_eq!(received_rx.recv().await.unwrap(), "backup/end");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_disconnected_link_fails_fast() {
        let shutdown = CancellationToken::new();
        let config = ApplicationConfig {
            url: "ws://127.0.0.1:9/api/websocket".to_string(),
            token: None,
        };
        let (link, client) = link(&config, shutdown.clone());
        tokio::spawn(client.run());

        let result = tokio::time::timeout(Duration::from_secs(3), link.begin_quiesce())
            .await
            .unwrap();
        assert!(matches!(result, Err(BackupError::Component(_))));
        shutdown.cancel();
    }
}
