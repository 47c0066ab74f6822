//! WebSocket transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{
    ack_result, describe_error, ChannelEvent, Connection, Connector, ControlChannel,
    EnginePacket, OpenData, SocketPacket,
};
use crate::control::NODE_USER_AGENT;
use crate::error::{NodeError, NodeResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>>;

/// How long to wait for the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opens Socket.IO channels over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: Url,
}

/// A Socket.IO channel over WebSocket.
#[derive(Debug)]
pub struct WebSocketChannel {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingAcks,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl WebSocketConnector {
    /// Creates a connector for a control plane base URL.
    pub fn new(base_url: &Url) -> NodeResult<Self> {
        let mut url = base_url
            .join("socket.io/")
            .map_err(NodeError::request_error)?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| {
            NodeError::RequestError(anyhow::anyhow!("Cannot use {} over WebSocket", base_url))
        })?;
        url.query_pairs_mut()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket");

        Ok(Self { url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, token: &str) -> NodeResult<Connection> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(NodeError::request_error)?;
        request
            .headers_mut()
            .insert("user-agent", HeaderValue::from_static(NODE_USER_AGENT));

        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(NodeError::request_error)?;

        let open = time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut stream, token))
            .await
            .map_err(|_| NodeError::AckTimeout {
                event: "connect".to_string(),
            })??;

        tracing::debug!(sid = %open.sid, "Control channel connected");

        let (sink, stream) = stream.split();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(sink, outgoing_rx, closed.clone()));
        tokio::spawn(read_loop(
            stream,
            outgoing.clone(),
            events,
            pending.clone(),
            closed.clone(),
            liveness_timeout(&open),
        ));

        let channel = WebSocketChannel {
            outgoing,
            pending,
            next_id: AtomicU64::new(0),
            closed,
        };

        Ok(Connection {
            channel: Arc::new(channel),
            events: events_rx,
        })
    }
}

#[async_trait]
impl ControlChannel for WebSocketChannel {
    async fn emit(
        &self,
        event: &str,
        payload: Option<Value>,
        timeout: Duration,
    ) -> NodeResult<Value> {
        if self.closed.is_cancelled() {
            return Err(NodeError::Disconnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        let packet = SocketPacket::Event {
            id: Some(id),
            name: event.to_string(),
            args: payload.into_iter().collect(),
        };

        tracing::trace!(event, id, "Emitting");
        if self
            .outgoing
            .send(Message::Text(packet.to_engine().encode()))
            .is_err()
        {
            lock(&self.pending).remove(&id);
            return Err(NodeError::Disconnected);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(args)) => ack_result(event, args),
            Ok(Err(_)) => Err(NodeError::Disconnected),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(NodeError::AckTimeout {
                    event: event.to_string(),
                })
            }
        }
    }

    async fn close(&self) {
        let disconnect = SocketPacket::Disconnect.to_engine().encode();
        let _ = self.outgoing.send(Message::Text(disconnect));
        let _ = self.outgoing.send(Message::Close(None));
        self.closed.cancel();
    }
}

/// Waits for the Engine.IO handshake and joins the default namespace.
async fn handshake(stream: &mut WsStream, token: &str) -> NodeResult<OpenData> {
    let open = match next_packet(stream).await? {
        EnginePacket::Open(open) => open,
        other => {
            return Err(NodeError::RequestError(anyhow::anyhow!(
                "Expected handshake, got {:?}",
                other
            )))
        }
    };

    let connect = SocketPacket::Connect(Some(json!({ "token": token })));
    stream
        .send(Message::Text(connect.to_engine().encode()))
        .await
        .map_err(NodeError::request_error)?;

    loop {
        match next_packet(stream).await? {
            EnginePacket::Ping(data) => {
                stream
                    .send(Message::Text(EnginePacket::Pong(data).encode()))
                    .await
                    .map_err(NodeError::request_error)?;
            }
            EnginePacket::Message(data) => {
                match SocketPacket::parse(&data).map_err(NodeError::request_error)? {
                    SocketPacket::Connect(_) => return Ok(open),
                    SocketPacket::ConnectError(err) => {
                        return Err(NodeError::ControlPlaneError {
                            event: "connect".to_string(),
                            error: describe_error(&err),
                        })
                    }
                    other => tracing::debug!("Ignoring {:?} before connect", other),
                }
            }
            EnginePacket::Close => return Err(NodeError::Disconnected),
            _ => {}
        }
    }
}

async fn next_packet(stream: &mut WsStream) -> NodeResult<EnginePacket> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return EnginePacket::parse(&text).map_err(NodeError::request_error)
            }
            Some(Ok(Message::Close(_))) | None => return Err(NodeError::Disconnected),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(NodeError::request_error(e)),
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    closed: CancellationToken,
) {
    while let Some(message) = outgoing.recv().await {
        let is_close = matches!(message, Message::Close(_));

        if let Err(e) = sink.send(message).await {
            tracing::debug!("Failed to write to control channel: {}", e);
            break;
        }

        if is_close {
            break;
        }
    }

    closed.cancel();
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    outgoing: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    pending: PendingAcks,
    closed: CancellationToken,
    liveness: Duration,
) {
    let reason = loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break "closed by client".to_string(),
            message = time::timeout(liveness, stream.next()) => message,
        };

        let text = match message {
            Err(_) => break "ping timeout".to_string(),
            Ok(None) => break "transport closed".to_string(),
            Ok(Some(Err(e))) => break format!("transport error: {}", e),
            Ok(Some(Ok(Message::Text(text)))) => text,
            Ok(Some(Ok(Message::Close(_)))) => break "transport closed".to_string(),
            Ok(Some(Ok(_))) => continue,
        };

        let packet = match EnginePacket::parse(&text) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Ignoring malformed frame {:?}: {}", text, e);
                continue;
            }
        };

        match packet {
            EnginePacket::Ping(data) => {
                let _ = outgoing.send(Message::Text(EnginePacket::Pong(data).encode()));
            }
            EnginePacket::Close => break "closed by server".to_string(),
            EnginePacket::Message(data) => match SocketPacket::parse(&data) {
                Ok(SocketPacket::Ack { id, args }) => {
                    if let Some(tx) = lock(&pending).remove(&id) {
                        let _ = tx.send(args);
                    } else {
                        tracing::debug!(id, "Dropping late acknowledgement");
                    }
                }
                Ok(SocketPacket::Event { name, args, .. }) => {
                    let _ = events.send(ChannelEvent::Event { name, args });
                }
                Ok(SocketPacket::Disconnect) => break "disconnected by server".to_string(),
                Ok(other) => tracing::debug!("Ignoring {:?}", other),
                Err(e) => tracing::warn!("Ignoring malformed packet {:?}: {}", data, e),
            },
            _ => {}
        }
    };

    closed.cancel();

    // Dropping the senders fails every in-flight emit
    lock(&pending).clear();

    let _ = events.send(ChannelEvent::Disconnected { reason });
}

/// Returns how long the server may stay silent before the channel is
/// considered dead.
fn liveness_timeout(open: &OpenData) -> Duration {
    Duration::from_millis(open.ping_interval + open.ping_timeout)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
