use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use serenity::model::id::UserId;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::stats::NodeStats;
use crate::error::{LinkError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Puerto usado cuando la dirección del nodo no trae uno
pub const DEFAULT_PORT: u16 = 80;

/// Where a node lives and how to authenticate against it
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub host: String,
    pub port: u16,
    pub region: Option<String>,
    pub password: String,
    pub user_id: UserId,
    pub num_shards: u64,
}

impl NodeOptions {
    /// Registry key: `host:port`
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn address(&self) -> Result<Url> {
        Url::parse(&format!("ws://{}:{}", self.host, self.port))
            .map_err(|e| LinkError::Config(format!("invalid node address {}: {e}", self.key())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Connecting,
    Ready,
}

/// Notifications a node pushes to whoever registered its sink
#[derive(Debug)]
pub enum NodeEventKind {
    Ready,
    Disconnect,
    /// Parsed frame, forwarded whatever its op
    Message(Value),
    Error(LinkError),
}

#[derive(Debug)]
pub struct NodeEvent {
    /// Key of the emitting node
    pub node: String,
    pub kind: NodeEventKind,
}

/// Observer registered at node creation
pub type NodeEventSink = Arc<dyn Fn(NodeEvent) + Send + Sync>;

/// Point-in-time view of a node, for selection and status logs
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub key: String,
    pub region: Option<String>,
    pub state: NodeState,
    pub draining: bool,
    pub stats: Option<NodeStats>,
    pub retries: u32,
}

#[derive(Debug)]
struct LinkState {
    state: NodeState,
    draining: bool,
    stats: Option<NodeStats>,
    retries: u32,
}

struct NodeInner {
    options: NodeOptions,
    key: String,
    status: RwLock<LinkState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    sink: NodeEventSink,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closed {
    Remote,
    Shutdown,
}

/// One logical WebSocket to one audio node.
///
/// Cheap to clone; every clone drives the same socket. The socket task owns
/// the Disconnected → backoff → Connecting cycle, so at most one reconnect
/// wait is ever pending per node.
#[derive(Clone)]
pub struct NodeConnection {
    inner: Arc<NodeInner>,
}

impl std::fmt::Debug for NodeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnection")
            .field("key", &self.inner.key)
            .field("status", &*self.inner.status.read())
            .finish()
    }
}

/// Quantized exponential backoff: `(min(retries - 1, 5) + 5)^2` seconds
pub fn retry_interval(retries: u32) -> Duration {
    let step = (i64::from(retries) - 1).min(5) + 5;
    Duration::from_millis((step * step * 1000) as u64)
}

fn handshake_request(options: &NodeOptions) -> Result<Request> {
    let mut request = options.address()?.as_str().into_client_request()?;

    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&options.password)
            .map_err(|_| LinkError::InvalidHeader { name: "Authorization" })?,
    );
    headers.insert("Num-Shards", HeaderValue::from(options.num_shards));
    headers.insert("User-Id", HeaderValue::from(options.user_id.get()));

    Ok(request)
}

impl NodeConnection {
    /// Builds the connection without opening the socket; see [`connect`](Self::connect)
    pub fn new(options: NodeOptions, sink: NodeEventSink) -> Self {
        let key = options.key();
        Self {
            inner: Arc::new(NodeInner {
                options,
                key,
                status: RwLock::new(LinkState {
                    state: NodeState::Disconnected,
                    draining: false,
                    stats: None,
                    retries: 0,
                }),
                outbound: Mutex::new(None),
                sink,
                shutdown: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn host(&self) -> &str {
        &self.inner.options.host
    }

    pub fn region(&self) -> Option<&str> {
        self.inner.options.region.as_deref()
    }

    pub fn options(&self) -> &NodeOptions {
        &self.inner.options
    }

    pub fn state(&self) -> NodeState {
        self.inner.status.read().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == NodeState::Ready
    }

    pub fn is_draining(&self) -> bool {
        self.inner.status.read().draining
    }

    /// Excludes the node from new placements; existing sessions stay
    pub fn set_draining(&self, draining: bool) {
        self.inner.status.write().draining = draining;
    }

    pub fn stats(&self) -> Option<NodeStats> {
        self.inner.status.read().stats.clone()
    }

    pub fn cpu_load(&self) -> f64 {
        self.inner
            .status
            .read()
            .stats
            .as_ref()
            .map_or(0.0, NodeStats::cpu_load)
    }

    pub fn retries(&self) -> u32 {
        self.inner.status.read().retries
    }

    pub fn status(&self) -> NodeStatus {
        let status = self.inner.status.read();
        NodeStatus {
            key: self.inner.key.clone(),
            region: self.inner.options.region.clone(),
            state: status.state,
            draining: status.draining,
            stats: status.stats.clone(),
            retries: status.retries,
        }
    }

    /// Spawns the socket task; calling it again while it runs is a no-op
    pub fn connect(&self) {
        if self.inner.shutdown.is_cancelled() {
            warn!("🚫 Nodo {} destruido, no se reconecta", self.inner.key);
            return;
        }

        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *task = Some(tokio::spawn(self.clone().run()));
    }

    /// Serializes and writes a frame. Returns `false` when nothing was written.
    ///
    /// With no open socket this silently drops the payload; buffering is the
    /// session queue's job.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                self.emit(NodeEventKind::Error(LinkError::Serialize(e)));
                return false;
            }
        };

        let outbound = self.inner.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => {
                debug!("📤 {} <- {}", self.inner.key, text);
                tx.send(Message::text(text)).is_ok()
            }
            None => false,
        }
    }

    /// Intentional shutdown: closes the socket without a disconnect event or retry
    pub fn destroy(&self) {
        self.inner.shutdown.cancel();
        self.inner.outbound.lock().take();
        self.inner.status.write().state = NodeState::Disconnected;
        info!("🔌 Nodo {} cerrado", self.inner.key);
    }

    fn emit(&self, kind: NodeEventKind) {
        (self.inner.sink)(NodeEvent {
            node: self.inner.key.clone(),
            kind,
        });
    }

    fn set_state(&self, state: NodeState) {
        self.inner.status.write().state = state;
    }

    /// One authenticated handshake, closed right away
    pub async fn probe(options: &NodeOptions) -> Result<()> {
        let (mut stream, _) = connect_async(handshake_request(options)?).await?;
        let _ = stream.close(None).await;
        Ok(())
    }

    async fn run(self) {
        let token = self.inner.shutdown.clone();
        let mut reconnecting = false;

        loop {
            self.set_state(NodeState::Connecting);

            let request = match handshake_request(&self.inner.options) {
                Ok(request) => request,
                Err(e) => {
                    error!("❌ No se puede construir el handshake para {}: {}", self.inner.key, e);
                    self.set_state(NodeState::Disconnected);
                    self.emit(NodeEventKind::Error(e));
                    return;
                }
            };

            let attempt = tokio::select! {
                _ = token.cancelled() => return,
                attempt = connect_async(request) => attempt,
            };

            match attempt {
                Ok((stream, _)) => {
                    let outbound = self.on_open();
                    reconnecting = false;
                    if self.pump(stream, outbound, &token).await == Closed::Shutdown {
                        return;
                    }
                }
                Err(e) => {
                    warn!("⚠️ Fallo al conectar con {}: {}", self.inner.key, e);
                    self.emit(NodeEventKind::Error(LinkError::Transport(e)));
                }
            }

            self.inner.outbound.lock().take();
            let delay = {
                let mut status = self.inner.status.write();
                status.state = NodeState::Disconnected;
                let delay = retry_interval(status.retries);
                status.retries += 1;
                delay
            };

            if !reconnecting {
                reconnecting = true;
                warn!("🔌 Nodo {} desconectado", self.inner.key);
                self.emit(NodeEventKind::Disconnect);
            }
            info!(
                "🔄 Reintentando {} en {:?} (intento {})",
                self.inner.key,
                delay,
                self.retries()
            );

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn on_open(&self) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.outbound.lock() = Some(tx);
        {
            let mut status = self.inner.status.write();
            status.state = NodeState::Ready;
            status.retries = 0;
        }
        info!("✅ Conectado al nodo {}", self.inner.key);
        self.emit(NodeEventKind::Ready);
        rx
    }

    async fn pump(
        &self,
        stream: WsStream,
        mut outbound: mpsc::UnboundedReceiver<Message>,
        token: &CancellationToken,
    ) -> Closed {
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Closed::Shutdown;
                }
                Some(frame) = outbound.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        warn!("⚠️ Error escribiendo en {}: {}", self.inner.key, e);
                        self.emit(NodeEventKind::Error(LinkError::Transport(e)));
                        return Closed::Remote;
                    }
                }
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.on_message(text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => self.on_message(text),
                        Err(_) => warn!("⚠️ Frame binario no UTF-8 desde {}", self.inner.key),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Nodo {} cerró la conexión: {:?}", self.inner.key, frame);
                        return Closed::Remote;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.emit(NodeEventKind::Error(LinkError::Transport(e)));
                        return Closed::Remote;
                    }
                    None => return Closed::Remote,
                },
            }
        }
    }

    fn on_message(&self, raw: &str) {
        let data: Value = match serde_json::from_str(raw) {
            Ok(data) => data,
            Err(e) => {
                self.emit(NodeEventKind::Error(LinkError::Deserialize(e)));
                return;
            }
        };

        if data.get("op").and_then(Value::as_str) == Some("stats") {
            match serde_json::from_value::<NodeStats>(data.clone()) {
                Ok(stats) => self.inner.status.write().stats = Some(stats),
                Err(e) => warn!("⚠️ Stats inválidas desde {}: {}", self.inner.key, e),
            }
        }

        self.emit(NodeEventKind::Message(data));
    }
}

#[cfg(test)]
impl NodeConnection {
    /// Ready node whose writes land in the returned receiver instead of a socket
    pub(crate) fn attached(
        options: NodeOptions,
        sink: NodeEventSink,
    ) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let node = Self::new(options, sink);
        let (tx, rx) = mpsc::unbounded_channel();
        *node.inner.outbound.lock() = Some(tx);
        node.set_state(NodeState::Ready);
        (node, rx)
    }

    pub(crate) fn force_state(&self, state: NodeState) {
        self.set_state(state);
    }

    pub(crate) fn receive_raw(&self, raw: &str) {
        self.on_message(raw);
    }
}
