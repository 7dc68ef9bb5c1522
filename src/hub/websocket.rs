//! Home Assistant WebSocket transport
//!
//! One actor task owns the socket. Callers talk to it through a bounded
//! command channel; replies come back on oneshot channels keyed by message id.
//!
//! ```text
//! WsConnection ──Command──► actor ──frames──► hub
//!                             │
//!                             ├── result  → pending oneshot
//!                             ├── event   → StateSink (filtered by entity id)
//!                             └── closed  → Disconnected, backoff, re-auth,
//!                                           re-subscribe, Ready
//! ```

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::oauth;
use super::{
    AuthOptions, EntityState, Hub, HubAuth, HubConnection, HubError, HubSubscription,
    LifecycleEvent, StateSink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const COMMAND_CHANNEL_SIZE: usize = 64;
const LIFECYCLE_CHANNEL_SIZE: usize = 16;

// =============================================================================
// Hub
// =============================================================================

/// Hub capability backed by a real Home Assistant instance
pub struct WsHub {
    http: reqwest::Client,
}

impl WsHub {
    pub fn new() -> Self {
        Self {
            http: oauth::http_client(),
        }
    }
}

impl Default for WsHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Hub for WsHub {
    async fn get_auth(&self, options: AuthOptions) -> Result<Arc<dyn HubAuth>, HubError> {
        oauth::get_auth(&self.http, options).await
    }

    async fn create_connection(
        &self,
        auth: Arc<dyn HubAuth>,
    ) -> Result<Arc<dyn HubConnection>, HubError> {
        let connection = WsConnection::open(auth).await?;
        Ok(Arc::new(connection))
    }
}

/// Map the hub's base URL to its WebSocket endpoint
pub fn websocket_url(hub_url: &str) -> Result<String, HubError> {
    let trimmed = hub_url.trim();
    if trimmed.is_empty() {
        return Err(HubError::HostRequired);
    }
    let mut url =
        Url::parse(trimmed).map_err(|e| HubError::Protocol(format!("invalid hub URL: {}", e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(HubError::Protocol(format!(
                "unsupported hub URL scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| HubError::Protocol("cannot switch URL scheme".to_string()))?;

    let path = format!("{}/api/websocket", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(None);
    Ok(url.to_string())
}

fn map_ws_error(e: tungstenite::Error) -> HubError {
    match e {
        tungstenite::Error::Io(_) => HubError::CannotConnect,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            HubError::ConnectionLost
        }
        other => HubError::Network(other.to_string()),
    }
}

/// Next JSON text frame, skipping control frames
async fn next_json(socket: &mut WsStream) -> Result<Value, HubError> {
    loop {
        let frame = timeout(REQUEST_TIMEOUT, socket.next())
            .await
            .map_err(|_| HubError::Timeout)?;
        match frame {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str())
                    .map_err(|e| HubError::Protocol(format!("invalid frame: {}", e)));
            }
            Some(Ok(Message::Close(_))) | None => return Err(HubError::ConnectionLost),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(map_ws_error(e)),
        }
    }
}

/// Open the socket and run the `auth_required` → `auth` → `auth_ok` handshake
async fn connect_and_auth(url: &str, auth: &dyn HubAuth) -> Result<WsStream, HubError> {
    let token = auth.access_token().await?;

    let (mut socket, _response) = timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| HubError::Timeout)?
        .map_err(map_ws_error)?;

    let greeting = next_json(&mut socket).await?;
    if greeting["type"] != "auth_required" {
        return Err(HubError::Protocol(format!(
            "expected auth_required, got {}",
            greeting["type"]
        )));
    }

    let auth_msg = json!({ "type": "auth", "access_token": token });
    socket
        .send(Message::text(auth_msg.to_string()))
        .await
        .map_err(map_ws_error)?;

    let reply = next_json(&mut socket).await?;
    match reply["type"].as_str() {
        Some("auth_ok") => {
            debug!(
                "Hub accepted credentials (version {})",
                reply["ha_version"].as_str().unwrap_or("?")
            );
            Ok(socket)
        }
        Some("auth_invalid") => {
            warn!(
                "Hub rejected credentials: {}",
                reply["message"].as_str().unwrap_or("no message")
            );
            Err(HubError::InvalidAuth)
        }
        _ => Err(HubError::Protocol(format!(
            "unexpected auth reply: {}",
            reply["type"]
        ))),
    }
}

// =============================================================================
// Connection handle
// =============================================================================

enum Command {
    Request {
        payload: Value,
        reply: oneshot::Sender<Result<Value, HubError>>,
    },
    Subscribe {
        key: u64,
        entity_ids: HashSet<String>,
        sink: StateSink,
        reply: oneshot::Sender<Result<(), HubError>>,
    },
    Unsubscribe {
        key: u64,
    },
}

/// Authenticated connection to the hub
pub struct WsConnection {
    commands: mpsc::Sender<Command>,
    open: Arc<AtomicBool>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    shutdown: CancellationToken,
    next_key: AtomicU64,
}

impl WsConnection {
    /// Connect, authenticate and spawn the socket actor
    pub async fn open(auth: Arc<dyn HubAuth>) -> Result<Self, HubError> {
        let url = websocket_url(auth.hub_url())?;
        info!("Connecting to hub at {}", url);
        let socket = connect_and_auth(&url, auth.as_ref()).await?;

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_CHANNEL_SIZE);
        let open = Arc::new(AtomicBool::new(true));
        let shutdown = CancellationToken::new();

        let actor = Actor {
            url,
            auth,
            commands: rx,
            open: open.clone(),
            lifecycle: lifecycle.clone(),
            shutdown: shutdown.clone(),
            next_id: 1,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
            upstream: HashMap::new(),
        };
        tokio::spawn(actor.run(socket));

        Ok(Self {
            commands: tx,
            open,
            lifecycle,
            shutdown,
            next_key: AtomicU64::new(1),
        })
    }

    async fn request(&self, payload: Value) -> Result<Value, HubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Request { payload, reply })
            .await
            .map_err(|_| HubError::ConnectionLost)?;
        timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| HubError::Timeout)?
            .map_err(|_| HubError::ConnectionLost)?
    }
}

#[async_trait]
impl HubConnection for WsConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn lifecycle(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    async fn fetch_states(&self) -> Result<Vec<EntityState>, HubError> {
        let result = self.request(json!({ "type": "get_states" })).await?;
        serde_json::from_value(result)
            .map_err(|e| HubError::Protocol(format!("invalid get_states result: {}", e)))
    }

    async fn subscribe_state_changes(
        &self,
        entity_ids: &[String],
        sink: StateSink,
    ) -> Result<Box<dyn HubSubscription>, HubError> {
        let key = self.next_key.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                key,
                entity_ids: entity_ids.iter().cloned().collect(),
                sink,
                reply,
            })
            .await
            .map_err(|_| HubError::ConnectionLost)?;

        timeout(REQUEST_TIMEOUT, rx)
            .await
            .map_err(|_| HubError::Timeout)?
            .map_err(|_| HubError::ConnectionLost)??;

        Ok(Box::new(WsSubscription {
            key,
            commands: self.commands.clone(),
            cancelled: AtomicBool::new(false),
        }))
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct WsSubscription {
    key: u64,
    commands: mpsc::Sender<Command>,
    cancelled: AtomicBool,
}

impl HubSubscription for WsSubscription {
    fn cancel(&self) -> Result<(), HubError> {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.commands
            .try_send(Command::Unsubscribe { key: self.key })
            .map_err(|_| HubError::ConnectionLost)
    }
}

// =============================================================================
// Actor
// =============================================================================

enum Pending {
    Request(oneshot::Sender<Result<Value, HubError>>),
    Subscribe {
        key: u64,
        reply: Option<oneshot::Sender<Result<(), HubError>>>,
    },
    /// Result we don't care about (unsubscribe acks)
    Ignored,
}

struct LocalSubscription {
    entity_ids: HashSet<String>,
    sink: StateSink,
    upstream_id: Option<u64>,
}

enum Wake {
    Shutdown,
    Command(Option<Command>),
    Frame(Option<Result<Message, tungstenite::Error>>),
}

struct Actor {
    url: String,
    auth: Arc<dyn HubAuth>,
    commands: mpsc::Receiver<Command>,
    open: Arc<AtomicBool>,
    lifecycle: broadcast::Sender<LifecycleEvent>,
    shutdown: CancellationToken,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    /// Local subscription key → subscription
    subscriptions: HashMap<u64, LocalSubscription>,
    /// Hub subscription id → local key
    upstream: HashMap<u64, u64>,
}

/// Hand a result back to a caller that may have given up waiting
fn answer<T>(reply: oneshot::Sender<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("Hub request abandoned by caller");
    }
}

impl Actor {
    fn signal(&self, event: LifecycleEvent) {
        if self.lifecycle.send(event).is_err() {
            debug!("No lifecycle listeners");
        }
    }

    async fn run(mut self, mut socket: WsStream) {
        loop {
            self.serve(&mut socket).await;
            self.open.store(false, Ordering::SeqCst);
            self.fail_pending();

            if self.shutdown.is_cancelled() {
                break;
            }
            self.signal(LifecycleEvent::Disconnected);

            match self.reconnect().await {
                Some(fresh) => {
                    socket = fresh;
                    self.open.store(true, Ordering::SeqCst);
                    if let Err(e) = self.resubscribe(&mut socket).await {
                        warn!("Re-subscribe after reconnect failed: {}", e);
                        continue;
                    }
                    info!("Hub connection re-established");
                    self.signal(LifecycleEvent::Ready);
                }
                None => break,
            }
        }
        debug!("Hub socket actor stopped");
    }

    /// Pump commands and frames until the socket closes or shutdown is requested
    async fn serve(&mut self, socket: &mut WsStream) {
        loop {
            let wake = tokio::select! {
                _ = self.shutdown.cancelled() => Wake::Shutdown,
                cmd = self.commands.recv() => Wake::Command(cmd),
                frame = socket.next() => Wake::Frame(frame),
            };

            match wake {
                Wake::Shutdown | Wake::Command(None) => {
                    if let Err(e) = socket.send(Message::Close(None)).await {
                        debug!("Close frame not sent: {}", e);
                    }
                    self.shutdown.cancel();
                    return;
                }
                Wake::Command(Some(cmd)) => {
                    if let Err(e) = self.handle_command(socket, cmd).await {
                        warn!("Hub socket write failed: {}", e);
                        return;
                    }
                }
                Wake::Frame(Some(Ok(Message::Text(text)))) => self.handle_text(text.as_str()),
                Wake::Frame(Some(Ok(Message::Close(frame)))) => {
                    info!("Hub closed the socket: {:?}", frame);
                    return;
                }
                Wake::Frame(Some(Ok(_))) => {}
                Wake::Frame(Some(Err(e))) => {
                    warn!("Hub socket error: {}", e);
                    return;
                }
                Wake::Frame(None) => {
                    info!("Hub socket ended");
                    return;
                }
            }
        }
    }

    async fn send(&mut self, socket: &mut WsStream, mut payload: Value) -> Result<u64, HubError> {
        let id = self.next_id;
        self.next_id += 1;
        payload["id"] = json!(id);
        socket
            .send(Message::text(payload.to_string()))
            .await
            .map_err(map_ws_error)?;
        Ok(id)
    }

    async fn handle_command(&mut self, socket: &mut WsStream, cmd: Command) -> Result<(), HubError> {
        match cmd {
            Command::Request { payload, reply } => match self.send(socket, payload).await {
                Ok(id) => {
                    self.pending.insert(id, Pending::Request(reply));
                }
                Err(e) => {
                    answer(reply, Err(e.clone()));
                    return Err(e);
                }
            },
            Command::Subscribe {
                key,
                entity_ids,
                sink,
                reply,
            } => {
                self.subscriptions.insert(
                    key,
                    LocalSubscription {
                        entity_ids,
                        sink,
                        upstream_id: None,
                    },
                );
                match self.send(socket, subscribe_payload()).await {
                    Ok(id) => {
                        self.pending.insert(
                            id,
                            Pending::Subscribe {
                                key,
                                reply: Some(reply),
                            },
                        );
                    }
                    Err(e) => {
                        self.subscriptions.remove(&key);
                        answer(reply, Err(e.clone()));
                        return Err(e);
                    }
                }
            }
            Command::Unsubscribe { key } => {
                let Some(sub) = self.subscriptions.remove(&key) else {
                    return Ok(());
                };
                if let Some(upstream_id) = sub.upstream_id {
                    self.upstream.remove(&upstream_id);
                    let payload = json!({
                        "type": "unsubscribe_events",
                        "subscription": upstream_id,
                    });
                    let id = self.send(socket, payload).await?;
                    self.pending.insert(id, Pending::Ignored);
                }
            }
        }
        Ok(())
    }

    fn handle_text(&mut self, text: &str) {
        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Ignoring malformed hub frame: {}", e);
                return;
            }
        };
        let id = msg["id"].as_u64();

        match (msg["type"].as_str(), id) {
            (Some("result"), Some(id)) => self.handle_result(id, &msg),
            (Some("event"), Some(id)) => self.handle_event(id, &msg["event"]),
            (Some("pong"), _) => {}
            (other, _) => debug!("Unhandled hub frame type {:?}", other),
        }
    }

    fn handle_result(&mut self, id: u64, msg: &Value) {
        let outcome = if msg["success"].as_bool().unwrap_or(false) {
            Ok(msg["result"].clone())
        } else {
            Err(HubError::Protocol(
                msg["error"]["message"]
                    .as_str()
                    .unwrap_or("command failed")
                    .to_string(),
            ))
        };

        match self.pending.remove(&id) {
            Some(Pending::Request(reply)) => {
                answer(reply, outcome);
            }
            Some(Pending::Subscribe { key, reply }) => {
                let outcome = outcome.map(|_| ());
                match &outcome {
                    Ok(()) => {
                        // Absent when unsubscribed before the hub acknowledged
                        if let Some(sub) = self.subscriptions.get_mut(&key) {
                            sub.upstream_id = Some(id);
                            self.upstream.insert(id, key);
                        }
                    }
                    Err(e) => {
                        warn!("Hub refused subscription {}: {}", key, e);
                        self.subscriptions.remove(&key);
                    }
                }
                if let Some(reply) = reply {
                    answer(reply, outcome);
                }
            }
            Some(Pending::Ignored) | None => {}
        }
    }

    fn handle_event(&self, id: u64, event: &Value) {
        let Some(sub) = self.upstream.get(&id).and_then(|key| self.subscriptions.get(key)) else {
            return;
        };
        if event["event_type"] != "state_changed" {
            return;
        }
        let data = &event["data"];
        let Some(entity_id) = data["entity_id"].as_str() else {
            return;
        };
        if !sub.entity_ids.contains(entity_id) || data["new_state"].is_null() {
            return;
        }
        match serde_json::from_value::<EntityState>(data["new_state"].clone()) {
            Ok(state) => (sub.sink)(state),
            Err(e) => warn!(entity_id = %entity_id, "Malformed state_changed payload: {}", e),
        }
    }

    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Request(reply) => {
                    answer(reply, Err(HubError::ConnectionLost));
                }
                Pending::Subscribe {
                    key,
                    reply: Some(reply),
                } => {
                    self.subscriptions.remove(&key);
                    answer(reply, Err(HubError::ConnectionLost));
                }
                Pending::Subscribe { reply: None, .. } | Pending::Ignored => {}
            }
        }
        self.upstream.clear();
        for sub in self.subscriptions.values_mut() {
            sub.upstream_id = None;
        }
    }

    /// Reconnect with backoff. Gives up for good on rejected credentials.
    async fn reconnect(&self) -> Option<WsStream> {
        let mut delay = RECONNECT_INITIAL_DELAY;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            match connect_and_auth(&self.url, self.auth.as_ref()).await {
                Ok(socket) => return Some(socket),
                Err(HubError::InvalidAuth) => {
                    warn!("Reconnect rejected: credentials no longer valid");
                    self.signal(LifecycleEvent::ReconnectError(HubError::InvalidAuth));
                    return None;
                }
                Err(e) => {
                    debug!("Reconnect failed ({}), next attempt in {:?}", e, delay);
                    self.signal(LifecycleEvent::ReconnectError(e));
                    delay = (delay * 2).min(RECONNECT_MAX_DELAY);
                }
            }
        }
    }

    async fn resubscribe(&mut self, socket: &mut WsStream) -> Result<(), HubError> {
        let keys: Vec<u64> = self.subscriptions.keys().copied().collect();
        for key in keys {
            let id = self.send(socket, subscribe_payload()).await?;
            self.pending
                .insert(id, Pending::Subscribe { key, reply: None });
        }
        Ok(())
    }
}

fn subscribe_payload() -> Value {
    json!({ "type": "subscribe_events", "event_type": "state_changed" })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_mapping() {
        assert_eq!(
            websocket_url("http://hub.local:8123").unwrap(),
            "ws://hub.local:8123/api/websocket"
        );
        assert_eq!(
            websocket_url("https://hub.example.com/").unwrap(),
            "wss://hub.example.com/api/websocket"
        );
        assert_eq!(
            websocket_url("http://proxy.local/hass/").unwrap(),
            "ws://proxy.local/hass/api/websocket"
        );
    }

    #[test]
    fn test_websocket_url_rejects_bad_input() {
        assert_eq!(websocket_url("  "), Err(HubError::HostRequired));
        assert!(matches!(
            websocket_url("ftp://hub.local"),
            Err(HubError::Protocol(_))
        ));
        assert!(matches!(
            websocket_url("not a url"),
            Err(HubError::Protocol(_))
        ));
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let err = map_ws_error(tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert_eq!(err, HubError::CannotConnect);
        assert!(err.is_retryable());
        assert_eq!(
            map_ws_error(tungstenite::Error::ConnectionClosed),
            HubError::ConnectionLost
        );
    }
}
