//! Mock home-automation hub for testing
//!
//! Serves the two endpoints the bridge talks to:
//! - `GET /api/websocket`: auth handshake, `get_states`, `subscribe_events`,
//!   `unsubscribe_events` and `state_changed` event pushes
//! - `POST /auth/token`: authorization-code and refresh-token grants

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Mock hub state
struct MockHubState {
    entities: HashMap<String, Value>,
    /// Access tokens the socket accepts
    valid_tokens: HashSet<String>,
    /// Authorization code → access token it exchanges for
    codes: HashMap<String, String>,
    /// Refresh token → access token it refreshes to
    refresh_tokens: HashMap<String, String>,
    connections: usize,
    rejected_auths: usize,
    /// Live `subscribe_events` subscriptions across all sockets
    active_subscriptions: usize,
}

type Shared = Arc<HubInner>;

struct HubInner {
    state: RwLock<MockHubState>,
    /// `new_state` payloads of every state change
    changes: broadcast::Sender<Value>,
    /// Fired to close every open socket
    kick: broadcast::Sender<()>,
}

/// Mock hub server
pub struct MockHubServer {
    addr: SocketAddr,
    shared: Shared,
    handle: JoinHandle<()>,
}

impl MockHubServer {
    /// Start a mock hub on a random port
    pub async fn start() -> Self {
        let (changes, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let shared = Arc::new(HubInner {
            state: RwLock::new(MockHubState {
                entities: HashMap::new(),
                valid_tokens: HashSet::new(),
                codes: HashMap::new(),
                refresh_tokens: HashMap::new(),
                connections: 0,
                rejected_auths: 0,
                active_subscriptions: 0,
            }),
            changes,
            kick,
        });

        let app = Router::new()
            .route("/api/websocket", get(handle_upgrade))
            .route("/auth/token", post(handle_token))
            .with_state(shared.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            shared,
            handle,
        }
    }

    /// Base URL, as a user would type it into the settings form
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Accept `token` on the WebSocket
    pub async fn add_token(&self, token: &str) {
        self.shared
            .state
            .write()
            .await
            .valid_tokens
            .insert(token.to_string());
    }

    /// Make `code` exchangeable at the token endpoint for `access_token`
    pub async fn issue_code(&self, code: &str, access_token: &str) {
        self.shared
            .state
            .write()
            .await
            .codes
            .insert(code.to_string(), access_token.to_string());
    }

    /// Set an entity state; subscribers receive a `state_changed` event
    pub async fn set_state(&self, entity_id: &str, state: &str, attributes: Value) {
        let now = chrono::Utc::now().to_rfc3339();
        let new_state = json!({
            "entity_id": entity_id,
            "state": state,
            "attributes": attributes,
            "last_changed": now,
            "last_updated": now,
        });
        self.shared
            .state
            .write()
            .await
            .entities
            .insert(entity_id.to_string(), new_state.clone());
        // No receivers just means no socket is subscribed yet
        let _ = self.shared.changes.send(new_state);
    }

    /// Close every open socket from the server side
    pub fn drop_connections(&self) {
        let _ = self.shared.kick.send(());
    }

    /// Successful authentications so far
    pub async fn connection_count(&self) -> usize {
        self.shared.state.read().await.connections
    }

    pub async fn rejected_auths(&self) -> usize {
        self.shared.state.read().await.rejected_auths
    }

    pub async fn active_subscriptions(&self) -> usize {
        self.shared.state.read().await.active_subscriptions
    }
}

impl Drop for MockHubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// =============================================================================
// Token endpoint
// =============================================================================

async fn handle_token(
    State(shared): State<Shared>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let grant = form.get("grant_type").map(String::as_str);
    let mut state = shared.state.write().await;

    let access_token = match grant {
        Some("authorization_code") => form
            .get("code")
            .and_then(|code| state.codes.remove(code)),
        Some("refresh_token") => form
            .get("refresh_token")
            .and_then(|refresh| state.refresh_tokens.get(refresh).cloned()),
        _ => None,
    };

    let Some(access_token) = access_token else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        )
            .into_response();
    };

    let refresh_token = format!("refresh-{}", access_token);
    state.valid_tokens.insert(access_token.clone());
    state
        .refresh_tokens
        .insert(refresh_token.clone(), access_token.clone());

    Json(json!({
        "access_token": access_token,
        "expires_in": 1800,
        "refresh_token": refresh_token,
        "token_type": "Bearer",
    }))
    .into_response()
}

// =============================================================================
// WebSocket API
// =============================================================================

async fn handle_upgrade(ws: WebSocketUpgrade, State(shared): State<Shared>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, shared))
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .is_ok()
}

async fn recv_json(socket: &mut WebSocket) -> Option<Value> {
    loop {
        match socket.recv().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(text.as_str()).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

enum Wake {
    Kick,
    Frame(Option<Value>),
    Change(Value),
}

async fn serve_socket(mut socket: WebSocket, shared: Shared) {
    if !send_json(
        &mut socket,
        json!({ "type": "auth_required", "ha_version": "2025.1.0" }),
    )
    .await
    {
        return;
    }

    let Some(auth) = recv_json(&mut socket).await else {
        return;
    };
    let token = auth["access_token"].as_str().unwrap_or_default().to_string();
    let accepted = auth["type"] == "auth" && shared.state.read().await.valid_tokens.contains(&token);
    if !accepted {
        shared.state.write().await.rejected_auths += 1;
        send_json(
            &mut socket,
            json!({ "type": "auth_invalid", "message": "Invalid access token or password" }),
        )
        .await;
        return;
    }
    shared.state.write().await.connections += 1;
    if !send_json(
        &mut socket,
        json!({ "type": "auth_ok", "ha_version": "2025.1.0" }),
    )
    .await
    {
        return;
    }

    let mut changes = shared.changes.subscribe();
    let mut kick = shared.kick.subscribe();
    let mut subscriptions: HashSet<u64> = HashSet::new();

    loop {
        let wake = tokio::select! {
            _ = kick.recv() => Wake::Kick,
            frame = recv_json(&mut socket) => Wake::Frame(frame),
            change = changes.recv() => match change {
                Ok(new_state) => Wake::Change(new_state),
                Err(_) => continue,
            },
        };

        match wake {
            Wake::Kick | Wake::Frame(None) => break,
            Wake::Change(new_state) => {
                for id in &subscriptions {
                    let event = json!({
                        "id": id,
                        "type": "event",
                        "event": {
                            "event_type": "state_changed",
                            "data": {
                                "entity_id": new_state["entity_id"],
                                "new_state": new_state,
                            },
                        },
                    });
                    if !send_json(&mut socket, event).await {
                        break;
                    }
                }
            }
            Wake::Frame(Some(msg)) => {
                let id = msg["id"].as_u64().unwrap_or_default();
                let reply = match msg["type"].as_str() {
                    Some("get_states") => {
                        let states: Vec<Value> =
                            shared.state.read().await.entities.values().cloned().collect();
                        json!({ "id": id, "type": "result", "success": true, "result": states })
                    }
                    Some("subscribe_events") => {
                        subscriptions.insert(id);
                        shared.state.write().await.active_subscriptions += 1;
                        json!({ "id": id, "type": "result", "success": true, "result": null })
                    }
                    Some("unsubscribe_events") => {
                        let target = msg["subscription"].as_u64().unwrap_or_default();
                        if subscriptions.remove(&target) {
                            shared.state.write().await.active_subscriptions -= 1;
                            json!({ "id": id, "type": "result", "success": true, "result": null })
                        } else {
                            json!({
                                "id": id,
                                "type": "result",
                                "success": false,
                                "error": { "code": "not_found", "message": "Subscription not found." },
                            })
                        }
                    }
                    Some("ping") => json!({ "id": id, "type": "pong" }),
                    other => json!({
                        "id": id,
                        "type": "result",
                        "success": false,
                        "error": { "code": "unknown_command", "message": format!("Unknown command {:?}", other) },
                    }),
                };
                if !send_json(&mut socket, reply).await {
                    break;
                }
            }
        }
    }

    let dropped = subscriptions.len();
    shared.state.write().await.active_subscriptions -= dropped;
    let _ = socket.send(Message::Close(None)).await;
}
