//! WebSocket transport tests against a mock hub on a local port
//!
//! Covers the handshake, state snapshot, change streaming, unsubscribe,
//! server-side disconnects with automatic re-subscription, the OAuth token
//! endpoint, and one full controller run over the real transport.

mod mock_servers;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use mock_servers::MockHubServer;
use pantry_hub_bridge::auth::{AuthManager, AuthMethod};
use pantry_hub_bridge::bus::{BusEvent, UiEvent};
use pantry_hub_bridge::controller::{Controller, ControllerOptions};
use pantry_hub_bridge::hub::websocket::WsHub;
use pantry_hub_bridge::hub::{
    AuthOptions, EntityState, Hub, HubAuth, HubConnection, HubError, HubSubscription,
    LifecycleEvent, StateSink, TokenBundle,
};
use pantry_hub_bridge::model::{AppConfig, ConfigurationModel};
use pantry_hub_bridge::store::{Store, DEFAULT_KEY_PREFIX};
use pantry_hub_bridge::surface::{InputDescriptor, InputId, InputSurface, MemorySurface};
use serde_json::json;
use tokio::time::{sleep, timeout, Instant};

const SCALE: &str = "sensor.kitchen_scale";
const SCANNER: &str = "sensor.barcode_scanner";
const TOKEN: &str = "llat-test-token";
const WAIT: Duration = Duration::from_secs(5);

fn collecting_sink() -> (StateSink, Arc<Mutex<Vec<EntityState>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink_received = received.clone();
    let sink: StateSink = Arc::new(move |state| sink_received.lock().unwrap().push(state));
    (sink, received)
}

/// Poll `check` until it holds or the deadline passes
async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn wait_for_subscriptions(server: &MockHubServer, expected: usize) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if server.active_subscriptions().await == expected {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "expected {} hub subscriptions, server reports {}",
        expected,
        server.active_subscriptions().await
    );
}

async fn connect(server: &MockHubServer) -> Arc<dyn HubConnection> {
    server.add_token(TOKEN).await;
    let hub = WsHub::new();
    let auth = hub.long_lived_auth(&server.url(), TOKEN);
    match hub.create_connection(auth).await {
        Ok(connection) => connection,
        Err(e) => panic!("connect failed: {}", e),
    }
}

// =============================================================================
// Transport
// =============================================================================

#[tokio::test]
async fn long_lived_connection_fetches_and_streams_states() {
    let server = MockHubServer::start().await;
    server.set_state(SCALE, "0", json!({ "unit_of_measurement": "g" })).await;
    server.set_state("sensor.other", "12", json!({})).await;

    let connection = connect(&server).await;
    assert!(connection.is_open());
    assert_eq!(server.connection_count().await, 1);

    let states = connection.fetch_states().await.unwrap();
    let scale = states.iter().find(|s| s.entity_id == SCALE).unwrap();
    assert_eq!(scale.state, "0");
    assert_eq!(scale.attribute_str("unit_of_measurement"), Some("g"));

    let (sink, received) = collecting_sink();
    let _subscription = connection
        .subscribe_state_changes(&[SCALE.to_string()], sink)
        .await
        .unwrap();
    wait_for_subscriptions(&server, 1).await;

    server.set_state("sensor.other", "13", json!({})).await;
    server
        .set_state(SCALE, "1234", json!({ "unit_of_measurement": "g", "is_stable": true }))
        .await;
    wait_until("scale change", || !received.lock().unwrap().is_empty()).await;

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 1, "only the watched entity is delivered");
    assert_eq!(received[0].state, "1234");
    assert!(received[0].last_updated.is_some());

    connection.close();
}

#[tokio::test]
async fn rejected_token_fails_with_invalid_auth() {
    let server = MockHubServer::start().await;
    let hub = WsHub::new();
    let auth = hub.long_lived_auth(&server.url(), "not-a-valid-token");

    match hub.create_connection(auth).await {
        Err(HubError::InvalidAuth) => {}
        Err(other) => panic!("expected InvalidAuth, got {}", other),
        Ok(_) => panic!("hub accepted an unknown token"),
    }
    assert_eq!(server.rejected_auths().await, 1);
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn unreachable_hub_is_retryable() {
    let hub = WsHub::new();
    // Port 1 on loopback refuses connections
    let auth = hub.long_lived_auth("http://127.0.0.1:1", TOKEN);
    match hub.create_connection(auth).await {
        Err(e) => assert!(e.is_retryable(), "{} should be retryable", e),
        Ok(_) => panic!("connected to a closed port"),
    }
}

#[tokio::test]
async fn cancelling_a_subscription_unsubscribes_upstream() {
    let server = MockHubServer::start().await;
    let connection = connect(&server).await;

    let (sink, received) = collecting_sink();
    let subscription = connection
        .subscribe_state_changes(&[SCALE.to_string()], sink)
        .await
        .unwrap();
    wait_for_subscriptions(&server, 1).await;

    subscription.cancel().unwrap();
    // Cancelling twice is harmless
    subscription.cancel().unwrap();
    wait_for_subscriptions(&server, 0).await;

    server.set_state(SCALE, "500", json!({})).await;
    sleep(Duration::from_millis(100)).await;
    assert!(received.lock().unwrap().is_empty());

    connection.close();
}

#[tokio::test]
async fn server_disconnect_reconnects_and_restores_subscriptions() {
    let server = MockHubServer::start().await;
    let connection = connect(&server).await;
    let mut lifecycle = connection.lifecycle();

    let (sink, received) = collecting_sink();
    let _subscription = connection
        .subscribe_state_changes(&[SCALE.to_string()], sink)
        .await
        .unwrap();
    wait_for_subscriptions(&server, 1).await;

    server.drop_connections();

    let event = timeout(WAIT, lifecycle.recv()).await.unwrap().unwrap();
    assert!(matches!(event, LifecycleEvent::Disconnected));
    let event = timeout(WAIT, lifecycle.recv()).await.unwrap().unwrap();
    assert!(matches!(event, LifecycleEvent::Ready));
    assert!(connection.is_open());
    assert_eq!(server.connection_count().await, 2);
    wait_for_subscriptions(&server, 1).await;

    server.set_state(SCALE, "750", json!({})).await;
    wait_until("change after reconnect", || !received.lock().unwrap().is_empty()).await;
    assert_eq!(received.lock().unwrap()[0].state, "750");

    connection.close();
}

// =============================================================================
// OAuth token endpoint
// =============================================================================

fn options(server: &MockHubServer, code: Option<&str>) -> AuthOptions {
    AuthOptions {
        hub_url: server.url(),
        client_id: "http://localhost:8765/".to_string(),
        redirect_uri: "http://localhost:8765/?auth_callback=1".to_string(),
        auth_code: code.map(str::to_string),
        load_tokens: None,
        save_tokens: None,
    }
}

#[tokio::test]
async fn authorization_code_exchange_saves_tokens() {
    let server = MockHubServer::start().await;
    server.issue_code("abc", "access-abc").await;

    let saved: Arc<Mutex<Vec<TokenBundle>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = saved.clone();
    let mut opts = options(&server, Some("abc"));
    opts.save_tokens = Some(Arc::new(move |tokens: Option<TokenBundle>| {
        let sink = sink.clone();
        async move {
            if let Some(tokens) = tokens {
                sink.lock().unwrap().push(tokens);
            }
        }
        .boxed()
    }));

    let hub = WsHub::new();
    let auth = hub.get_auth(opts).await.unwrap();
    assert_eq!(auth.access_token().await.unwrap(), "access-abc");

    let saved = saved.lock().unwrap().clone();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].refresh_token.as_deref(), Some("refresh-access-abc"));
    assert_eq!(saved[0].expires_in, 1800);

    // The issued token opens the socket
    let connection = hub.create_connection(auth).await.unwrap();
    assert!(connection.is_open());
    connection.close();
}

#[tokio::test]
async fn unknown_code_is_rejected() {
    let server = MockHubServer::start().await;
    let hub = WsHub::new();
    match hub.get_auth(options(&server, Some("never-issued"))).await {
        Err(HubError::InvalidAuth) => {}
        Err(other) => panic!("expected InvalidAuth, got {}", other),
        Ok(_) => panic!("unknown code was accepted"),
    }
}

#[tokio::test]
async fn expired_stored_tokens_are_refreshed() {
    let server = MockHubServer::start().await;
    server.issue_code("seed", "access-seed").await;
    let hub = WsHub::new();
    let seeded = hub.get_auth(options(&server, Some("seed"))).await.unwrap();
    let mut stale = seeded.token_bundle().await.unwrap();
    stale.access_token = "stale".to_string();
    stale.expires = 0;

    let mut opts = options(&server, None);
    opts.load_tokens = Some(Arc::new(move || {
        let stale = stale.clone();
        async move { Some(stale) }.boxed()
    }));

    let auth = hub.get_auth(opts).await.unwrap();
    assert_eq!(auth.access_token().await.unwrap(), "access-seed");
}

#[tokio::test]
async fn missing_tokens_require_authorization() {
    let server = MockHubServer::start().await;
    let hub = WsHub::new();
    match hub.get_auth(options(&server, None)).await {
        Err(HubError::AuthorizationRequired { authorize_url }) => {
            assert!(authorize_url.starts_with(&format!("{}/auth/authorize?", server.url())));
        }
        Err(other) => panic!("expected AuthorizationRequired, got {}", other),
        Ok(_) => panic!("authorized without tokens"),
    }
}

// =============================================================================
// Controller over the real transport
// =============================================================================

#[tokio::test]
async fn controller_writes_scanned_code_over_websocket() {
    let server = MockHubServer::start().await;
    server.add_token(TOKEN).await;
    server.set_state(SCANNER, "idle", json!({})).await;

    let store = Store::in_memory(DEFAULT_KEY_PREFIX);
    let hub: Arc<WsHub> = Arc::new(WsHub::new());
    let auth = AuthManager::new(
        store.clone(),
        hub.clone(),
        "http://localhost:8765/",
        "http://localhost:8765/?auth_callback=1",
    );
    auth.create_static_auth(&server.url(), TOKEN).await.unwrap();
    ConfigurationModel::new(store.clone(), auth)
        .update_config(AppConfig {
            hub_url: server.url(),
            auth_method: Some(AuthMethod::LongLived),
            modules_enabled: [("scanner".to_string(), true)].into_iter().collect(),
            modules: serde_json::from_value(json!({ "scanner": { "entityId": SCANNER } }))
                .unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();

    let barcode = InputId::new("barcode");
    let surface = Arc::new(MemorySurface::with_inputs([
        InputDescriptor::new("barcode").with_label("Barcode"),
    ]));
    let controller = Controller::new(ControllerOptions::new(hub, store, surface.clone()));
    controller.initialize(None).await.unwrap();

    let connection = controller.connection().clone();
    wait_until("controller connected", || connection.is_connected()).await;
    wait_for_subscriptions(&server, 1).await;

    surface.set_focus(Some(&barcode));
    controller
        .bus()
        .publish(BusEvent::Ui(UiEvent::Focus { input: barcode.clone() }));
    sleep(Duration::from_millis(50)).await;

    server.set_state(SCANNER, "4006381333931", json!({})).await;
    wait_until("scanned code written", || {
        surface.value(&barcode).as_deref() == Some("4006381333931")
    })
    .await;

    controller.destroy().await;
    wait_for_subscriptions(&server, 0).await;
}
