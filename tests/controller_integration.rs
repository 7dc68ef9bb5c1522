//! Controller integration tests over the in-process mock hub
//!
//! Each test wires a real Controller (store, auth, model, connection service,
//! registry and both feature modules) to a MockHub and a MemorySurface, then
//! drives it the way the page would: boot, OAuth callback, settings form, UI
//! events on the bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use pantry_hub_bridge::auth::{AuthManager, AuthMethod};
use pantry_hub_bridge::bus::{BusEvent, NotificationLevel, UiEvent};
use pantry_hub_bridge::connection::ConnectionStatus;
use pantry_hub_bridge::controller::{Controller, ControllerOptions};
use pantry_hub_bridge::hub::error::HubError;
use pantry_hub_bridge::hub::mock::MockHub;
use pantry_hub_bridge::hub::oauth::{encode_state, OAuthState};
use pantry_hub_bridge::hub::EntityState;
use pantry_hub_bridge::model::{AppConfig, ConfigurationModel};
use pantry_hub_bridge::store::{Store, DEFAULT_KEY_PREFIX};
use pantry_hub_bridge::surface::{InputDescriptor, InputId, InputSurface, MemorySurface};
use serde_json::json;
use tokio::sync::broadcast;
use url::Url;

const HUB_URL: &str = "http://homeassistant.local:8123";
const SCALE_ENTITY: &str = "sensor.kitchen_scale";
const SCANNER_ENTITY: &str = "sensor.barcode_scanner";
const TOKEN: &str = "llat-0123456789";

struct Fixture {
    controller: Controller,
    hub: MockHub,
    store: Store,
    surface: Arc<MemorySurface>,
}

fn purchase_form() -> Vec<InputDescriptor> {
    vec![
        InputDescriptor::new("product_weight")
            .with_label("Weight")
            .with_hint("kg")
            .with_step("0.01")
            .in_form("purchase"),
        InputDescriptor::new("barcode")
            .with_label("Barcode")
            .in_form("purchase"),
    ]
}

fn fixture_with(store: Store, initial_hub_url: Option<&str>) -> Fixture {
    let hub = MockHub::new();
    hub.set_entity(
        EntityState::new(SCALE_ENTITY, "0").with_attribute("is_stable", true),
    );
    hub.set_entity(EntityState::new(SCANNER_ENTITY, "idle"));
    let surface = Arc::new(MemorySurface::with_inputs(purchase_form()));

    let mut options = ControllerOptions::new(Arc::new(hub.clone()), store.clone(), surface.clone());
    options.initial_hub_url = initial_hub_url.map(str::to_string);
    Fixture {
        controller: Controller::new(options),
        hub,
        store,
        surface,
    }
}

/// Store already holding a complete long-lived configuration
async fn configured_store(modules_enabled: &[&str]) -> Store {
    let store = Store::in_memory(DEFAULT_KEY_PREFIX);
    let auth = AuthManager::new(
        store.clone(),
        Arc::new(MockHub::new()),
        "http://localhost:8765/",
        "http://localhost:8765/?auth_callback=1",
    );
    auth.create_static_auth(HUB_URL, TOKEN).await.unwrap();

    let model = ConfigurationModel::new(store.clone(), auth);
    model
        .update_config(AppConfig {
            hub_url: HUB_URL.to_string(),
            auth_method: Some(AuthMethod::LongLived),
            modules_enabled: modules_enabled
                .iter()
                .map(|id| (id.to_string(), true))
                .collect(),
            modules: serde_json::from_value(json!({
                "scale": { "entityId": SCALE_ENTITY },
                "scanner": { "entityId": SCANNER_ENTITY }
            }))
            .unwrap(),
            ..Default::default()
        })
        .await
        .unwrap();
    store
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn drain(rx: &mut broadcast::Receiver<BusEvent>) -> Vec<BusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn notifications(events: &[BusEvent], wanted: NotificationLevel) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            BusEvent::Notification { level, message } if *level == wanted => {
                Some(message.clone())
            }
            _ => None,
        })
        .collect()
}

// =============================================================================
// Boot
// =============================================================================

#[tokio::test(start_paused = true)]
async fn initialize_with_complete_config_connects_and_enables_modules() {
    let f = fixture_with(configured_store(&["scale"]).await, None);

    let cleaned = f.controller.initialize(None).await.unwrap();
    assert_eq!(cleaned, None);
    settle().await;

    assert!(f.controller.connection().is_connected());
    assert_eq!(f.hub.connected_tokens(), vec![TOKEN.to_string()]);
    assert!(f.controller.registry().is_enabled("scale").await);
    assert!(!f.controller.registry().is_enabled("scanner").await);
    assert_eq!(
        f.controller.model().connection_state().status,
        ConnectionStatus::Ready
    );
    // One upstream subscription for the scale entity
    assert_eq!(f.hub.active_subscriptions(), 1);

    f.controller.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn initialize_twice_is_a_noop() {
    let f = fixture_with(configured_store(&["scale"]).await, None);

    f.controller.initialize(None).await.unwrap();
    f.controller.initialize(None).await.unwrap();
    settle().await;

    assert_eq!(f.hub.connect_attempts().len(), 1);
    assert_eq!(f.hub.active_subscriptions(), 1);

    f.controller.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn incomplete_config_seeds_hub_url_without_connecting() {
    let store = Store::in_memory(DEFAULT_KEY_PREFIX);
    let f = fixture_with(store, Some("http://pantry-hub.local:8123/"));

    f.controller.initialize(None).await.unwrap();
    settle().await;

    assert_eq!(f.controller.model().config().hub_url, "http://pantry-hub.local:8123");
    assert!(!f.controller.model().is_config_complete().await);
    assert!(f.hub.connect_attempts().is_empty());
    assert!(!f.controller.connection().is_connected());

    f.controller.destroy().await;
}

// =============================================================================
// OAuth callback
// =============================================================================

fn callback_url(code: Option<&str>) -> Url {
    let state = encode_state(&OAuthState {
        hub_url: HUB_URL.to_string(),
        client_id: "http://localhost:8765/".to_string(),
    });
    let mut params = vec![("tab", "stock"), ("auth_callback", "1"), ("state", state.as_str())];
    if let Some(code) = code {
        params.push(("code", code));
    }
    Url::parse_with_params("http://localhost:8765/", &params).unwrap()
}

#[tokio::test(start_paused = true)]
async fn oauth_callback_stores_delegated_auth_and_cleans_url() {
    let f = fixture_with(Store::in_memory(DEFAULT_KEY_PREFIX), None);
    let mut rx = f.controller.bus().subscribe();

    let url = callback_url(Some("abc123"));
    let cleaned = f.controller.initialize(Some(&url)).await.unwrap();
    settle().await;

    assert_eq!(
        cleaned.map(|u| u.to_string()).as_deref(),
        Some("http://localhost:8765/?tab=stock")
    );

    let config = f.controller.model().config();
    assert_eq!(config.hub_url, HUB_URL);
    assert_eq!(config.auth_method, Some(AuthMethod::Delegated));
    assert!(f.controller.auth().has_delegated_auth().await);

    assert!(f.controller.connection().is_connected());
    assert_eq!(f.hub.connected_tokens(), vec!["access-abc123".to_string()]);

    let events = drain(&mut rx);
    assert_eq!(notifications(&events, NotificationLevel::Success).len(), 1);
    assert!(notifications(&events, NotificationLevel::Error).is_empty());

    f.controller.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn failed_code_exchange_reports_error_and_still_cleans_url() {
    let f = fixture_with(Store::in_memory(DEFAULT_KEY_PREFIX), None);
    f.hub.fail_next_auth([HubError::InvalidAuth]);
    let mut rx = f.controller.bus().subscribe();

    let url = callback_url(Some("expired"));
    let cleaned = f.controller.initialize(Some(&url)).await.unwrap();
    settle().await;

    assert_eq!(
        cleaned.map(|u| u.to_string()).as_deref(),
        Some("http://localhost:8765/?tab=stock")
    );
    assert_eq!(f.controller.model().config().auth_method, None);
    assert!(!f.controller.auth().has_delegated_auth().await);
    assert!(f.hub.connect_attempts().is_empty());

    let events = drain(&mut rx);
    assert_eq!(notifications(&events, NotificationLevel::Error).len(), 1);

    f.controller.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn callback_without_code_is_an_error() {
    let f = fixture_with(Store::in_memory(DEFAULT_KEY_PREFIX), None);
    let mut rx = f.controller.bus().subscribe();

    let url = callback_url(None);
    let cleaned = f.controller.initialize(Some(&url)).await.unwrap();

    assert!(cleaned.is_some());
    assert_eq!(f.hub.get_auth_calls(), 0);
    let events = drain(&mut rx);
    assert_eq!(notifications(&events, NotificationLevel::Error).len(), 1);

    f.controller.destroy().await;
}

// =============================================================================
// Settings form
// =============================================================================

#[tokio::test(start_paused = true)]
async fn config_saved_on_bus_persists_and_connects() {
    let f = fixture_with(Store::in_memory(DEFAULT_KEY_PREFIX), None);
    f.controller.initialize(None).await.unwrap();
    let mut rx = f.controller.bus().subscribe();

    let mut modules_enabled = BTreeMap::new();
    modules_enabled.insert("scanner".to_string(), true);
    f.controller.bus().publish(BusEvent::ConfigSaved {
        config: AppConfig {
            hub_url: format!("{}/", HUB_URL),
            auth_method: Some(AuthMethod::LongLived),
            modules_enabled,
            modules: serde_json::from_value(json!({
                "scanner": { "entityId": SCANNER_ENTITY }
            }))
            .unwrap(),
            long_lived_token: Some(TOKEN.to_string()),
        },
    });
    settle().await;

    let config = f.controller.model().config();
    assert_eq!(config.hub_url, HUB_URL);
    assert_eq!(config.long_lived_token, None);
    assert_eq!(
        f.controller.auth().stored_static_token().await.as_deref(),
        Some(TOKEN)
    );
    // The token never lands inside the persisted configuration blobs
    for key in f.store.keys().await {
        if key.ends_with("long_lived_token") {
            continue;
        }
        let raw = f.store.get(&key).await;
        assert!(!raw.unwrap_or_default().contains(TOKEN), "token leaked into {}", key);
    }

    assert!(f.controller.connection().is_connected());
    assert!(f.controller.registry().is_enabled("scanner").await);

    let events = drain(&mut rx);
    assert!(notifications(&events, NotificationLevel::Success)
        .iter()
        .any(|m| m == "Settings saved"));

    f.controller.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn disabling_a_module_via_settings_drops_its_subscription() {
    let f = fixture_with(configured_store(&["scale", "scanner"]).await, None);
    f.controller.initialize(None).await.unwrap();
    settle().await;
    assert_eq!(f.hub.active_subscriptions(), 2);

    let mut config = f.controller.model().config();
    config.modules_enabled.insert("scale".to_string(), false);
    f.controller.bus().publish(BusEvent::ConfigSaved { config });
    settle().await;

    assert!(!f.controller.registry().is_enabled("scale").await);
    assert!(f.controller.registry().is_enabled("scanner").await);
    assert_eq!(f.hub.active_subscriptions(), 1);

    f.controller.destroy().await;
}

// =============================================================================
// Module flows through the controller
// =============================================================================

#[tokio::test(start_paused = true)]
async fn scale_reading_lands_in_cleared_input() {
    let f = fixture_with(configured_store(&["scale"]).await, None);
    f.controller.initialize(None).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let weight = InputId::new("product_weight");
    f.controller.bus().publish(BusEvent::ClearInput {
        module: "scale".to_string(),
        input: weight.clone(),
    });
    settle().await;

    f.hub.push_state(
        EntityState::new(SCALE_ENTITY, "1234").with_attribute("is_stable", true),
    );
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(f.surface.value(&weight).as_deref(), Some("1.23"));

    f.controller.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn scanner_writes_code_into_focused_input() {
    let f = fixture_with(configured_store(&["scanner"]).await, None);
    f.controller.initialize(None).await.unwrap();
    settle().await;

    let barcode = InputId::new("barcode");
    f.surface.set_focus(Some(&barcode));
    f.controller
        .bus()
        .publish(BusEvent::Ui(UiEvent::Focus { input: barcode.clone() }));
    settle().await;

    f.hub.push_state(EntityState::new(SCANNER_ENTITY, "4006381333931"));
    settle().await;

    assert_eq!(f.surface.value(&barcode).as_deref(), Some("4006381333931"));

    f.controller.destroy().await;
}

// =============================================================================
// Teardown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn destroy_is_idempotent_and_releases_everything() {
    let f = fixture_with(configured_store(&["scale", "scanner"]).await, None);
    f.controller.initialize(None).await.unwrap();
    settle().await;
    let mut rx = f.controller.bus().subscribe();

    f.controller.destroy().await;
    f.controller.destroy().await;

    assert!(!f.controller.connection().is_connected());
    assert!(f.controller.registry().active_modules().await.is_empty());
    assert_eq!(f.hub.active_subscriptions(), 0);
    assert_eq!(f.controller.model().observer_count(), 0);

    let shutdowns = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, BusEvent::ShuttingDown { .. }))
        .count();
    assert_eq!(shutdowns, 1);
}
