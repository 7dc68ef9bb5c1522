//! Shared fixture for module tests: mock hub, live connection, populated surface

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::ModuleContext;
use crate::auth::{AuthManager, AuthMethod};
use crate::bus::{create_bus, SharedBus};
use crate::connection::{ConnectionService, ConnectionSettings, RetryPolicy};
use crate::hub::mock::MockHub;
use crate::model::{AppConfig, ConfigurationModel};
use crate::store::{Store, DEFAULT_KEY_PREFIX};
use crate::surface::{InputDescriptor, MemorySurface};

pub(crate) const HUB_URL: &str = "http://hub.local";

pub(crate) struct Harness {
    pub ctx: ModuleContext,
    pub hub: MockHub,
    pub auth: AuthManager,
    pub bus: SharedBus,
    pub surface: Arc<MemorySurface>,
}

/// Inputs in page order: a kg weight field, a unit-less amount, a barcode
/// field and a free-text note
pub(crate) fn pantry_form() -> Vec<InputDescriptor> {
    vec![
        InputDescriptor::new("product_weight")
            .with_label("Weight")
            .with_hint("kg")
            .with_step("0.01")
            .in_form("purchase"),
        InputDescriptor::new("amount")
            .with_label("Amount")
            .in_form("purchase"),
        InputDescriptor::new("barcode")
            .with_label("Barcode")
            .in_form("purchase"),
        InputDescriptor::new("note").with_label("Note"),
    ]
}

/// Connected fixture with `modules` as the per-module settings
pub(crate) async fn harness(modules: Value) -> Harness {
    let store = Store::in_memory(DEFAULT_KEY_PREFIX);
    let hub = MockHub::new();
    let auth = AuthManager::new(store.clone(), Arc::new(hub.clone()), "http://app/", "http://app/");
    auth.create_static_auth(HUB_URL, "0123456789").await.unwrap();

    let model = Arc::new(ConfigurationModel::new(store, auth.clone()));
    let modules: BTreeMap<String, Value> = serde_json::from_value(modules).unwrap();
    model
        .update_config(AppConfig {
            hub_url: HUB_URL.to_string(),
            auth_method: Some(AuthMethod::LongLived),
            modules,
            ..Default::default()
        })
        .await
        .unwrap();

    let bus = create_bus();
    let connection = ConnectionService::new(
        Arc::new(hub.clone()),
        auth.clone(),
        bus.clone(),
        RetryPolicy::default(),
    );
    connection.configure(ConnectionSettings {
        hub_url: HUB_URL.to_string(),
        auth_method: Some(AuthMethod::LongLived),
    });
    assert!(connection.connect().await);

    let surface = Arc::new(MemorySurface::with_inputs(pantry_form()));
    Harness {
        ctx: ModuleContext {
            bus: bus.clone(),
            connection,
            model,
            surface: surface.clone(),
        },
        hub,
        auth,
        bus,
        surface,
    }
}

/// Let spawned listeners drain the bus
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
