//! Barcode scanner module
//!
//! Two states per input (Idle, Waiting) behind one global switch. Focusing an
//! input while the scanner is on arms it; a scan from the configured entity
//! is written verbatim into the armed input.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::targeting::{TargetState, TargetTable, Transition};
use super::{
    check_entity_id, ConfigField, ConfigSection, FeatureModule, FieldKind, ModuleContext,
    ModuleError, ModuleFactory, ModuleMetadata, ValidateConfig,
};
use crate::bus::{BusEvent, Hotkey, UiEvent};
use crate::connection::Unsubscribe;
use crate::hub::EntityMap;
use crate::surface::{Affordance, InputId};

pub const MODULE_ID: &str = "scanner";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScannerSettings {
    pub entity_id: String,
    /// Initial position of the global switch
    pub enabled: bool,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            entity_id: String::new(),
            enabled: true,
        }
    }
}

/// `(state, last_updated)` of the last delivery seen
type ScanKey = (String, Option<String>);

#[derive(Default)]
struct ScannerState {
    settings: ScannerSettings,
    enabled: bool,
    targets: TargetTable,
    /// Set while `subscribe` runs; the snapshot it delivers is a baseline
    snapshot_pending: bool,
    last_seen: Option<ScanKey>,
}

struct ScannerInner {
    ctx: ModuleContext,
    state: Mutex<ScannerState>,
    subscription: Mutex<Option<Unsubscribe>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    refresh: Notify,
    cancel: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScannerInner {
    fn state(&self) -> MutexGuard<'_, ScannerState> {
        lock(&self.state)
    }

    fn project(&self, transitions: &[Transition]) {
        for t in transitions {
            let affordance = match t.to {
                TargetState::Waiting => Affordance::Scanning,
                _ => Affordance::None,
            };
            self.ctx
                .surface
                .set_affordance(MODULE_ID, &t.input, affordance);
        }
    }

    fn on_focus(&self, input: &InputId) {
        let transitions = {
            let mut state = self.state();
            if !state.enabled {
                return;
            }
            state.targets.set_waiting(input)
        };
        self.project(&transitions);
    }

    fn on_blur(&self, input: &InputId) {
        let transition = self.state().targets.set_idle(input);
        self.project(&transition.into_iter().collect::<Vec<_>>());
    }

    fn on_hotkey(&self) {
        let focused = self.ctx.surface.focused();
        let transitions = {
            let mut state = self.state();
            match focused {
                Some(input) if state.enabled => {
                    if state.targets.state(&input) == TargetState::Waiting {
                        state.targets.set_idle(&input).into_iter().collect()
                    } else {
                        state.targets.set_waiting(&input)
                    }
                }
                focused => {
                    state.enabled = !state.enabled;
                    info!(
                        "Scanner {}",
                        if state.enabled { "enabled" } else { "disabled" }
                    );
                    if !state.enabled {
                        state.targets.reset_all()
                    } else if let Some(input) = focused {
                        state.targets.set_waiting(&input)
                    } else {
                        Vec::new()
                    }
                }
            }
        };
        self.project(&transitions);
    }

    fn on_entities(&self, entities: &EntityMap) {
        let (target, code) = {
            let mut state = self.state();
            let Some(entity) = entities.get(&state.settings.entity_id) else {
                return;
            };
            let key: ScanKey = (entity.state.clone(), entity.last_updated.clone());
            if state.snapshot_pending {
                state.last_seen = Some(key);
                debug!("Scanner baseline {:?}", entity.state);
                return;
            }
            if state.last_seen.as_ref() == Some(&key) {
                return;
            }
            state.last_seen = Some(key);
            if entity.is_unavailable() {
                return;
            }
            if !state.enabled {
                debug!("Scanner off; ignoring scan");
                return;
            }
            let Some(target) = state.targets.waiting() else {
                debug!("Scan with no armed input");
                return;
            };
            (target, entity.state.clone())
        };

        if !self.ctx.surface.write_value(&target, &code) {
            warn!("Could not write scan into {}", target);
        }
        let transition = self.state().targets.set_idle(&target);
        self.project(&transition.into_iter().collect::<Vec<_>>());

        info!("Scanned {:?} into {}", code, target);
        self.ctx.bus.publish(BusEvent::ValueWritten {
            module: MODULE_ID.to_string(),
            input: target,
            value: code,
        });
    }

    fn drop_subscription(&self) {
        let previous = lock(&self.subscription).take();
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    async fn resubscribe(self: &Arc<Self>) {
        self.drop_subscription();
        let entity_id = self.state().settings.entity_id.clone();
        if entity_id.is_empty() || self.cancel.is_cancelled() || !self.ctx.connection.is_connected()
        {
            return;
        }
        self.state().snapshot_pending = true;

        let weak = Arc::downgrade(self);
        let handle = self
            .ctx
            .connection
            .subscribe(
                &[entity_id.clone()],
                Arc::new(move |entities: &EntityMap| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_entities(entities);
                    }
                }),
            )
            .await;
        self.state().snapshot_pending = false;

        if self.cancel.is_cancelled() {
            handle.unsubscribe();
            return;
        }
        let replaced = lock(&self.subscription).replace(handle);
        if let Some(replaced) = replaced {
            replaced.unsubscribe();
        }
        debug!(entity_id = %entity_id, "Scanner subscribed");
    }

    async fn handle_event(self: &Arc<Self>, event: BusEvent) {
        match event {
            BusEvent::Ui(UiEvent::Focus { input }) => self.on_focus(&input),
            BusEvent::Ui(UiEvent::Blur { input }) => self.on_blur(&input),
            BusEvent::Ui(UiEvent::Hotkey {
                hotkey: Hotkey::ScannerToggle,
            }) => self.on_hotkey(),
            BusEvent::HubConnected => self.resubscribe().await,
            _ => {}
        }
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<BusEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.refresh.notified() => self.resubscribe().await,
                event = events.recv() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Scanner listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    fn apply_settings(&self, settings: ScannerSettings) {
        let (changed, transitions) = {
            let mut state = self.state();
            let changed = state.settings.entity_id != settings.entity_id;
            let transitions = if state.settings.enabled != settings.enabled {
                state.enabled = settings.enabled;
                if settings.enabled {
                    Vec::new()
                } else {
                    state.targets.reset_all()
                }
            } else {
                Vec::new()
            };
            state.settings = settings;
            (changed, transitions)
        };
        self.project(&transitions);
        if changed {
            self.refresh.notify_one();
        }
    }
}

pub struct ScannerModule {
    inner: Arc<ScannerInner>,
}

impl ScannerModule {
    pub fn new(ctx: ModuleContext) -> Self {
        let settings = ScannerSettings::default();
        Self {
            inner: Arc::new(ScannerInner {
                ctx,
                state: Mutex::new(ScannerState {
                    enabled: settings.enabled,
                    settings,
                    ..Default::default()
                }),
                subscription: Mutex::new(None),
                listener: Mutex::new(None),
                refresh: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.state().enabled
    }

    pub fn target_state(&self, input: &InputId) -> TargetState {
        self.inner.state().targets.state(input)
    }

    pub fn waiting_input(&self) -> Option<InputId> {
        self.inner.state().targets.waiting()
    }

    fn parse_settings(config: &Value) -> Result<ScannerSettings, ModuleError> {
        if config.is_null() {
            return Ok(ScannerSettings::default());
        }
        serde_json::from_value(config.clone()).map_err(|e| ModuleError::InvalidConfig {
            id: MODULE_ID.to_string(),
            errors: vec![e.to_string()],
        })
    }
}

impl ValidateConfig for ScannerModule {
    fn validate_config(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if config.is_null() {
            return errors;
        }
        if !config.is_object() {
            errors.push("scanner settings must be an object".to_string());
            return errors;
        }
        check_entity_id(config, &mut errors);
        if let Some(v) = config.get("enabled") {
            if !v.is_boolean() && !v.is_null() {
                errors.push("enabled must be true or false".to_string());
            }
        }
        errors
    }
}

#[async_trait]
impl FeatureModule for ScannerModule {
    fn id(&self) -> &str {
        MODULE_ID
    }

    async fn init(&self) -> Result<(), ModuleError> {
        let app = self.inner.ctx.model.config();
        if let Some(config) = app.module_config(MODULE_ID) {
            let errors = self.validate_config(config);
            if !errors.is_empty() {
                return Err(ModuleError::InvalidConfig {
                    id: MODULE_ID.to_string(),
                    errors,
                });
            }
            self.inner.apply_settings(Self::parse_settings(config)?);
        }

        let events = self.inner.ctx.bus.subscribe();
        let handle = tokio::spawn(self.inner.clone().run(events));
        *lock(&self.inner.listener) = Some(handle);

        self.inner.resubscribe().await;
        Ok(())
    }

    async fn destroy(&self) {
        self.inner.cancel.cancel();
        self.inner.drop_subscription();
        let transitions = self.inner.state().targets.reset_all();
        self.inner.project(&transitions);

        let listener = lock(&self.inner.listener).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!("Scanner listener ended abnormally: {}", e);
            }
        }
    }

    fn config_section(&self) -> ConfigSection {
        ConfigSection {
            module: MODULE_ID.to_string(),
            title: "Barcode scanner".to_string(),
            fields: vec![
                ConfigField::new("entityId", "Scanner entity", FieldKind::Entity)
                    .with_help("Entity whose state is the last scanned code"),
                ConfigField::new("enabled", "Scanner on at start", FieldKind::Toggle),
            ],
        }
    }

    fn load_config(&self, config: &Value) -> Result<(), ModuleError> {
        self.inner.apply_settings(Self::parse_settings(config)?);
        Ok(())
    }

    fn config(&self) -> Value {
        serde_json::to_value(self.inner.state().settings.clone()).unwrap_or_default()
    }

    fn validator(&self) -> Option<&dyn ValidateConfig> {
        Some(self)
    }
}

pub struct ScannerFactory;

impl ModuleFactory for ScannerFactory {
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            id: MODULE_ID.to_string(),
            display_name: "Barcode scanner".to_string(),
            description: "Types scanned barcodes into the focused input".to_string(),
        }
    }

    fn create(&self, ctx: ModuleContext) -> Arc<dyn FeatureModule> {
        Arc::new(ScannerModule::new(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::EntityState;
    use crate::modules::test_support::{harness, settle, Harness};
    use crate::surface::InputSurface;
    use serde_json::json;

    const ENTITY: &str = "sensor.barcode_reader";

    fn scan(code: &str, at: &str) -> EntityState {
        EntityState::new(ENTITY, code).with_last_updated(at)
    }

    async fn scanner(settings: Value) -> (Harness, ScannerModule) {
        let h = harness(json!({ "scanner": settings })).await;
        h.hub.set_entity(scan("4006381333931", "2026-01-01T00:00:00Z"));
        let module = ScannerModule::new(h.ctx.clone());
        module.init().await.unwrap();
        (h, module)
    }

    fn focus(h: &Harness, input: &str) {
        let input = InputId::new(input);
        h.surface.set_focus(Some(&input));
        h.bus.publish(BusEvent::Ui(UiEvent::Focus { input }));
    }

    fn hotkey() -> BusEvent {
        BusEvent::Ui(UiEvent::Hotkey {
            hotkey: Hotkey::ScannerToggle,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_written_verbatim_into_focused_input() {
        let (h, module) = scanner(json!({ "entityId": ENTITY })).await;
        let barcode = InputId::new("barcode");
        // Snapshot is a baseline only
        assert_eq!(h.surface.value(&barcode).as_deref(), Some(""));

        focus(&h, "barcode");
        settle().await;
        assert_eq!(module.target_state(&barcode), TargetState::Waiting);
        assert_eq!(h.surface.affordance(MODULE_ID, &barcode), Affordance::Scanning);

        h.hub.push_state(scan("5000112637922", "2026-01-01T00:00:05Z"));
        assert_eq!(h.surface.value(&barcode).as_deref(), Some("5000112637922"));
        assert_eq!(module.target_state(&barcode), TargetState::Idle);
        assert_eq!(h.surface.affordance(MODULE_ID, &barcode), Affordance::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_scan_written_when_hub_had_no_snapshot() {
        let h = harness(json!({ "scanner": { "entityId": ENTITY } })).await;
        let module = ScannerModule::new(h.ctx.clone());
        module.init().await.unwrap();
        let barcode = InputId::new("barcode");

        focus(&h, "barcode");
        settle().await;
        assert_eq!(module.target_state(&barcode), TargetState::Waiting);

        h.hub.push_state(scan("5000112637922", "2026-01-01T00:00:05Z"));
        assert_eq!(h.surface.value(&barcode).as_deref(), Some("5000112637922"));
        assert_eq!(module.target_state(&barcode), TargetState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_keeps_surrounding_whitespace() {
        let (h, _module) = scanner(json!({ "entityId": ENTITY })).await;
        let barcode = InputId::new("barcode");
        focus(&h, "barcode");
        settle().await;

        h.hub.push_state(scan(" 5000112637922\t", "2026-01-01T00:00:07Z"));
        assert_eq!(h.surface.value(&barcode).as_deref(), Some(" 5000112637922\t"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_or_unavailable_scans_are_skipped() {
        let (h, _module) = scanner(json!({ "entityId": ENTITY })).await;
        let barcode = InputId::new("barcode");
        focus(&h, "barcode");
        settle().await;

        // Same state and timestamp as the baseline
        h.hub.push_state(scan("4006381333931", "2026-01-01T00:00:00Z"));
        h.hub.push_state(scan("unavailable", "2026-01-01T00:00:01Z"));
        assert!(h.surface.events(&barcode).is_empty());

        // Same code scanned again later is a new scan
        h.hub.push_state(scan("4006381333931", "2026-01-01T00:00:02Z"));
        assert_eq!(h.surface.value(&barcode).as_deref(), Some("4006381333931"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_off_means_no_waiting_and_no_write() {
        let (h, module) = scanner(json!({ "entityId": ENTITY, "enabled": false })).await;
        assert!(!module.is_enabled());

        for input in ["barcode", "amount", "note"] {
            focus(&h, input);
            settle().await;
            assert_eq!(module.target_state(&InputId::new(input)), TargetState::Idle);
        }
        h.hub.push_state(scan("123", "2026-01-01T00:00:09Z"));
        assert!(h.surface.events(&InputId::new("note")).is_empty());
        assert_eq!(module.waiting_input(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hotkey_toggles_input_then_feature() {
        let (h, module) = scanner(json!({ "entityId": ENTITY })).await;
        let barcode = InputId::new("barcode");
        focus(&h, "barcode");
        settle().await;

        // Focused and enabled: toggles the input
        h.bus.publish(hotkey());
        settle().await;
        assert_eq!(module.target_state(&barcode), TargetState::Idle);
        h.bus.publish(hotkey());
        settle().await;
        assert_eq!(module.target_state(&barcode), TargetState::Waiting);

        // Nothing focused: toggles the feature and clears marks
        h.surface.set_focus(None);
        h.bus.publish(hotkey());
        settle().await;
        assert!(!module.is_enabled());
        assert_eq!(module.target_state(&barcode), TargetState::Idle);
        assert_eq!(h.surface.affordance(MODULE_ID, &barcode), Affordance::None);

        h.bus.publish(hotkey());
        settle().await;
        assert!(module.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blur_disarms() {
        let (h, module) = scanner(json!({ "entityId": ENTITY })).await;
        let barcode = InputId::new("barcode");
        focus(&h, "barcode");
        focus(&h, "note");
        settle().await;
        assert_eq!(module.waiting_input(), Some(InputId::new("note")));
        assert_eq!(module.target_state(&barcode), TargetState::Idle);

        h.bus.publish(BusEvent::Ui(UiEvent::Blur {
            input: InputId::new("note"),
        }));
        settle().await;
        assert_eq!(module.waiting_input(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_unsubscribes() {
        let (h, module) = scanner(json!({ "entityId": ENTITY })).await;
        assert_eq!(h.hub.active_subscriptions(), 1);
        focus(&h, "barcode");
        settle().await;

        module.destroy().await;
        assert_eq!(h.hub.active_subscriptions(), 0);
        assert_eq!(
            h.surface.affordance(MODULE_ID, &InputId::new("barcode")),
            Affordance::None
        );
    }

    #[tokio::test]
    async fn test_validator() {
        let h = harness(json!({})).await;
        let module = ScannerModule::new(h.ctx.clone());
        assert!(module
            .validate_config(&json!({"entityId": ENTITY, "enabled": false}))
            .is_empty());
        assert_eq!(module.validate_config(&json!({"entityId": "Barcode"})).len(), 1);
        assert_eq!(module.validate_config(&json!({"enabled": "no"})).len(), 1);
        assert_eq!(module.validate_config(&json!([1, 2])).len(), 1);
    }
}
