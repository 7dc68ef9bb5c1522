//! Scale module
//!
//! Writes stable weight readings from one hub entity into the targeted input.
//!
//! ```text
//!            clear-input / hotkey / first focus           stable weight
//!   Idle ───────────────────────────────────────► Waiting ────────────► Fulfilled
//!    ▲                                               │                      │
//!    │   keystroke, paste, blur of an auto target,   │                      │
//!    ├───────────── hotkey on the waiting input ◄────┘                      │
//!    └──────────────── success toast (+1.5 s), form reset, destroy ◄────────┘
//! ```
//!
//! Readings arrive as `{weight, is_stable}` entity updates. Stable ones are
//! coalesced through a short debounce window before being applied, so a
//! sensor that flaps between stable and unstable writes once.

pub mod units;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use super::targeting::{TargetState, TargetTable, Transition};
use super::{
    check_entity_id, ConfigField, ConfigSection, FeatureModule, FieldKind, ModuleContext,
    ModuleError, ModuleFactory, ModuleMetadata, ValidateConfig,
};
use crate::bus::{BusEvent, Hotkey, UiEvent};
use crate::connection::Unsubscribe;
use crate::hub::{EntityMap, EntityState};
use crate::surface::{Affordance, InputId};
use units::{DEFAULT_PRECISION, MAX_PRECISION};

pub const MODULE_ID: &str = "scale";

/// Window a stable reading must survive before it is applied
pub const STABLE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Delay between a success toast and fulfilled inputs returning to idle
pub const SUCCESS_RESET_DELAY: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScaleSettings {
    pub entity_id: String,
    pub default_precision: u32,
    /// Target a weight input when it is focused for the first time
    pub auto_target: bool,
}

impl Default for ScaleSettings {
    fn default() -> Self {
        Self {
            entity_id: String::new(),
            default_precision: DEFAULT_PRECISION,
            auto_target: true,
        }
    }
}

/// One decoded scale update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleReading {
    pub grams: f64,
    pub is_stable: bool,
}

fn flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Some(true),
            "false" | "off" | "no" | "0" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// Decode a scale entity: numeric state, optional `is_stable`/`stable`
/// attribute (absent means stable) and optional `unit_of_measurement`.
pub fn parse_reading(state: &EntityState) -> Option<ScaleReading> {
    if state.is_unavailable() {
        return None;
    }
    let raw: f64 = state.state.trim().parse().ok()?;
    if !raw.is_finite() {
        return None;
    }
    let is_stable = ["is_stable", "stable"]
        .iter()
        .find_map(|key| state.attributes.get(*key).and_then(flag))
        .unwrap_or(true);
    Some(ScaleReading {
        grams: units::to_grams(raw, state.attribute_str("unit_of_measurement")),
        is_stable,
    })
}

/// Latest sensor figures, all weights in grams
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScaleRuntime {
    pub last_weight: Option<f64>,
    /// Last weight written into an input; reset whenever a new target is set
    pub last_stable_weight: Option<f64>,
    pub is_stable: bool,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ScaleTimer {
    StableWeight,
    SuccessReset,
}

#[derive(Default)]
struct ScaleState {
    settings: ScaleSettings,
    runtime: ScaleRuntime,
    targets: TargetTable,
    /// Inputs that have been focused at least once
    seen_focus: HashSet<InputId>,
    /// Input that became Waiting through focus alone
    auto_target: Option<InputId>,
}

struct ScaleInner {
    ctx: ModuleContext,
    state: Mutex<ScaleState>,
    subscription: Mutex<Option<Unsubscribe>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    refresh: Notify,
    cancel: CancellationToken,
    timers: Debouncer<ScaleTimer>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScaleInner {
    fn state(&self) -> MutexGuard<'_, ScaleState> {
        lock(&self.state)
    }

    /// Render targeting transitions on the surface
    fn project(&self, transitions: &[Transition]) {
        for t in transitions {
            let affordance = match t.to {
                TargetState::Idle => Affordance::None,
                TargetState::Waiting => Affordance::Pulsing,
                TargetState::Fulfilled => Affordance::Success,
            };
            debug!("Scale input {}: {:?} -> {:?}", t.input, t.from, t.to);
            self.ctx
                .surface
                .set_affordance(MODULE_ID, &t.input, affordance);
        }
    }

    fn is_weight_input(&self, input: &InputId) -> bool {
        self.ctx
            .surface
            .input(input)
            .is_some_and(|d| units::is_weight_input(&d))
    }

    // -------------------------------------------------------------------------
    // Targeting
    // -------------------------------------------------------------------------

    /// Clear `input` and make it the single Waiting input
    fn target_input(&self, input: &InputId) {
        if self.ctx.surface.input(input).is_none() {
            warn!("Cannot target unknown input {}", input);
            return;
        }
        self.ctx.surface.clear_value(input);
        let transitions = {
            let mut state = self.state();
            state.runtime.last_stable_weight = None;
            state.auto_target = None;
            state.targets.set_waiting(input)
        };
        self.project(&transitions);
    }

    fn cancel_waiting(&self) -> bool {
        let transition = {
            let mut state = self.state();
            state.auto_target = None;
            match state.targets.waiting() {
                Some(waiting) => state.targets.set_idle(&waiting),
                None => None,
            }
        };
        let cancelled = transition.is_some();
        self.project(&transition.into_iter().collect::<Vec<_>>());
        cancelled
    }

    fn on_focus(&self, input: &InputId, config_complete: bool) {
        let transitions = {
            let mut state = self.state();
            let first_focus = state.seen_focus.insert(input.clone());
            if !first_focus || !config_complete || !state.settings.auto_target {
                return;
            }
            if state.targets.state(input) != TargetState::Idle || !self.is_weight_input(input) {
                return;
            }
            state.runtime.last_stable_weight = None;
            state.auto_target = Some(input.clone());
            state.targets.set_waiting(input)
        };
        debug!("Auto-targeting scale input {}", input);
        self.project(&transitions);
    }

    fn on_blur(&self, input: &InputId) {
        let transition = {
            let mut state = self.state();
            if state.auto_target.as_ref() != Some(input) {
                return;
            }
            state.auto_target = None;
            if state.targets.state(input) == TargetState::Waiting {
                state.targets.set_idle(input)
            } else {
                None
            }
        };
        self.project(&transition.into_iter().collect::<Vec<_>>());
    }

    /// Typing or pasting means the user enters the value by hand
    fn on_manual_entry(&self, input: &InputId) {
        let transition = {
            let mut state = self.state();
            if state.targets.state(input) != TargetState::Waiting {
                return;
            }
            if state.auto_target.as_ref() == Some(input) {
                state.auto_target = None;
            }
            state.targets.set_idle(input)
        };
        debug!("Manual entry on {}, no longer waiting", input);
        self.project(&transition.into_iter().collect::<Vec<_>>());
    }

    fn on_hotkey(&self) {
        if self.cancel_waiting() {
            return;
        }
        let target = match self.ctx.surface.focused() {
            Some(focused) if self.is_weight_input(&focused) => Some(focused),
            Some(focused) => {
                debug!("Scale hotkey: focused input {} takes no weight", focused);
                return;
            }
            None => self
                .ctx
                .surface
                .inputs()
                .into_iter()
                .find(units::is_weight_input)
                .map(|d| d.id),
        };
        match target {
            Some(target) => self.target_input(&target),
            None => debug!("Scale hotkey: no weight input on the surface"),
        }
    }

    /// Return fulfilled inputs to idle, optionally only those in `form`
    fn reset_fulfilled(&self, form: Option<&str>) {
        let transitions = {
            let mut state = self.state();
            let fulfilled = state.targets.in_state(TargetState::Fulfilled);
            fulfilled
                .iter()
                .filter(|id| match form {
                    None => true,
                    Some(form) => self
                        .ctx
                        .surface
                        .input(id)
                        .is_some_and(|d| d.form.as_deref() == Some(form)),
                })
                .filter_map(|id| state.targets.set_idle(id))
                .collect::<Vec<_>>()
        };
        self.project(&transitions);
    }

    // -------------------------------------------------------------------------
    // Readings
    // -------------------------------------------------------------------------

    fn on_entities(self: &Arc<Self>, entities: &EntityMap) {
        let entity_id = self.state().settings.entity_id.clone();
        let Some(entity) = entities.get(&entity_id) else {
            return;
        };
        let Some(reading) = parse_reading(entity) else {
            debug!(entity_id = %entity_id, "Ignoring scale state {:?}", entity.state);
            return;
        };
        let last_update = entity
            .last_updated
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        {
            let mut state = self.state();
            state.runtime.last_weight = Some(reading.grams);
            state.runtime.is_stable = reading.is_stable;
            state.runtime.last_update = Some(last_update);
        }

        // Unstable readings leave a pending window alone; the fired handler
        // re-checks stability
        if reading.is_stable {
            let weak = Arc::downgrade(self);
            self.timers.schedule(ScaleTimer::StableWeight, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_stable_weight();
                }
            });
        }
    }

    /// Debounced stable weight: apply it to the waiting input
    fn on_stable_weight(&self) {
        let (target, grams, default_precision) = {
            let state = self.state();
            let runtime = &state.runtime;
            let Some(grams) = runtime.last_weight.filter(|_| runtime.is_stable) else {
                return;
            };
            if runtime.last_stable_weight == Some(grams) {
                return;
            }
            let Some(target) = state.targets.waiting() else {
                return;
            };
            (target, grams, state.settings.default_precision)
        };

        let Some(descriptor) = self.ctx.surface.input(&target) else {
            warn!("Waiting input {} disappeared", target);
            let transition = self.state().targets.set_idle(&target);
            self.project(&transition.into_iter().collect::<Vec<_>>());
            return;
        };
        let (unit, unit_found) = units::resolve_unit(&descriptor);
        let precision = units::resolve_precision(&descriptor, default_precision);
        let value = units::format_weight(grams, unit, precision);

        if !self.ctx.surface.write_value(&target, &value) {
            warn!("Could not write weight into {}", target);
            return;
        }

        let transition = {
            let mut state = self.state();
            state.runtime.last_stable_weight = Some(grams);
            if state.auto_target.as_ref() == Some(&target) {
                state.auto_target = None;
            }
            state.targets.fulfill(&target)
        };
        if let Some(t) = transition {
            debug!("Scale input {}: {:?} -> {:?}", t.input, t.from, t.to);
        }
        let affordance = if unit_found {
            Affordance::Success
        } else {
            Affordance::Warning
        };
        self.ctx
            .surface
            .set_affordance(MODULE_ID, &target, affordance);

        info!(
            "Wrote {} {} into {} ({} g{})",
            value,
            unit.symbol,
            target,
            grams,
            if unit_found { "" } else { ", unit assumed" }
        );
        self.ctx.bus.publish(BusEvent::ValueWritten {
            module: MODULE_ID.to_string(),
            input: target,
            value,
        });
    }

    // -------------------------------------------------------------------------
    // Subscription
    // -------------------------------------------------------------------------

    fn drop_subscription(&self) {
        let previous = lock(&self.subscription).take();
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }

    /// Replace the entity subscription (at most one per instance)
    async fn resubscribe(self: &Arc<Self>) {
        self.drop_subscription();
        let entity_id = self.state().settings.entity_id.clone();
        if entity_id.is_empty() {
            debug!("Scale entity not configured; not subscribing");
            return;
        }
        if self.cancel.is_cancelled() || !self.ctx.connection.is_connected() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
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

        if self.cancel.is_cancelled() {
            handle.unsubscribe();
            return;
        }
        let replaced = lock(&self.subscription).replace(handle);
        if let Some(replaced) = replaced {
            replaced.unsubscribe();
        }
        debug!(entity_id = %entity_id, "Scale subscribed");
    }

    async fn handle_event(self: &Arc<Self>, event: BusEvent) {
        match event {
            BusEvent::ClearInput { module, input } if module == MODULE_ID => {
                self.target_input(&input)
            }
            BusEvent::Ui(UiEvent::Focus { input }) => {
                let complete = self.ctx.model.is_config_complete().await;
                self.on_focus(&input, complete);
            }
            BusEvent::Ui(UiEvent::Blur { input }) => self.on_blur(&input),
            BusEvent::Ui(UiEvent::Keystroke { input } | UiEvent::Paste { input }) => {
                self.on_manual_entry(&input)
            }
            BusEvent::Ui(UiEvent::Hotkey {
                hotkey: Hotkey::ScaleTarget,
            }) => self.on_hotkey(),
            BusEvent::Ui(UiEvent::SuccessToast) => {
                let weak = Arc::downgrade(self);
                self.timers
                    .schedule_after(ScaleTimer::SuccessReset, SUCCESS_RESET_DELAY, move || {
                        if let Some(inner) = weak.upgrade() {
                            inner.reset_fulfilled(None);
                        }
                    });
            }
            BusEvent::Ui(UiEvent::FormReset { form }) => self.reset_fulfilled(form.as_deref()),
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
                        warn!("Scale listener lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Scale listener stopped");
    }

    fn apply_settings(&self, settings: ScaleSettings) {
        let changed = {
            let mut state = self.state();
            let changed = state.settings.entity_id != settings.entity_id;
            state.settings = settings;
            changed
        };
        if changed {
            self.refresh.notify_one();
        }
    }
}

pub struct ScaleModule {
    inner: Arc<ScaleInner>,
}

impl ScaleModule {
    pub fn new(ctx: ModuleContext) -> Self {
        let cancel = CancellationToken::new();
        Self {
            inner: Arc::new(ScaleInner {
                ctx,
                state: Mutex::new(ScaleState::default()),
                subscription: Mutex::new(None),
                listener: Mutex::new(None),
                refresh: Notify::new(),
                timers: Debouncer::new(STABLE_DEBOUNCE, cancel.clone()),
                cancel,
            }),
        }
    }

    pub fn settings(&self) -> ScaleSettings {
        self.inner.state().settings.clone()
    }

    pub fn runtime(&self) -> ScaleRuntime {
        self.inner.state().runtime.clone()
    }

    pub fn target_state(&self, input: &InputId) -> TargetState {
        self.inner.state().targets.state(input)
    }

    pub fn waiting_input(&self) -> Option<InputId> {
        self.inner.state().targets.waiting()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.inner.subscription)
            .as_ref()
            .is_some_and(Unsubscribe::is_active)
    }

    fn parse_settings(config: &Value) -> Result<ScaleSettings, ModuleError> {
        if config.is_null() {
            return Ok(ScaleSettings::default());
        }
        let mut settings: ScaleSettings =
            serde_json::from_value(config.clone()).map_err(|e| ModuleError::InvalidConfig {
                id: MODULE_ID.to_string(),
                errors: vec![e.to_string()],
            })?;
        settings.default_precision = settings.default_precision.min(MAX_PRECISION);
        Ok(settings)
    }
}

impl ValidateConfig for ScaleModule {
    fn validate_config(&self, config: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        if config.is_null() {
            return errors;
        }
        if !config.is_object() {
            errors.push("scale settings must be an object".to_string());
            return errors;
        }
        check_entity_id(config, &mut errors);
        match config.get("defaultPrecision") {
            None | Some(Value::Null) => {}
            Some(v) => match v.as_u64() {
                Some(p) if p <= u64::from(MAX_PRECISION) => {}
                _ => errors.push(format!(
                    "defaultPrecision must be a whole number between 0 and {}",
                    MAX_PRECISION
                )),
            },
        }
        if let Some(v) = config.get("autoTarget") {
            if !v.is_boolean() && !v.is_null() {
                errors.push("autoTarget must be true or false".to_string());
            }
        }
        errors
    }
}

#[async_trait]
impl FeatureModule for ScaleModule {
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
        info!(
            "Scale module ready (entity {:?})",
            self.inner.state().settings.entity_id
        );
        Ok(())
    }

    async fn destroy(&self) {
        self.inner.cancel.cancel();
        self.inner.timers.cancel_all();
        self.inner.drop_subscription();

        let transitions = {
            let mut state = self.inner.state();
            state.auto_target = None;
            state.runtime = ScaleRuntime::default();
            state.targets.reset_all()
        };
        self.inner.project(&transitions);

        let listener = lock(&self.inner.listener).take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!("Scale listener ended abnormally: {}", e);
            }
        }
        debug!("Scale module destroyed");
    }

    fn config_section(&self) -> ConfigSection {
        ConfigSection {
            module: MODULE_ID.to_string(),
            title: "Scale".to_string(),
            fields: vec![
                ConfigField::new("entityId", "Scale entity", FieldKind::Entity)
                    .with_help("Sensor reporting the weight in grams, e.g. sensor.kitchen_scale"),
                ConfigField::new(
                    "defaultPrecision",
                    "Decimal places",
                    FieldKind::Number {
                        min: 0.0,
                        max: f64::from(MAX_PRECISION),
                    },
                )
                .with_help("Used when the input has no step attribute"),
                ConfigField::new("autoTarget", "Target inputs on focus", FieldKind::Toggle),
            ],
        }
    }

    fn load_config(&self, config: &Value) -> Result<(), ModuleError> {
        let settings = Self::parse_settings(config)?;
        debug!("Scale settings: {:?}", settings);
        self.inner.apply_settings(settings);
        Ok(())
    }

    fn config(&self) -> Value {
        serde_json::to_value(self.settings()).unwrap_or_default()
    }

    fn validator(&self) -> Option<&dyn ValidateConfig> {
        Some(self)
    }
}

pub struct ScaleFactory;

impl ModuleFactory for ScaleFactory {
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata {
            id: MODULE_ID.to_string(),
            display_name: "Scale".to_string(),
            description: "Writes stable readings from a hub weight sensor into the targeted input"
                .to_string(),
        }
    }

    fn create(&self, ctx: ModuleContext) -> Arc<dyn FeatureModule> {
        Arc::new(ScaleModule::new(ctx))
    }
}
