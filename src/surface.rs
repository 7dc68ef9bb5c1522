//! Input surface abstraction
//!
//! Feature modules never touch presentation directly. They see inputs as
//! [`InputDescriptor`]s, write values through [`InputSurface`], and project
//! their targeting state onto an [`Affordance`] per input. `MemorySurface`
//! keeps everything in memory and doubles as the headless surface for the
//! binary (seeded from a JSON descriptor file).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Stable identifier of one input on the surface
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InputId(String);

impl InputId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InputId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What modules can learn about an input: identity, naming and nearby text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputDescriptor {
    pub id: InputId,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub classes: Vec<String>,

    /// `data-*` attributes, keys without the `data-` prefix
    #[serde(default)]
    pub data: BTreeMap<String, String>,

    /// Text of the associated label
    #[serde(default)]
    pub label: Option<String>,

    /// Sibling text near the input (addons, help text), nearest first
    #[serde(default)]
    pub hints: Vec<String>,

    /// The `step` attribute, verbatim
    #[serde(default)]
    pub step: Option<String>,

    /// Form the input belongs to
    #[serde(default)]
    pub form: Option<String>,

    /// Initial value
    #[serde(default)]
    pub value: String,
}

impl InputDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: InputId::new(id),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn with_hint(mut self, hint: &str) -> Self {
        self.hints.push(hint.to_string());
        self
    }

    pub fn with_step(mut self, step: &str) -> Self {
        self.step = Some(step.to_string());
        self
    }

    pub fn with_class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn with_data(mut self, key: &str, value: &str) -> Self {
        self.data.insert(key.to_string(), value.to_string());
        self
    }

    pub fn in_form(mut self, form: &str) -> Self {
        self.form = Some(form.to_string());
        self
    }
}

/// Visual projection of a module's per-input state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affordance {
    #[default]
    None,
    /// Waiting for a reading
    Pulsing,
    /// Value written with a known unit
    Success,
    /// Value written, but with a fallback (e.g. unit guessed)
    Warning,
    /// Scanner armed on this input
    Scanning,
}

/// Notifications fired on an input when a value is written programmatically
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldEvent {
    Input,
    Change,
    Blur,
}

/// The surface modules write readings into
pub trait InputSurface: Send + Sync {
    fn inputs(&self) -> Vec<InputDescriptor>;

    fn input(&self, id: &InputId) -> Option<InputDescriptor> {
        self.inputs().into_iter().find(|d| &d.id == id)
    }

    fn focused(&self) -> Option<InputId>;

    fn value(&self, id: &InputId) -> Option<String>;

    /// Set the value and fire input, change and blur. Returns false for unknown inputs.
    fn write_value(&self, id: &InputId, value: &str) -> bool;

    /// Empty the value without firing notifications
    fn clear_value(&self, id: &InputId) -> bool;

    /// Render `module`'s state for `id`
    fn set_affordance(&self, module: &str, id: &InputId, affordance: Affordance);

    fn affordance(&self, module: &str, id: &InputId) -> Affordance;
}

pub type SharedSurface = Arc<dyn InputSurface>;

struct InputRecord {
    descriptor: InputDescriptor,
    value: String,
    affordances: BTreeMap<String, Affordance>,
    events: Vec<FieldEvent>,
}

#[derive(Default)]
struct SurfaceState {
    inputs: BTreeMap<InputId, InputRecord>,
    /// Insertion order, so "first input on the page" is stable
    order: Vec<InputId>,
    focused: Option<InputId>,
}

/// In-memory surface
#[derive(Default)]
pub struct MemorySurface {
    state: Mutex<SurfaceState>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inputs(inputs: impl IntoIterator<Item = InputDescriptor>) -> Self {
        let surface = Self::new();
        for input in inputs {
            surface.add_input(input);
        }
        surface
    }

    /// Load descriptors from a JSON array file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let inputs: Vec<InputDescriptor> = serde_json::from_str(&content)?;
        debug!("Loaded {} input descriptors from {}", inputs.len(), path.display());
        Ok(Self::with_inputs(inputs))
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_input(&self, descriptor: InputDescriptor) {
        let mut state = self.lock();
        let id = descriptor.id.clone();
        if !state.inputs.contains_key(&id) {
            state.order.push(id.clone());
        }
        state.inputs.insert(
            id,
            InputRecord {
                value: descriptor.value.clone(),
                descriptor,
                affordances: BTreeMap::new(),
                events: Vec::new(),
            },
        );
    }

    pub fn remove_input(&self, id: &InputId) {
        let mut state = self.lock();
        state.inputs.remove(id);
        state.order.retain(|i| i != id);
        if state.focused.as_ref() == Some(id) {
            state.focused = None;
        }
    }

    pub fn set_focus(&self, id: Option<&InputId>) {
        self.lock().focused = id.cloned();
    }

    /// Simulate the user typing into an input
    pub fn type_value(&self, id: &InputId, value: &str) {
        if let Some(record) = self.lock().inputs.get_mut(id) {
            record.value = value.to_string();
        }
    }

    /// Notifications fired on `id` since the input was added
    pub fn events(&self, id: &InputId) -> Vec<FieldEvent> {
        self.lock()
            .inputs
            .get(id)
            .map(|r| r.events.clone())
            .unwrap_or_default()
    }
}

impl InputSurface for MemorySurface {
    fn inputs(&self) -> Vec<InputDescriptor> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.inputs.get(id))
            .map(|r| r.descriptor.clone())
            .collect()
    }

    fn input(&self, id: &InputId) -> Option<InputDescriptor> {
        self.lock().inputs.get(id).map(|r| r.descriptor.clone())
    }

    fn focused(&self) -> Option<InputId> {
        self.lock().focused.clone()
    }

    fn value(&self, id: &InputId) -> Option<String> {
        self.lock().inputs.get(id).map(|r| r.value.clone())
    }

    fn write_value(&self, id: &InputId, value: &str) -> bool {
        let mut state = self.lock();
        let Some(record) = state.inputs.get_mut(id) else {
            return false;
        };
        record.value = value.to_string();
        record
            .events
            .extend([FieldEvent::Input, FieldEvent::Change, FieldEvent::Blur]);
        if state.focused.as_ref() == Some(id) {
            state.focused = None;
        }
        true
    }

    fn clear_value(&self, id: &InputId) -> bool {
        match self.lock().inputs.get_mut(id) {
            Some(record) => {
                record.value.clear();
                true
            }
            None => false,
        }
    }

    fn set_affordance(&self, module: &str, id: &InputId, affordance: Affordance) {
        if let Some(record) = self.lock().inputs.get_mut(id) {
            if affordance == Affordance::None {
                record.affordances.remove(module);
            } else {
                record.affordances.insert(module.to_string(), affordance);
            }
        }
    }

    fn affordance(&self, module: &str, id: &InputId) -> Affordance {
        self.lock()
            .inputs
            .get(id)
            .and_then(|r| r.affordances.get(module).copied())
            .unwrap_or_default()
    }
}
