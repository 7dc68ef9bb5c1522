//! Entity state as reported by the hub

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Current state of one hub entity (sensor)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub entity_id: String,

    /// Raw state string (e.g. "512.3", "unavailable", a scanned barcode)
    pub state: String,

    #[serde(default)]
    pub attributes: Map<String, Value>,

    #[serde(default)]
    pub last_changed: Option<String>,

    #[serde(default)]
    pub last_updated: Option<String>,
}

impl EntityState {
    pub fn new(entity_id: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            state: state.into(),
            attributes: Map::new(),
            last_changed: None,
            last_updated: None,
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn with_last_updated(mut self, ts: impl Into<String>) -> Self {
        let ts = ts.into();
        self.last_changed = Some(ts.clone());
        self.last_updated = Some(ts);
        self
    }

    /// Whether the hub reports the entity as not delivering data
    pub fn is_unavailable(&self) -> bool {
        let state = self.state.trim();
        state.is_empty() || state == "unavailable" || state == "unknown"
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Per-entity state delivered to subscribers, keyed by entity id
pub type EntityMap = HashMap<String, EntityState>;

static ENTITY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+\.[a-z0-9_]+$").expect("static entity id pattern"));

/// Validate an entity id of the form `domain.object_id`.
///
/// Lowercase alphanumerics and underscores only; neither part may start or
/// end with an underscore and double underscores are rejected.
pub fn is_valid_entity_id(id: &str) -> bool {
    if !ENTITY_ID_RE.is_match(id) || id.contains("__") {
        return false;
    }
    id.split('.')
        .all(|part| !part.starts_with('_') && !part.ends_with('_'))
}
