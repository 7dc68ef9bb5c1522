//! Feature modules
//!
//! A feature module owns a small state machine over surface inputs and
//! subscribes to one configured hub entity through the connection service.
//! Modules are created by a [`ModuleFactory`] registered with the
//! [`ModuleRegistry`], which is the single owner of live instances.

pub mod debounce;
pub mod registry;
pub mod scale;
pub mod scanner;
pub mod targeting;

#[cfg(test)]
pub(crate) mod test_support;

pub use registry::ModuleRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::bus::SharedBus;
use crate::connection::ConnectionService;
use crate::hub::is_valid_entity_id;
use crate::model::ConfigurationModel;
use crate::surface::SharedSurface;

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module '{0}' is not registered")]
    NotRegistered(String),

    /// Programming error in a module implementation
    #[error("module contract violation in '{id}': {reason}")]
    Contract { id: String, reason: String },

    #[error("invalid configuration for module '{id}': {}", .errors.join("; "))]
    InvalidConfig { id: String, errors: Vec<String> },

    #[error("module '{id}' failed to initialize: {reason}")]
    Init { id: String, reason: String },
}

/// Static description of a module type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleMetadata {
    pub id: String,
    pub display_name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    /// Hub entity id
    Entity,
    Number { min: f64, max: f64 },
    Toggle,
}

/// One setting a module exposes in the settings form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub key: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default)]
    pub help: Option<String>,
}

impl ConfigField {
    pub fn new(key: &str, label: &str, kind: FieldKind) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            kind,
            help: None,
        }
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }
}

/// Settings-form section contributed by a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSection {
    pub module: String,
    pub title: String,
    pub fields: Vec<ConfigField>,
}

/// Everything a module instance may reach
#[derive(Clone)]
pub struct ModuleContext {
    pub bus: SharedBus,
    pub connection: ConnectionService,
    pub model: Arc<ConfigurationModel>,
    pub surface: SharedSurface,
}

/// Optional capability: check a config slice before it is loaded
pub trait ValidateConfig: Send + Sync {
    /// Every problem found, empty when the slice is acceptable
    fn validate_config(&self, config: &Value) -> Vec<String>;
}

/// Lifecycle every feature module implements
#[async_trait]
pub trait FeatureModule: Send + Sync {
    fn id(&self) -> &str;

    /// Start listening; subscribe right away if the hub is connected
    async fn init(&self) -> Result<(), ModuleError>;

    /// Stop tasks, cancel subscriptions and clear every input mark.
    /// Must tolerate being called more than once.
    async fn destroy(&self);

    fn config_section(&self) -> ConfigSection;

    fn load_config(&self, config: &Value) -> Result<(), ModuleError>;

    /// Current settings as stored in the configuration
    fn config(&self) -> Value;

    fn validator(&self) -> Option<&dyn ValidateConfig> {
        None
    }
}

/// Registered with the registry; builds instances bound to the shared context
pub trait ModuleFactory: Send + Sync {
    fn metadata(&self) -> ModuleMetadata;

    fn create(&self, ctx: ModuleContext) -> Arc<dyn FeatureModule>;
}

/// Shared check for a module's `entityId` setting. Empty means "not configured".
pub(crate) fn check_entity_id(config: &Value, errors: &mut Vec<String>) {
    match config.get("entityId") {
        None | Some(Value::Null) => {}
        Some(Value::String(id)) if id.is_empty() || is_valid_entity_id(id) => {}
        Some(Value::String(id)) => errors.push(format!("malformed entity id {:?}", id)),
        Some(other) => errors.push(format!("entityId must be a string, got {}", other)),
    }
}
