//! ModuleRegistry - plugin container for feature modules
//!
//! Registers module factories by id and owns the live instances. The
//! enabled-instance map is the single source of truth for "is this module
//! live": at most one instance per id exists at any time.
//!
//! Configuration changes go through [`ModuleRegistry::update_module_states`],
//! which disables every live module before enabling the requested set, so a
//! module never sees a stale subscription or half-applied settings.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{FeatureModule, ModuleContext, ModuleError, ModuleFactory, ModuleMetadata};
use crate::bus::BusEvent;
use crate::model::AppConfig;

struct Registration {
    metadata: ModuleMetadata,
    factory: Arc<dyn ModuleFactory>,
}

pub struct ModuleRegistry {
    ctx: ModuleContext,
    registered: RwLock<BTreeMap<String, Registration>>,
    active: RwLock<BTreeMap<String, Arc<dyn FeatureModule>>>,
    /// Serializes enable/disable sequences
    lifecycle: Mutex<()>,
}

impl ModuleRegistry {
    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            registered: RwLock::new(BTreeMap::new()),
            active: RwLock::new(BTreeMap::new()),
            lifecycle: Mutex::new(()),
        }
    }

    /// Record a module type. Incomplete metadata is a programming error.
    pub async fn register_module(
        &self,
        id: &str,
        factory: Arc<dyn ModuleFactory>,
    ) -> Result<(), ModuleError> {
        let metadata = factory.metadata();
        let violation = |reason: &str| ModuleError::Contract {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        if id.trim().is_empty() {
            return Err(violation("module id must not be empty"));
        }
        if metadata.id != id {
            return Err(violation(&format!(
                "metadata id {:?} does not match registration id",
                metadata.id
            )));
        }
        if metadata.display_name.trim().is_empty() {
            return Err(violation("metadata must carry a display name"));
        }

        let mut registered = self.registered.write().await;
        if registered.contains_key(id) {
            warn!("Module {} registered again; replacing factory", id);
        }
        registered.insert(id.to_string(), Registration { metadata, factory });
        debug!("Registered module: {}", id);
        Ok(())
    }

    pub async fn registered_modules(&self) -> Vec<ModuleMetadata> {
        let registered = self.registered.read().await;
        registered.values().map(|r| r.metadata.clone()).collect()
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.registered.read().await.contains_key(id)
    }

    pub async fn is_enabled(&self, id: &str) -> bool {
        self.active.read().await.contains_key(id)
    }

    /// Ids of live modules, sorted
    pub async fn active_modules(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    pub async fn module(&self, id: &str) -> Option<Arc<dyn FeatureModule>> {
        self.active.read().await.get(id).cloned()
    }

    /// Enable `id`, returning the live instance. Idempotent.
    pub async fn enable_module(&self, id: &str) -> Result<Arc<dyn FeatureModule>, ModuleError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.enable_locked(id).await
    }

    /// Destroy and drop the instance for `id`; no-op if not enabled
    pub async fn disable_module(&self, id: &str) {
        let _lifecycle = self.lifecycle.lock().await;
        self.disable_locked(id).await;
    }

    async fn enable_locked(&self, id: &str) -> Result<Arc<dyn FeatureModule>, ModuleError> {
        if let Some(existing) = self.module(id).await {
            debug!("Module {} already enabled", id);
            return Ok(existing);
        }

        let factory = {
            let registered = self.registered.read().await;
            registered
                .get(id)
                .map(|r| r.factory.clone())
                .ok_or_else(|| ModuleError::NotRegistered(id.to_string()))?
        };

        let instance = factory.create(self.ctx.clone());
        if instance.id() != id {
            return Err(ModuleError::Contract {
                id: id.to_string(),
                reason: format!("factory built a module reporting id {:?}", instance.id()),
            });
        }
        if let Err(e) = instance.init().await {
            error!("Module {} failed to initialize: {}", id, e);
            instance.destroy().await;
            return Err(e);
        }

        self.active
            .write()
            .await
            .insert(id.to_string(), instance.clone());
        info!("Enabled module: {}", id);
        self.ctx.bus.publish(BusEvent::ModuleEnabled {
            module: id.to_string(),
        });
        Ok(instance)
    }

    async fn disable_locked(&self, id: &str) {
        let removed = self.active.write().await.remove(id);
        let Some(instance) = removed else {
            debug!("Module {} not enabled, nothing to disable", id);
            return;
        };
        instance.destroy().await;
        info!("Disabled module: {}", id);
        self.ctx.bus.publish(BusEvent::ModuleDisabled {
            module: id.to_string(),
        });
    }

    /// Disable every live module, then enable each id mapped to `true`.
    ///
    /// Every requested id is attempted; the first failure is returned after
    /// the rest have been processed.
    pub async fn update_module_states(
        &self,
        desired: &BTreeMap<String, bool>,
    ) -> Result<(), ModuleError> {
        let _lifecycle = self.lifecycle.lock().await;

        for id in self.active_modules().await {
            self.disable_locked(&id).await;
        }

        let mut first_error = None;
        for (id, _) in desired.iter().filter(|(_, enabled)| **enabled) {
            if let Err(e) = self.enable_locked(id).await {
                warn!("Could not enable module {}: {}", id, e);
                first_error.get_or_insert(e);
            }
        }
        debug!("Active modules: {:?}", self.active_modules().await);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Hand each live module its slice of the configuration.
    ///
    /// A slice the module's validator rejects is not loaded; the error is
    /// returned after the other modules have been updated.
    pub async fn load_module_configs(&self, config: &AppConfig) -> Result<(), ModuleError> {
        let modules: Vec<(String, Arc<dyn FeatureModule>)> = {
            let active = self.active.read().await;
            active
                .iter()
                .map(|(id, m)| (id.clone(), m.clone()))
                .collect()
        };

        let mut first_error = None;
        for (id, module) in modules {
            let slice = config.module_config(&id).cloned().unwrap_or(Value::Null);
            if let Some(validator) = module.validator() {
                let errors = validator.validate_config(&slice);
                if !errors.is_empty() {
                    warn!("Rejected configuration for module {}: {:?}", id, errors);
                    first_error.get_or_insert(ModuleError::InvalidConfig { id, errors });
                    continue;
                }
            }
            if let Err(e) = module.load_config(&slice) {
                warn!("Module {} could not load its configuration: {}", id, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Disable all live modules concurrently
    pub async fn cleanup(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let drained: Vec<(String, Arc<dyn FeatureModule>)> = {
            let mut active = self.active.write().await;
            std::mem::take(&mut *active).into_iter().collect()
        };
        if drained.is_empty() {
            return;
        }

        join_all(drained.iter().map(|(_, module)| module.destroy())).await;
        for (id, _) in drained {
            self.ctx.bus.publish(BusEvent::ModuleDisabled { module: id });
        }
        info!("All modules disabled");
    }
}
