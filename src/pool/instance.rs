//! Named instances
//!
//! The application builds one `InstanceManager` and hands it to whoever
//! needs an instance. Dropping the manager force-stops every instance it
//! still owns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::DatabaseConfig;
use crate::errors::{StorageError, StorageResult};
use crate::observability::Logger;
use crate::security::{SecurityManager, UnixSecurityManager};
use crate::storage::HookSet;

use super::{BrokerPool, PoolStatus};

pub const DEFAULT_INSTANCE: &str = "xmlstore";

pub struct InstanceManager {
    security: Arc<dyn SecurityManager>,
    instances: Mutex<HashMap<String, Arc<BrokerPool>>>,
}

impl Default for InstanceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceManager {
    pub fn new() -> Self {
        Self::with_security(Arc::new(UnixSecurityManager))
    }

    pub fn with_security(security: Arc<dyn SecurityManager>) -> Self {
        Self {
            security,
            instances: Mutex::new(HashMap::new()),
        }
    }

    fn instances(&self) -> StorageResult<MutexGuard<'_, HashMap<String, Arc<BrokerPool>>>> {
        self.instances
            .lock()
            .map_err(|_| StorageError::locking("instance registry poisoned"))
    }

    /// Start instance `name`. Configuring a running name again returns the
    /// existing instance and logs a warning.
    pub fn configure(&self, name: &str, config: DatabaseConfig) -> StorageResult<Arc<BrokerPool>> {
        self.configure_with_hooks(name, config, HookSet::new())
    }

    pub fn configure_with_hooks(
        &self,
        name: &str,
        config: DatabaseConfig,
        hooks: HookSet,
    ) -> StorageResult<Arc<BrokerPool>> {
        let mut instances = self.instances()?;
        if let Some(existing) = instances.get(name) {
            if existing.status() != PoolStatus::Shutdown {
                Logger::warn("INSTANCE_ALREADY_CONFIGURED", &[("name", name)]);
                return Ok(Arc::clone(existing));
            }
        }

        let pool = BrokerPool::open(name, config, Arc::clone(&self.security), hooks)?;
        instances.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<BrokerPool>> {
        self.instances()?
            .get(name)
            .filter(|pool| pool.status() != PoolStatus::Shutdown)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("instance '{}' is not available", name)))
    }

    pub fn is_configured(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances()
            .map(|i| i.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Shut down and deregister `name`.
    pub fn stop(&self, name: &str, killed: bool) -> StorageResult<()> {
        let pool = self
            .instances()?
            .remove(name)
            .ok_or_else(|| StorageError::not_found(format!("instance '{}' is not configured", name)))?;
        pool.shutdown(killed)
    }

    /// Stop every instance, returning the first failure after trying them all.
    pub fn stop_all(&self, killed: bool) -> StorageResult<()> {
        let pools: Vec<Arc<BrokerPool>> = match self.instances() {
            Ok(mut instances) => instances.drain().map(|(_, pool)| pool).collect(),
            Err(e) => return Err(e),
        };

        let mut first_error = None;
        for pool in pools {
            if let Err(e) = pool.shutdown(killed) {
                Logger::error(
                    "INSTANCE_STOP_FAILED",
                    &[("error", &e.to_string()), ("name", pool.name())],
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for InstanceManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop_all(true) {
            Logger::error("INSTANCE_STOP_FAILED", &[("error", &e.to_string())]);
        }
    }
}
