//! Per-node service type registry.
//!
//! Tracks which service types are declared, disabled, or bound to a running
//! runtime, and counts continuous failures per failure id so repeated
//! activation failures of the same service package disable its types.

use crate::{Error, Result};
use hosting_model::{HostingConfig, ServiceTypeInstanceIdentifier};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Binding between a declared service type and a live runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceTypeRegistration {
    /// Runtime id that registered the type.
    pub runtime_id: String,
    /// Application host the runtime lives in.
    pub host_id: String,
    /// Code package hosting the runtime.
    pub code_package_name: String,
}

#[derive(Debug, Default)]
struct ServiceTypeEntry {
    registration: Option<ServiceTypeRegistration>,
    disabled: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ServiceTypeInstanceIdentifier, ServiceTypeEntry>,
    // Continuous failures per failure id, shared across retries of the same
    // service package instance.
    failures: HashMap<String, u32>,
}

/// Per-node map of declared service types and their registration state.
pub struct ServiceTypeStateManager {
    config: Arc<HostingConfig>,
    inner: RwLock<Inner>,
}

impl ServiceTypeStateManager {
    /// Create an empty registry.
    pub fn new(config: Arc<HostingConfig>) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Declare service types on service package open. Re-declaring an
    /// existing entry clears its disabled flag.
    pub fn register_service_types(&self, ids: Vec<ServiceTypeInstanceIdentifier>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            debug!("Declaring service type: {}", id);
            let entry = inner.entries.entry(id).or_default();
            entry.disabled = false;
        }
    }

    /// Remove service types on service package close.
    pub fn unregister_service_types(&self, ids: &[ServiceTypeInstanceIdentifier]) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            inner.entries.remove(id);
        }
    }

    /// Bind a runtime to a declared service type.
    pub fn register_runtime(
        &self,
        id: &ServiceTypeInstanceIdentifier,
        registration: ServiceTypeRegistration,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if entry.disabled {
            return Err(Error::ServiceTypeDisabled(id.to_string()));
        }
        if entry.registration.is_some() {
            return Err(Error::RuntimeAlreadyRegistered(id.to_string()));
        }

        info!("Service type registered: {} runtime={}", id, registration.runtime_id);
        entry.registration = Some(registration);
        Ok(())
    }

    /// Drop the runtime binding of a service type, keeping the declaration.
    pub fn unregister_runtime(&self, id: &ServiceTypeInstanceIdentifier) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if entry.registration.take().is_none() {
            return Err(Error::RuntimeNotRegistered(id.to_string()));
        }
        Ok(())
    }

    /// Current registration of a service type. Disabled types reject
    /// lookups until the owning package re-opens.
    pub fn find_registration(
        &self,
        id: &ServiceTypeInstanceIdentifier,
    ) -> Result<Option<ServiceTypeRegistration>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entries
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if entry.disabled {
            return Err(Error::ServiceTypeDisabled(id.to_string()));
        }
        Ok(entry.registration.clone())
    }

    /// Registrations whose runtime lives in the given code package of the
    /// given service package instance.
    pub fn registrations_for_code_package(
        &self,
        service_package_instance: &hosting_model::ServicePackageInstanceIdentifier,
        code_package_name: &str,
    ) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .iter()
            .filter(|(id, _)| &id.service_package_instance_id == service_package_instance)
            .filter_map(|(_, entry)| entry.registration.as_ref())
            .filter(|reg| reg.code_package_name == code_package_name)
            .map(|reg| reg.runtime_id.clone())
            .collect()
    }

    /// Record one continuous failure for a failure id; returns the new
    /// count.
    pub fn register_failure(&self, failure_id: &str) -> u32 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let count = inner.failures.entry(failure_id.to_string()).or_insert(0);
        *count += 1;
        debug!("Continuous failure registered: {} count={}", failure_id, count);
        *count
    }

    /// Clear the continuous-failure count for a failure id.
    pub fn unregister_failure(&self, failure_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.failures.remove(failure_id);
    }

    /// Continuous-failure count for a failure id.
    pub fn failure_count(&self, failure_id: &str) -> u32 {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.failures.get(failure_id).copied().unwrap_or(0)
    }

    /// Disable a service type: clears its registration and rejects lookups
    /// until the owning package re-opens. Idempotent.
    pub fn disable(&self, id: &ServiceTypeInstanceIdentifier) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entries.entry(id.clone()).or_default();
        if !entry.disabled {
            warn!("Disabling service type: {}", id);
        }
        entry.disabled = true;
        entry.registration = None;
    }

    /// Placement lookup found no registration for a declared type. Disables
    /// the type once the failure id accumulated enough continuous failures.
    pub fn on_registration_not_found(
        &self,
        id: &ServiceTypeInstanceIdentifier,
        failure_id: &str,
    ) {
        let over_threshold =
            self.failure_count(failure_id) > self.config.service_type_disable_failure_threshold;
        if over_threshold {
            self.disable(id);
        }
    }

    /// Whether a service type is currently disabled.
    pub fn is_disabled(&self, id: &ServiceTypeInstanceIdentifier) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(id).map(|e| e.disabled).unwrap_or(false)
    }
}
