//! Application lifecycle entity owning versioned service packages.

use crate::context::HostingContext;
use crate::state::StateMachine;
use crate::versioned_service_package::{VersionedServicePackage, VspState};
use crate::{Error, Result};
use futures::future::join_all;
use hosting_model::{
    ApplicationIdentifier, ApplicationVersion, ServicePackageInstanceIdentifier,
    ServicePackageVersionInstance,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle states of an application on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    /// Constructed, nothing set up.
    Created,
    /// Open in progress.
    Opening,
    /// Open; service packages may activate under it.
    Opened,
    /// Close in progress.
    Closing,
    /// Terminal: closed.
    Closed,
    /// Terminal: failed.
    Failed,
    /// Terminal: aborted.
    Aborted,
}

/// One application deployed on the node.
pub struct Application {
    ctx: Arc<HostingContext>,
    id: ApplicationIdentifier,
    name: String,
    state: StateMachine<ApplicationState>,
    version: RwLock<ApplicationVersion>,
    service_packages: RwLock<HashMap<ServicePackageInstanceIdentifier, Arc<VersionedServicePackage>>>,
}

impl Application {
    /// Create an application entity; it opens on first activation.
    pub fn new(
        ctx: Arc<HostingContext>,
        id: ApplicationIdentifier,
        name: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            id,
            name: name.into(),
            state: StateMachine::new(ApplicationState::Created),
            version: RwLock::new(ApplicationVersion::default()),
            service_packages: RwLock::new(HashMap::new()),
        })
    }

    /// Application identifier.
    pub fn id(&self) -> &ApplicationIdentifier {
        &self.id
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ApplicationState {
        self.state.current()
    }

    /// Version the application is open at.
    pub fn current_version(&self) -> ApplicationVersion {
        *self.version.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Bring the application up at `version`, or reconcile with an already
    /// open one.
    ///
    /// With `ensure_latest_version`, an application open at an equal or
    /// higher version is a success, and a lower one upgrades in place;
    /// without it, any version difference is a mismatch error.
    pub async fn activate(&self, version: ApplicationVersion, ensure_latest_version: bool) -> Result<()> {
        match self.state.current() {
            ApplicationState::Created => {
                self.state
                    .try_transition(&[ApplicationState::Created], ApplicationState::Opening)?;
                {
                    let mut current = self.version.write().unwrap_or_else(|e| e.into_inner());
                    *current = version;
                }
                self.state
                    .try_transition(&[ApplicationState::Opening], ApplicationState::Opened)?;
                info!("Application opened: {} at {}", self.id, version);
                Ok(())
            }
            ApplicationState::Opened => {
                let current = self.current_version();
                if current == version {
                    return Ok(());
                }
                if ensure_latest_version {
                    if current >= version {
                        return Ok(());
                    }
                    let mut stored = self.version.write().unwrap_or_else(|e| e.into_inner());
                    info!("Application {} version {} -> {}", self.id, *stored, version);
                    *stored = version;
                    return Ok(());
                }
                Err(Error::ApplicationVersionMismatch {
                    open: current.to_string(),
                    requested: version.to_string(),
                })
            }
            ApplicationState::Closing | ApplicationState::Closed | ApplicationState::Aborted => {
                Err(Error::ObjectClosed)
            }
            current => Err(Error::InvalidState {
                current: format!("{current:?}"),
                operation: "activate application".to_string(),
            }),
        }
    }

    /// Activate one service package instance at the requested version,
    /// opening it if absent and switching it if open at an older version.
    pub async fn activate_service_package_instance(
        &self,
        service_package_instance_id: ServicePackageInstanceIdentifier,
        version_instance: ServicePackageVersionInstance,
        ensure_latest_version: bool,
        timeout: Duration,
    ) -> Result<Arc<VersionedServicePackage>> {
        if self.state.current() != ApplicationState::Opened {
            return Err(Error::ObjectClosed);
        }

        let existing = {
            let map = self.service_packages.read().unwrap_or_else(|e| e.into_inner());
            map.get(&service_package_instance_id).cloned()
        };

        if let Some(vsp) = existing {
            match vsp.state() {
                VspState::Opened => {
                    let current = vsp.current_version_instance();
                    if current.version == version_instance.version {
                        return Ok(vsp);
                    }
                    if ensure_latest_version && current.version >= version_instance.version {
                        return Ok(vsp);
                    }

                    let new_description = self.ctx.deps.package_store.service_package_description(
                        &service_package_instance_id.service_package_id,
                        &version_instance.version,
                    )?;
                    vsp.switch(version_instance, new_description, timeout).await?;
                    return Ok(vsp);
                }
                VspState::Closed | VspState::Failed | VspState::Aborted => {
                    let mut map =
                        self.service_packages.write().unwrap_or_else(|e| e.into_inner());
                    map.remove(&service_package_instance_id);
                }
                // Another activation is driving this instance; the caller's
                // retry harness absorbs this.
                _ => {
                    return Err(Error::InvalidState {
                        current: format!("{:?}", vsp.state()),
                        operation: "activate service package instance".to_string(),
                    });
                }
            }
        }

        let app_version = self.current_version();
        if version_instance.version.application_version != app_version {
            return Err(Error::ApplicationVersionMismatch {
                open: app_version.to_string(),
                requested: version_instance.version.application_version.to_string(),
            });
        }

        let description = self.ctx.deps.package_store.service_package_description(
            &service_package_instance_id.service_package_id,
            &version_instance.version,
        )?;

        let vsp = VersionedServicePackage::new(
            self.ctx.clone(),
            service_package_instance_id.clone(),
            self.ctx.next_sequence(),
            self.name.clone(),
            version_instance,
            description,
        );
        {
            let mut map = self.service_packages.write().unwrap_or_else(|e| e.into_inner());
            map.insert(service_package_instance_id.clone(), vsp.clone());
        }

        match vsp.open(timeout).await {
            Ok(()) => Ok(vsp),
            Err(e) => {
                let mut map = self.service_packages.write().unwrap_or_else(|e| e.into_inner());
                map.remove(&service_package_instance_id);
                Err(e)
            }
        }
    }

    /// Close and remove one service package instance.
    pub async fn deactivate_service_package_instance(
        &self,
        service_package_instance_id: &ServicePackageInstanceIdentifier,
        timeout: Duration,
    ) -> Result<()> {
        let vsp = {
            let mut map = self.service_packages.write().unwrap_or_else(|e| e.into_inner());
            map.remove(service_package_instance_id)
        };
        let Some(vsp) = vsp else {
            return Ok(());
        };
        if let Err(e) = vsp.close(timeout).await {
            warn!("Close of {} failed ({}), aborting", service_package_instance_id, e);
            vsp.abort().await;
        }
        Ok(())
    }

    /// Look up a service package instance.
    pub fn service_package(
        &self,
        id: &ServicePackageInstanceIdentifier,
    ) -> Option<Arc<VersionedServicePackage>> {
        let map = self.service_packages.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).cloned()
    }

    /// Ids of all service package instances under this application.
    pub fn service_package_instance_ids(&self) -> Vec<ServicePackageInstanceIdentifier> {
        let map = self.service_packages.read().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    /// Close every service package and the application itself.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if self.state.current() == ApplicationState::Closed {
            return Ok(());
        }
        self.state
            .try_transition(&[ApplicationState::Opened], ApplicationState::Closing)?;

        let packages: Vec<Arc<VersionedServicePackage>> = {
            let mut map = self.service_packages.write().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, vsp)| vsp).collect()
        };

        let results = join_all(packages.iter().map(|vsp| vsp.close(timeout))).await;
        for (vsp, result) in packages.iter().zip(results) {
            if let Err(e) = result {
                warn!("Close of {} failed ({}), aborting", vsp.id(), e);
                vsp.abort().await;
            }
        }

        self.state
            .try_transition(&[ApplicationState::Closing], ApplicationState::Closed)?;
        info!("Application closed: {}", self.id);
        Ok(())
    }

    /// Abort every service package without graceful stops.
    pub async fn abort(&self) {
        self.state.force(ApplicationState::Aborted);
        let packages: Vec<Arc<VersionedServicePackage>> = {
            let mut map = self.service_packages.write().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, vsp)| vsp).collect()
        };
        join_all(packages.iter().map(|vsp| vsp.abort())).await;
        info!("Application aborted: {}", self.id);
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("id", &self.id.to_string())
            .field("state", &self.state.current())
            .finish()
    }
}

/// Node-wide map of deployed applications.
#[derive(Default)]
pub struct ApplicationMap {
    inner: RwLock<HashMap<ApplicationIdentifier, Arc<Application>>>,
}

impl ApplicationMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an application.
    pub fn get(&self, id: &ApplicationIdentifier) -> Option<Arc<Application>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.get(id).cloned()
    }

    /// Get the application, creating it with `make` when absent.
    pub fn get_or_insert_with(
        &self,
        id: &ApplicationIdentifier,
        make: impl FnOnce() -> Arc<Application>,
    ) -> Arc<Application> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.entry(id.clone()).or_insert_with(make).clone()
    }

    /// Remove an application.
    pub fn remove(&self, id: &ApplicationIdentifier) -> Option<Arc<Application>> {
        let mut map = self.inner.write().unwrap_or_else(|e| e.into_inner());
        map.remove(id)
    }

    /// All deployed applications.
    pub fn list(&self) -> Vec<Arc<Application>> {
        let map = self.inner.read().unwrap_or_else(|e| e.into_inner());
        map.values().cloned().collect()
    }
}
