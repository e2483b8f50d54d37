//! Node-local lifecycle commands forwarded into the activation machinery.

use crate::application::ApplicationMap;
use crate::code_package::CodePackageState;
use crate::context::HostingContext;
use crate::run_stats::RunStats;
use crate::{Error, Result};
use hosting_model::{RolloutVersion, ServicePackageInstanceIdentifier};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Summary of one deployed code package, returned by queries.
#[derive(Debug, Clone)]
pub struct DeployedCodePackageInfo {
    /// Code package name.
    pub name: String,
    /// Current lifecycle state.
    pub state: CodePackageState,
    /// Rollout version of the in-memory descriptor.
    pub rollout_version: RolloutVersion,
    /// Run statistics snapshot.
    pub run_stats: RunStats,
    /// Instance id of the live instance, zero when none.
    pub instance_id: i64,
}

/// Forwards node-local restart/abort commands into the hosting machinery.
pub struct HostingQueryManager {
    ctx: Arc<HostingContext>,
    applications: Arc<ApplicationMap>,
}

impl HostingQueryManager {
    /// Create a query manager over the node's application map.
    pub fn new(ctx: Arc<HostingContext>, applications: Arc<ApplicationMap>) -> Self {
        Self { ctx, applications }
    }

    fn code_package(
        &self,
        service_package_instance_id: &ServicePackageInstanceIdentifier,
        code_package_name: &str,
    ) -> Result<Arc<crate::code_package::CodePackage>> {
        let application = self
            .applications
            .get(service_package_instance_id.application_id())
            .ok_or_else(|| {
                Error::ApplicationNotFound(service_package_instance_id.application_id().to_string())
            })?;
        let vsp = application
            .service_package(service_package_instance_id)
            .ok_or_else(|| Error::NotFound(service_package_instance_id.to_string()))?;
        vsp.code_package(code_package_name)
            .ok_or_else(|| Error::CodePackageNotFound(code_package_name.to_string()))
    }

    /// Restart a deployed code package instance. A stale instance id makes
    /// this a no-op success.
    pub async fn restart_code_package(
        &self,
        service_package_instance_id: &ServicePackageInstanceIdentifier,
        code_package_name: &str,
        instance_id: i64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let code_package = self.code_package(service_package_instance_id, code_package_name)?;
        let timeout = timeout.unwrap_or_else(|| self.ctx.config().activation_timeout());
        info!(
            "Restart requested for {}/{} instance {}",
            service_package_instance_id, code_package_name, instance_id
        );
        code_package.restart_code_package_instance(instance_id, timeout).await
    }

    /// Abort a deployed code package instance, bypassing graceful stop.
    pub async fn abort_code_package(
        &self,
        service_package_instance_id: &ServicePackageInstanceIdentifier,
        code_package_name: &str,
    ) -> Result<()> {
        let code_package = self.code_package(service_package_instance_id, code_package_name)?;
        info!("Abort requested for {}/{}", service_package_instance_id, code_package_name);
        code_package.abort_and_wait_for_termination().await;
        Ok(())
    }

    /// Summaries of the code packages deployed under a service package
    /// instance.
    pub fn deployed_code_packages(
        &self,
        service_package_instance_id: &ServicePackageInstanceIdentifier,
    ) -> Result<Vec<DeployedCodePackageInfo>> {
        let application = self
            .applications
            .get(service_package_instance_id.application_id())
            .ok_or_else(|| {
                Error::ApplicationNotFound(service_package_instance_id.application_id().to_string())
            })?;
        let vsp = application
            .service_package(service_package_instance_id)
            .ok_or_else(|| Error::NotFound(service_package_instance_id.to_string()))?;

        let mut infos: Vec<DeployedCodePackageInfo> = vsp
            .active_code_package_names()
            .into_iter()
            .filter_map(|name| vsp.code_package(&name))
            .map(|cp| DeployedCodePackageInfo {
                name: cp.name(),
                state: cp.state(),
                rollout_version: cp.rollout_version(),
                run_stats: cp.stats(),
                instance_id: cp.current_instance_id(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}
