//! Capability traits the engine consumes.
//!
//! Each trait is a seam to an external collaborator: the OS-level process
//! activator, the environment manager, the health sink, the privileged
//! activator client, the package store, the deactivator's usage oracle, and
//! the message bus. In-memory fakes for all of them live in
//! [`crate::test_support`].

use crate::Result;
use async_channel::Receiver;
use async_trait::async_trait;
use hosting_model::{
    ApplicationIdentifier, ExitEvent, ProcessDescription, ResourceGovernancePolicyDescription,
    ServicePackageDescription, ServicePackageIdentifier, ServicePackageInstanceIdentifier,
    ServicePackageVersion,
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Opaque handle to a started process or container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    /// Activator-assigned instance id.
    pub id: u64,
    /// OS process id, when the instance is a process.
    pub pid: Option<u32>,
    /// Container name, when the instance is a container.
    pub container_name: Option<String>,
}

/// Starts, stops and governs OS processes and containers.
#[async_trait]
pub trait ProcessActivator: Send + Sync {
    /// Start one instance from its process description.
    async fn activate(&self, description: &ProcessDescription) -> Result<InstanceHandle>;

    /// Stop an instance; graceful delivers Ctrl-C/stop first, then kills at
    /// the timeout.
    async fn deactivate(
        &self,
        handle: &InstanceHandle,
        graceful: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Kill an instance without a graceful window.
    async fn terminate(&self, handle: &InstanceHandle) -> Result<()>;

    /// Apply new resource-governance limits to a live instance.
    async fn update_rg_policy(
        &self,
        handle: &InstanceHandle,
        rg: &ResourceGovernancePolicyDescription,
    ) -> Result<()>;

    /// Subscribe to the instance's exit notification. The channel yields
    /// exactly one event and is then closed.
    fn subscribe_exit(&self, handle: &InstanceHandle) -> Receiver<ExitEvent>;
}

/// Environment produced for one service package instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentContext {
    /// The instance this environment belongs to.
    pub service_package_instance_id: ServicePackageInstanceIdentifier,
    /// Root of the instance's run layout on disk.
    pub run_layout_root: PathBuf,
    /// Endpoint resource name to allocated port.
    pub endpoints: HashMap<String, u16>,
    /// Principal the packages run as, when a run-as policy applies.
    pub principal_user: Option<String>,
    /// SID of the account the node agent runs as.
    pub current_user_sid: String,
}

/// Sets up and tears down per-instance environments: directories, logical
/// application folders, user accounts, endpoints.
#[async_trait]
pub trait EnvironmentManager: Send + Sync {
    /// Set up the environment for a service package instance.
    async fn setup_service_package_environment(
        &self,
        id: &ServicePackageInstanceIdentifier,
        instance_id: u64,
        description: &ServicePackageDescription,
        timeout: Duration,
    ) -> Result<EnvironmentContext>;

    /// Tear the environment down gracefully.
    async fn cleanup_service_package_environment(
        &self,
        context: &EnvironmentContext,
        timeout: Duration,
    ) -> Result<()>;

    /// Tear the environment down without error reporting.
    async fn abort_service_package_environment(&self, context: &EnvironmentContext);
}

/// System health report codes emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthReportCode {
    /// A service package activated successfully.
    ServicePackageActivated,
    /// An activation attempt failed.
    ActivationFailed,
    /// Declared node capacity exceeds detected physical capacity.
    AvailableResourceCapacityMismatch,
    /// A governed package registered on a node without declared capacities.
    AvailableResourceCapacityNotDefined,
}

/// Sink for health reports keyed by source + property.
pub trait HealthReporter: Send + Sync {
    /// Register a report source.
    fn register_source(&self, key: &str, application_name: &str, property: &str) -> Result<()>;

    /// Unregister a report source; pending reports for it are dropped.
    fn unregister_source(&self, key: &str, property: &str);

    /// Emit one report.
    fn report(
        &self,
        key: &str,
        property: &str,
        code: HealthReportCode,
        description: &str,
        sequence: u64,
    ) -> Result<()>;
}

/// Fans privileged OS operations out to the activator process.
#[async_trait]
pub trait ActivatorClient: Send + Sync {
    /// Create or update an SMB share ACLed to the given SIDs.
    async fn configure_smb_share(
        &self,
        sids: Vec<String>,
        access_mask: u32,
        local_path: &std::path::Path,
        share_name: &str,
        timeout: Duration,
    ) -> Result<()>;

    /// Configure the node environment for the system DNS service.
    async fn configure_node_for_dns(&self, sid: &str) -> Result<()>;

    /// Terminate an externally registered instance by its application
    /// service id. `NotFound` means the instance is not currently
    /// registered; the caller retries after the returned due time.
    async fn terminate_process(&self, app_service_id: &str) -> Result<()>;

    /// List container images cached on the node.
    async fn get_node_container_images(&self) -> Result<Vec<String>>;
}

/// Usage oracle owned by the deactivation subsystem.
pub trait Deactivator: Send + Sync {
    /// Whether the application has users on this node.
    fn is_application_used(&self, id: &ApplicationIdentifier) -> bool;

    /// Whether the service package instance has users on this node.
    fn is_service_package_instance_used(&self, id: &ServicePackageInstanceIdentifier) -> bool;

    /// Queue the instance for deactivation if nothing uses it.
    fn schedule_deactivation_if_not_used(&self, id: &ServicePackageInstanceIdentifier);

    /// Known service package instances of an application.
    fn service_package_instances_of(
        &self,
        id: &ApplicationIdentifier,
    ) -> Vec<ServicePackageInstanceIdentifier>;
}

/// Parsed descriptions and local layout paths from the download subsystem.
pub trait PackageStore: Send + Sync {
    /// Parsed description for a service package at a version.
    fn service_package_description(
        &self,
        id: &ServicePackageIdentifier,
        version: &ServicePackageVersion,
    ) -> Result<ServicePackageDescription>;

    /// Root of the run layout for an application.
    fn run_layout_root(&self, id: &ApplicationIdentifier) -> PathBuf;
}

/// Request/reply transport to other node components and the cluster.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send a request and await its reply body.
    async fn request(&self, action: &str, body: Value) -> Result<Value>;

    /// Fire-and-forget notification.
    async fn notify(&self, action: &str, body: Value) -> Result<()>;
}
