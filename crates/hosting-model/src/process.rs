//! Process description and exit-code classification.

use crate::description::{DebugParametersDescription, ResourceGovernancePolicyDescription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Exit status a terminate-able process reports when stopped with Ctrl-C.
pub const STATUS_CONTROL_C_EXIT: u32 = 0xC000_013A;

/// Sentinel exit code reported for instances stopped through deactivate.
pub const PROCESS_DEACTIVATE_EXIT_CODE: u32 = 0x8000_000D;

/// Whether an exit code counts as a successful stop for retry accounting.
pub fn is_successful_exit(exit_code: u32) -> bool {
    exit_code == 0
        || exit_code == PROCESS_DEACTIVATE_EXIT_CODE
        || exit_code == STATUS_CONTROL_C_EXIT
}

/// Well-known environment variable names exposed to activated processes.
pub mod well_known_env {
    /// Node name.
    pub const NODE_NAME: &str = "Fabric_NodeName";
    /// Node id.
    pub const NODE_ID: &str = "Fabric_NodeId";
    /// Application name.
    pub const APPLICATION_NAME: &str = "Fabric_ApplicationName";
    /// Application id.
    pub const APPLICATION_ID: &str = "Fabric_ApplicationId";
    /// Service package name.
    pub const SERVICE_PACKAGE_NAME: &str = "Fabric_ServicePackageName";
    /// Code package name.
    pub const CODE_PACKAGE_NAME: &str = "Fabric_CodePackageName";
    /// Instance id of the code package activation.
    pub const CODE_PACKAGE_INSTANCE_ID: &str = "Fabric_CodePackageInstanceId";
    /// Address of the on-demand activation endpoint.
    pub const ACTIVATOR_ADDRESS: &str = "Fabric_ActivatorAddress";
    /// Networking mode of the instance.
    pub const NETWORKING_MODE: &str = "Fabric_NetworkingMode";
    /// Hosted service name, for node-level hosted services.
    pub const HOSTED_SERVICE_NAME: &str = "Fabric_HostedServiceName";
}

/// Prefix hosted-service names carry; stripped when deriving the job object
/// name.
const HOSTED_SERVICE_NAME_PREFIX: &str = "HostedService/";

/// JobObject/cgroup name for a hosted service.
pub fn hosted_service_job_object_name(service_name: &str) -> String {
    service_name
        .strip_prefix(HOSTED_SERVICE_NAME_PREFIX)
        .unwrap_or(service_name)
        .to_string()
}

/// Everything the process activator needs to start one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDescription {
    /// Program path, or container image for container hosts.
    pub exe_path: String,
    /// Command line arguments.
    pub arguments: Vec<String>,
    /// Directory the process starts in.
    pub working_folder: PathBuf,
    /// Directory console redirection writes to.
    pub log_folder: PathBuf,
    /// Per-instance scratch directory.
    pub work_folder: PathBuf,
    /// Per-instance temp directory.
    pub temp_folder: PathBuf,
    /// Merged environment block.
    pub environment: HashMap<String, String>,
    /// Resource governance applied to the instance.
    pub resource_governance: ResourceGovernancePolicyDescription,
    /// JobObject or cgroup name the instance is placed in.
    pub job_object_name: String,
    /// Deliver Ctrl-C instead of hard termination on deactivate.
    pub ctrl_c_on_exit: bool,
    /// Debugger attach parameters, test-only.
    pub debug_parameters: Option<DebugParametersDescription>,
    /// Container port bindings, container-port to host-port.
    pub port_bindings: HashMap<u16, u16>,
    /// Whether the instance is a container.
    pub is_container_host: bool,
    /// Container image, present when `is_container_host`.
    pub container_image: Option<String>,
}

/// Exit notification delivered by the process activator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitEvent {
    /// Raw exit code of the instance.
    pub exit_code: u32,
    /// When the instance ended.
    pub exited_at: DateTime<Utc>,
}

impl ExitEvent {
    /// Create an exit event stamped now.
    pub fn new(exit_code: u32) -> Self {
        Self {
            exit_code,
            exited_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_classification() {
        assert!(is_successful_exit(0));
        assert!(is_successful_exit(PROCESS_DEACTIVATE_EXIT_CODE));
        assert!(is_successful_exit(STATUS_CONTROL_C_EXIT));
        assert!(!is_successful_exit(1));
        assert!(!is_successful_exit(0xC000_0005));
    }

    #[test]
    fn test_job_object_name_strips_prefix() {
        assert_eq!(hosted_service_job_object_name("HostedService/FabricDCA"), "FabricDCA");
        assert_eq!(hosted_service_job_object_name("FabricDCA"), "FabricDCA");
    }
}
