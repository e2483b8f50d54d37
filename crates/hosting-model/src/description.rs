//! Immutable per-version package descriptions.
//!
//! These mirror the digested manifest content the download subsystem hands
//! over: one description per service package version, carrying the ordered
//! digested code packages plus the resource-governance and service-type
//! declarations the lifecycle engine consumes.

use crate::version::RolloutVersion;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Digested description of one service package at one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePackageDescription {
    /// Manifest version string.
    pub manifest_version: String,
    /// Checksum over the digested content; equal checksums mean a switch is
    /// a version-update only.
    pub content_checksum: String,
    /// Ordered digested code packages.
    pub digested_code_packages: Vec<DigestedCodePackageDescription>,
    /// Digested config packages (name + rollout version).
    pub digested_config_packages: Vec<DigestedDataPackageDescription>,
    /// Digested data packages (name + rollout version).
    pub digested_data_packages: Vec<DigestedDataPackageDescription>,
    /// Declared endpoint resources.
    pub endpoints: Vec<EndpointResourceDescription>,
    /// Declared service types.
    pub service_types: Vec<ServiceTypeDescription>,
    /// Package-level resource governance totals.
    pub resource_governance: ServicePackageResourceGovernanceDescription,
    /// Whether the package uses the replicated block store for guest state.
    pub uses_replicated_store: bool,
    /// Whether the package requested DNS integration.
    pub requests_dns: bool,
    /// ETW provider guids for diagnostics collection.
    pub etw_provider_guids: Vec<uuid::Uuid>,
}

impl ServicePackageDescription {
    /// Find a digested code package by name.
    pub fn find_code_package(&self, name: &str) -> Option<&DigestedCodePackageDescription> {
        self.digested_code_packages.iter().find(|cp| cp.name == name)
    }

    /// The explicit activator code package, if the manifest declares one.
    pub fn activator_code_package(&self) -> Option<&DigestedCodePackageDescription> {
        self.digested_code_packages.iter().find(|cp| cp.is_activator)
    }

    /// Whether any declared service type is hosted by the implicit type host.
    pub fn has_guest_service_types(&self) -> bool {
        self.service_types.iter().any(|st| st.use_implicit_host)
    }
}

/// Name and rollout version of a digested config/data package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestedDataPackageDescription {
    /// Package name.
    pub name: String,
    /// Rollout version.
    pub rollout_version: RolloutVersion,
}

/// Digested description of one code package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestedCodePackageDescription {
    /// Code package name.
    pub name: String,
    /// Manifest version string of the code package.
    pub version: String,
    /// Rollout version driving upgrade diffing.
    pub rollout_version: RolloutVersion,
    /// Whether the binaries are shared across applications.
    pub is_shared: bool,
    /// Whether this code package gates on-demand activation of its siblings.
    pub is_activator: bool,
    /// Main entry point.
    pub entry_point: EntryPointDescription,
    /// Optional setup entry point run before the main one.
    pub setup_entry_point: Option<EntryPointDescription>,
    /// Identity the main entry point runs as.
    pub run_as_policy: Option<RunAsPolicyDescription>,
    /// Identity the setup entry point runs as.
    pub setup_run_as_policy: Option<RunAsPolicyDescription>,
    /// Debugger attach parameters, test-only.
    pub debug_parameters: Option<DebugParametersDescription>,
    /// Per-code-package resource governance policy.
    pub resource_governance_policy: ResourceGovernancePolicyDescription,
    /// Container runtime policies, present for container entry points.
    pub container_policies: Option<ContainerPoliciesDescription>,
    /// Periodic run interval in seconds; zero means run continuously.
    pub run_interval_secs: u64,
}

/// How a code package is launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPointDescription {
    /// An executable started as a child process.
    Exe {
        /// Program path, relative to the code folder unless absolute.
        program: String,
        /// Command line arguments.
        arguments: Vec<String>,
        /// Which folder the process starts in.
        working_folder: WorkingFolder,
        /// Whether console output is redirected to the log folder.
        console_redirection: bool,
    },
    /// A container image started through the container runtime.
    Container {
        /// Image reference.
        image: String,
        /// Command override.
        commands: Vec<String>,
        /// Entry point override.
        entry_point: Option<String>,
        /// Isolation hint passed through to the runtime.
        isolation: Option<String>,
    },
}

impl EntryPointDescription {
    /// Whether this entry point runs in a container.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Container { .. })
    }
}

/// Folder a process entry point starts in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkingFolder {
    /// The per-instance work folder.
    #[default]
    Work,
    /// The code package folder.
    CodePackage,
    /// The code base folder shared across versions.
    CodeBase,
}

/// Identity a process runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAsPolicyDescription {
    /// Account name resolved by the environment manager.
    pub user_name: String,
}

/// Debugger attach parameters for a code package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DebugParametersDescription {
    /// Replacement program to launch instead of the declared entry point.
    pub exe_path: Option<String>,
    /// Replacement arguments.
    pub arguments: Option<String>,
    /// Lock file whose presence skips activation.
    pub lock_file: Option<String>,
    /// Extra environment for the debugged process.
    pub environment: HashMap<String, String>,
}

/// Container policies attached to a code package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainerPoliciesDescription {
    /// Port bindings from container port to declared endpoint.
    pub port_bindings: Vec<PortBinding>,
    /// Labels stamped on the container.
    pub labels: Vec<ContainerLabel>,
    /// Volume mounts.
    pub mounts: Vec<VolumeMount>,
    /// Certificates exported into the container.
    pub certificates: Vec<ContainerCertificateDescription>,
    /// Whether the container joins a container group with shared governance.
    pub is_container_group_member: bool,
    /// Docker health-check integration, if enabled.
    pub health_config: Option<ContainerHealthConfig>,
}

/// One container port binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port inside the container.
    pub container_port: u16,
    /// Endpoint resource name supplying the host port.
    pub endpoint_name: String,
}

/// One container label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLabel {
    /// Label name.
    pub name: String,
    /// Label value.
    pub value: String,
}

/// One container volume mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host source path or volume name.
    pub source: String,
    /// Destination path inside the container.
    pub destination: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// A certificate exported into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerCertificateDescription {
    /// Logical certificate name.
    pub name: String,
    /// Source reference (store thumbprint or data package path).
    pub source: String,
    /// Secret holding the private-key password, if any.
    pub password_secret: Option<String>,
}

/// Docker health-check integration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerHealthConfig {
    /// Surface docker health status as system health reports.
    pub include_docker_health_status_in_system_health_report: bool,
    /// Restart the container when docker reports it unhealthy.
    pub restart_container_on_unhealthy_docker_health_status: bool,
}

/// A declared endpoint resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointResourceDescription {
    /// Endpoint name referenced by port bindings.
    pub name: String,
    /// Protocol (http, tcp, ...).
    pub protocol: String,
    /// Assigned port; zero asks the environment manager to allocate one.
    pub port: u16,
}

/// A declared service type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTypeDescription {
    /// Service type name.
    pub service_type_name: String,
    /// Hosted by the implicit type host rather than user code.
    pub use_implicit_host: bool,
    /// Whether the type is stateful.
    pub is_stateful: bool,
}

/// Package-level resource governance totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServicePackageResourceGovernanceDescription {
    /// Whether the package declares governed resources at all.
    pub is_governed: bool,
    /// Total CPU cores requested, fractional cores allowed.
    pub cpu_cores: f64,
    /// Total memory requested in MB.
    pub memory_in_mb: u64,
}

/// Per-code-package resource governance policy.
///
/// `cpu_shares` comes from the manifest; `cpu_quota` and `nano_cpus` are
/// computed by the local resource manager when shaping the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceGovernancePolicyDescription {
    /// Code package this policy applies to.
    pub code_package_ref: String,
    /// Relative CPU weight among sibling code packages.
    pub cpu_shares: u32,
    /// Computed cgroup cfs quota, microseconds per period.
    pub cpu_quota: u32,
    /// Computed docker nano-cpus value.
    pub nano_cpus: u64,
    /// Memory limit in MB; zero means unlimited.
    pub memory_in_mb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code_package(name: &str, is_activator: bool) -> DigestedCodePackageDescription {
        DigestedCodePackageDescription {
            name: name.to_string(),
            version: "1.0".to_string(),
            rollout_version: RolloutVersion::new(1, 0),
            is_shared: false,
            is_activator,
            entry_point: EntryPointDescription::Exe {
                program: "svc.exe".to_string(),
                arguments: vec![],
                working_folder: WorkingFolder::Work,
                console_redirection: false,
            },
            setup_entry_point: None,
            run_as_policy: None,
            setup_run_as_policy: None,
            debug_parameters: None,
            resource_governance_policy: ResourceGovernancePolicyDescription::default(),
            container_policies: None,
            run_interval_secs: 0,
        }
    }

    fn description(cps: Vec<DigestedCodePackageDescription>) -> ServicePackageDescription {
        ServicePackageDescription {
            manifest_version: "1.0".to_string(),
            content_checksum: "abc".to_string(),
            digested_code_packages: cps,
            digested_config_packages: vec![],
            digested_data_packages: vec![],
            endpoints: vec![],
            service_types: vec![],
            resource_governance: ServicePackageResourceGovernanceDescription::default(),
            uses_replicated_store: false,
            requests_dns: false,
            etw_provider_guids: vec![],
        }
    }

    #[test]
    fn test_activator_lookup() {
        let desc = description(vec![code_package("a", false), code_package("b", true)]);
        assert_eq!(desc.activator_code_package().unwrap().name, "b");
        assert!(desc.find_code_package("a").is_some());
        assert!(desc.find_code_package("missing").is_none());
    }

    #[test]
    fn test_guest_service_type_detection() {
        let mut desc = description(vec![code_package("a", false)]);
        assert!(!desc.has_guest_service_types());
        desc.service_types.push(ServiceTypeDescription {
            service_type_name: "GuestType".to_string(),
            use_implicit_host: true,
            is_stateful: false,
        });
        assert!(desc.has_guest_service_types());
    }

    #[test]
    fn test_description_yaml_round_trip() {
        let desc = description(vec![code_package("a", false)]);
        let yaml = serde_yaml::to_string(&desc).expect("serialize");
        let back: ServicePackageDescription = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(desc, back);
    }
}
