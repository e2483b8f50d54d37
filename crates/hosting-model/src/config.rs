//! Node-wide hosting configuration.
//!
//! Configuration is read-mostly: components hold an `Arc<HostingConfig>`
//! snapshot and re-read it at the start of each operation. Interval fields
//! are stored as plain integers for config-file friendliness, with accessor
//! methods returning `Duration`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration snapshot for the hosting subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostingConfig {
    /// Timeout for a single activation/deactivation operation, seconds.
    pub activation_timeout_secs: u64,
    /// Activation timeout override for the system file-store package,
    /// seconds.
    pub fss_activation_timeout_secs: u64,
    /// Upper bound on the time a rolling upgrade may take, seconds.
    pub application_upgrade_timeout_secs: u64,
    /// Base backoff between activation retries, milliseconds.
    pub activation_retry_backoff_millis: u64,
    /// Cap on the computed retry backoff, seconds.
    pub activation_max_retry_interval_secs: u64,
    /// Continuous-failure cap after which a code package stops retrying.
    pub activation_max_failure_count: u32,
    /// A process alive longer than this resets its continuous exit-failure
    /// counter, seconds.
    pub continuous_exit_failure_reset_interval_secs: u64,
    /// How long a declared service type may stay unregistered before
    /// lookups treat it as authoritatively missing, seconds.
    pub service_type_registration_timeout_secs: u64,
    /// Continuous failures per failure id before a service type is
    /// disabled.
    pub service_type_disable_failure_threshold: u32,
    /// Continuous failures of a deployed service package before the type
    /// host is forcibly terminated.
    pub deployed_service_failover_continuous_failure_threshold: u32,
    /// Host guest service types in-process for exclusive instances.
    pub host_guest_service_type_in_proc: bool,
    /// Opt stateless guest applications out of on-demand activation.
    pub disable_on_demand_activation_for_stateless_guest_app: bool,
    /// Override declared node capacities with detected physical capacity.
    pub auto_detect_available_resources: bool,
    /// Fraction of detected CPU capacity made available when auto-detect is
    /// on.
    pub cpu_percentage_node_capacity: f64,
    /// Fraction of detected memory capacity made available when auto-detect
    /// is on.
    pub memory_percentage_node_capacity: f64,
    /// Disables capacity health reports and image refresh, test runs only.
    pub local_resource_manager_test_mode: bool,
    /// Disables container integration on the node.
    pub disable_containers: bool,
    /// Send locally cached container images for placement hinting.
    pub prefer_nodes_for_container_placement: bool,
    /// Interval between container-image refreshes, seconds.
    pub node_available_container_images_refresh_interval_secs: u64,
    /// Base backoff after a failed container-image refresh, seconds.
    pub node_available_container_images_backoff_secs: u64,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            activation_timeout_secs: 180,
            fss_activation_timeout_secs: 900,
            application_upgrade_timeout_secs: 360,
            activation_retry_backoff_millis: 5_000,
            activation_max_retry_interval_secs: 300,
            activation_max_failure_count: 10,
            continuous_exit_failure_reset_interval_secs: 300,
            service_type_registration_timeout_secs: 300,
            service_type_disable_failure_threshold: 1,
            deployed_service_failover_continuous_failure_threshold: 3,
            host_guest_service_type_in_proc: true,
            disable_on_demand_activation_for_stateless_guest_app: false,
            auto_detect_available_resources: true,
            cpu_percentage_node_capacity: 0.8,
            memory_percentage_node_capacity: 0.8,
            local_resource_manager_test_mode: false,
            disable_containers: false,
            prefer_nodes_for_container_placement: false,
            node_available_container_images_refresh_interval_secs: 3_600,
            node_available_container_images_backoff_secs: 10,
        }
    }
}

impl HostingConfig {
    /// Parse a configuration snapshot from YAML; absent fields default.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Activation timeout.
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    /// Activation timeout for the system file-store package.
    pub fn fss_activation_timeout(&self) -> Duration {
        Duration::from_secs(self.fss_activation_timeout_secs)
    }

    /// Rolling-upgrade deadline.
    pub fn application_upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.application_upgrade_timeout_secs)
    }

    /// Base retry backoff.
    pub fn activation_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.activation_retry_backoff_millis)
    }

    /// Retry backoff cap.
    pub fn activation_max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.activation_max_retry_interval_secs)
    }

    /// Continuous exit-failure reset interval.
    pub fn continuous_exit_failure_reset_interval(&self) -> Duration {
        Duration::from_secs(self.continuous_exit_failure_reset_interval_secs)
    }

    /// Service-type registration timeout.
    pub fn service_type_registration_timeout(&self) -> Duration {
        Duration::from_secs(self.service_type_registration_timeout_secs)
    }

    /// Container-image refresh interval.
    pub fn node_available_container_images_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.node_available_container_images_refresh_interval_secs)
    }

    /// Container-image refresh backoff base.
    pub fn node_available_container_images_backoff(&self) -> Duration {
        Duration::from_secs(self.node_available_container_images_backoff_secs)
    }

    /// Bounded exponential retry delay: `min(cap, base * failure_count)`,
    /// never below the base interval.
    pub fn retry_due_time(&self, failure_count: u32) -> Duration {
        let base = self.activation_retry_backoff();
        let cap = self.activation_max_retry_interval();
        let scaled = base.saturating_mul(failure_count.max(1));
        scaled.min(cap)
    }
}
