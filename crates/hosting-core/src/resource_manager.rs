//! Per-node CPU and memory admission for service packages.
//!
//! Cores are tracked as integers scaled by [`CPU_CORRECTION_FACTOR`] so
//! fractional-core arithmetic never drifts; admission compares and commits
//! scaled deltas atomically under one lock.

use crate::deps::{ActivatorClient, HealthReporter, HealthReportCode, MessageBus};
use crate::{Error, Result};
use hosting_model::{
    DigestedCodePackageDescription, HostingConfig, ResourceGovernancePolicyDescription,
    ServicePackageInstanceIdentifier, ServicePackageResourceGovernanceDescription,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Scaling factor applied to fractional cores before integer accounting.
pub const CPU_CORRECTION_FACTOR: u64 = 1_000_000;

/// Docker nano-cpus per core.
const DOCKER_NANO_CPU_MULTIPLIER: f64 = 1e9;

/// Default cgroup cfs period, microseconds.
const CGROUPS_CPU_PERIOD: f64 = 100_000.0;

/// JobObject CPU cycle budget representing one full machine.
#[cfg(not(unix))]
const JOB_OBJECT_CPU_CYCLES: f64 = 10_000.0;

/// Notification action carrying the node's cached container images.
const NODE_AVAILABLE_CONTAINER_IMAGES_ACTION: &str = "NodeAvailableContainerImages";

/// Health property used for capacity reports.
const RESOURCE_GOVERNANCE_PROPERTY: &str = "ResourceGovernance";

/// Declared and detected node capacities the manager derives its limits
/// from.
#[derive(Debug, Clone, Default)]
pub struct NodeCapacities {
    /// User-declared CPU capacity in cores; absent means unlimited.
    pub declared_cpu_cores: Option<f64>,
    /// User-declared memory capacity in MB; absent means unlimited.
    pub declared_memory_mb: Option<u64>,
    /// Detected physical core count.
    pub physical_cpu_cores: u64,
    /// Detected physical memory in MB.
    pub physical_memory_mb: u64,
}

struct LrmState {
    used_cores_scaled: u64,
    used_memory_mb: u64,
    registered: HashMap<ServicePackageInstanceIdentifier, ServicePackageResourceGovernanceDescription>,
    node_images: Vec<String>,
    // One-shot node-level warning, armed when declared capacity exceeds
    // physical capacity.
    capacity_mismatch_pending: bool,
}

/// Per-node admission control and CPU-share shaping for service packages.
pub struct LocalResourceManager {
    config: Arc<HostingConfig>,
    health: Arc<dyn HealthReporter>,
    activator_client: Arc<dyn ActivatorClient>,
    message_bus: Arc<dyn MessageBus>,
    // None means the resource is unlimited.
    available_cores_scaled: Option<u64>,
    available_memory_mb: Option<u64>,
    system_cpu_cores: u64,
    state: Mutex<LrmState>,
}

impl LocalResourceManager {
    /// Derive node limits from declared and detected capacities.
    ///
    /// With auto-detection enabled, declared capacities are overridden by
    /// the configured fraction of physical capacity; otherwise an absent
    /// declaration means the resource is unlimited.
    pub fn new(
        config: Arc<HostingConfig>,
        health: Arc<dyn HealthReporter>,
        activator_client: Arc<dyn ActivatorClient>,
        message_bus: Arc<dyn MessageBus>,
        capacities: NodeCapacities,
    ) -> Self {
        let mismatch = capacities
            .declared_cpu_cores
            .map(|declared| declared > capacities.physical_cpu_cores as f64)
            .unwrap_or(false)
            || capacities
                .declared_memory_mb
                .map(|declared| declared > capacities.physical_memory_mb)
                .unwrap_or(false);

        let (available_cores_scaled, available_memory_mb) = if config.auto_detect_available_resources
        {
            let cores = (capacities.physical_cpu_cores as f64
                * config.cpu_percentage_node_capacity
                * CPU_CORRECTION_FACTOR as f64) as u64;
            let memory = (capacities.physical_memory_mb as f64
                * config.memory_percentage_node_capacity) as u64;
            (Some(cores), Some(memory))
        } else {
            (
                capacities
                    .declared_cpu_cores
                    .map(|c| (c * CPU_CORRECTION_FACTOR as f64) as u64),
                capacities.declared_memory_mb,
            )
        };

        info!(
            "Resource manager limits: cores_scaled={:?}, memory_mb={:?}, physical_cores={}",
            available_cores_scaled, available_memory_mb, capacities.physical_cpu_cores
        );

        Self {
            config,
            health,
            activator_client,
            message_bus,
            available_cores_scaled,
            available_memory_mb,
            system_cpu_cores: capacities.physical_cpu_cores,
            state: Mutex::new(LrmState {
                used_cores_scaled: 0,
                used_memory_mb: 0,
                registered: HashMap::new(),
                node_images: Vec::new(),
                capacity_mismatch_pending: mismatch,
            }),
        }
    }

    /// Admit a service package: commit its CPU and memory deltas or reject.
    ///
    /// Re-registering the same instance with the same governance settings is
    /// an idempotent success; re-registering with different settings is a
    /// coding error (changes go through the upgrade path).
    pub fn register_service_package(
        &self,
        id: &ServicePackageInstanceIdentifier,
        rg: &ServicePackageResourceGovernanceDescription,
        application_name: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let report_cpu_not_defined = self.available_cores_scaled.is_none();
        let report_memory_not_defined = self.available_memory_mb.is_none();

        if !self.config.local_resource_manager_test_mode && rg.is_governed {
            if state.capacity_mismatch_pending {
                state.capacity_mismatch_pending = false;
                self.report_capacity_mismatch();
            }
            if report_cpu_not_defined || report_memory_not_defined {
                self.report_capacity_not_defined(
                    id,
                    application_name,
                    report_cpu_not_defined,
                    report_memory_not_defined,
                );
            }
        }

        if let Some(existing) = state.registered.get(id) {
            if existing != rg {
                warn!(
                    "Rejecting re-registration with changed governance: {} current={:?} new={:?}",
                    id, existing, rg
                );
                return Err(Error::ServicePackageAlreadyRegistered(id.to_string()));
            }
            debug!("Skipping registration, already registered: {}", id);
            return Ok(());
        }

        let cores_scaled = scale_cores(rg.cpu_cores);

        if let Some(available) = self.available_cores_scaled {
            let free = available.saturating_sub(state.used_cores_scaled);
            if cores_scaled > free {
                warn!(
                    "Unable to admit {}: requested {} cores, {} cores free",
                    id,
                    rg.cpu_cores,
                    free as f64 / CPU_CORRECTION_FACTOR as f64
                );
                return Err(Error::NotEnoughCpuForServicePackage {
                    requested_cores: rg.cpu_cores,
                    available_cores: free as f64 / CPU_CORRECTION_FACTOR as f64,
                });
            }
        }

        if let Some(available) = self.available_memory_mb {
            let free = available.saturating_sub(state.used_memory_mb);
            if rg.memory_in_mb > free {
                warn!(
                    "Unable to admit {}: requested {} MB, {} MB free",
                    id, rg.memory_in_mb, free
                );
                return Err(Error::NotEnoughMemoryForServicePackage {
                    requested_mb: rg.memory_in_mb,
                    available_mb: free,
                });
            }
        }

        state.used_cores_scaled += cores_scaled;
        state.used_memory_mb += rg.memory_in_mb;
        state.registered.insert(id.clone(), rg.clone());

        info!(
            "Registered {} with {} cores and {} MB; used_cores_scaled={}, used_memory_mb={}",
            id, rg.cpu_cores, rg.memory_in_mb, state.used_cores_scaled, state.used_memory_mb
        );
        Ok(())
    }

    /// Refund a service package's deltas. A governance description that does
    /// not match the registered one indicates a caller bug; the registered
    /// values are refunded regardless.
    pub fn unregister_service_package(
        &self,
        id: &ServicePackageInstanceIdentifier,
        rg: &ServicePackageResourceGovernanceDescription,
    ) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(registered) = state.registered.remove(id) else {
            debug!("Unregister of unknown service package ignored: {}", id);
            return;
        };

        if &registered != rg {
            warn!(
                "Unregister governance mismatch for {}: registered={:?} provided={:?}",
                id, registered, rg
            );
        }

        state.used_cores_scaled = state
            .used_cores_scaled
            .saturating_sub(scale_cores(registered.cpu_cores));
        state.used_memory_mb = state.used_memory_mb.saturating_sub(registered.memory_in_mb);

        info!(
            "Unregistered {}; used_cores_scaled={}, used_memory_mb={}",
            id, state.used_cores_scaled, state.used_memory_mb
        );
    }

    /// Shape the CPU policy of one code package inside its registered
    /// service package.
    ///
    /// The fraction of the package's cores given to the code package is its
    /// declared share over the sibling total; if any sibling declares zero
    /// shares the split is even. Containers outside a container group get
    /// nano-cpus; processes get a cfs quota (cgroups) or job-object shares.
    pub fn adjust_cpu_policies_for_code_package(
        &self,
        service_package_instance_id: &ServicePackageInstanceIdentifier,
        siblings: &[DigestedCodePackageDescription],
        rg: &mut ResourceGovernancePolicyDescription,
        is_container: bool,
        is_container_group: bool,
    ) {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        let Some(registered) = state.registered.get(service_package_instance_id) else {
            debug!(
                "CPU policy for {} ignored, service package {} not registered",
                rg.code_package_ref, service_package_instance_id
            );
            return;
        };

        let cores_allocated = registered.cpu_cores;
        if cores_allocated < 0.0001 {
            return;
        }

        let (fraction, is_defined) = cpu_fraction(siblings, rg.cpu_shares);

        if is_container && (!is_container_group || is_defined) {
            rg.nano_cpus = (fraction * cores_allocated * DOCKER_NANO_CPU_MULTIPLIER) as u64;
        } else {
            #[cfg(unix)]
            {
                // Undefined shares leave the code package ungoverned; the
                // service-package cgroup parent still bounds total usage.
                if is_defined {
                    rg.cpu_quota = (fraction * cores_allocated * CGROUPS_CPU_PERIOD) as u32;
                }
            }
            #[cfg(not(unix))]
            {
                let available_cores = self
                    .available_cores_scaled
                    .map(|s| s / CPU_CORRECTION_FACTOR)
                    .unwrap_or(u64::MAX);
                let denominator = available_cores.max(self.system_cpu_cores) as f64;
                let shares = fraction * JOB_OBJECT_CPU_CYCLES * (cores_allocated / denominator);
                rg.cpu_shares = shares as u32;
            }
        }

        debug!(
            "CPU policy after adjusting: {:?}, is_container={} is_container_group={}",
            rg, is_container, is_container_group
        );
    }

    /// Query the activator for locally cached container images and forward
    /// them for preferred-placement hinting. Skipped in test mode, when
    /// containers are disabled, or when the hinting feature is off.
    pub async fn refresh_available_container_images(&self) -> Result<()> {
        if self.config.local_resource_manager_test_mode
            || self.config.disable_containers
            || !self.config.prefer_nodes_for_container_placement
        {
            return Ok(());
        }

        let images = self.activator_client.get_node_container_images().await?;
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.node_images = images.clone();
        }

        self.message_bus
            .notify(
                NODE_AVAILABLE_CONTAINER_IMAGES_ACTION,
                serde_json::json!({ "images": images }),
            )
            .await
    }

    /// Run the periodic image refresh until the returned task is dropped.
    /// Failed refreshes back off exponentially up to the refresh interval.
    pub fn spawn_image_refresh_loop(self: Arc<Self>) -> smol::Task<()> {
        let this = self;
        smol::spawn(async move {
            let mut failures: u32 = 0;
            loop {
                let delay = match this.refresh_available_container_images().await {
                    Ok(()) => {
                        failures = 0;
                        this.config.node_available_container_images_refresh_interval()
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        warn!("Container image refresh failed: {}", e);
                        this.config
                            .node_available_container_images_backoff()
                            .saturating_mul(failures)
                            .min(this.config.node_available_container_images_refresh_interval())
                    }
                };
                smol::Timer::after(delay).await;
            }
        })
    }

    /// Scaled cores currently committed.
    pub fn used_cores_scaled(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).used_cores_scaled
    }

    /// Memory currently committed, MB.
    pub fn used_memory_mb(&self) -> u64 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).used_memory_mb
    }

    /// Number of registered service package instances.
    pub fn registered_count(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).registered.len()
    }

    /// Most recent container image snapshot.
    pub fn node_images(&self) -> Vec<String> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).node_images.clone()
    }

    /// Detected physical core count.
    pub fn system_cpu_cores(&self) -> u64 {
        self.system_cpu_cores
    }

    fn report_capacity_mismatch(&self) {
        let sequence = 0; // node-level one-shot, sequence is informational
        if let Err(e) = self.health.report(
            "node",
            RESOURCE_GOVERNANCE_PROPERTY,
            HealthReportCode::AvailableResourceCapacityMismatch,
            "Declared node capacity exceeds detected physical capacity",
            sequence,
        ) {
            warn!("Failed to report capacity mismatch: {}", e);
        }
    }

    fn report_capacity_not_defined(
        &self,
        id: &ServicePackageInstanceIdentifier,
        application_name: &str,
        cpu_not_defined: bool,
        memory_not_defined: bool,
    ) {
        let key = id.to_string();
        if let Err(e) =
            self.health
                .register_source(&key, application_name, RESOURCE_GOVERNANCE_PROPERTY)
        {
            warn!("Failed to register capacity report source for {}: {}", id, e);
            return;
        }

        let mut missing = Vec::new();
        if cpu_not_defined {
            missing.push("CPU");
        }
        if memory_not_defined {
            missing.push("memory");
        }
        let description = format!(
            "Package requests resource governance but node capacity is not defined for: {}",
            missing.join(", ")
        );

        if let Err(e) = self.health.report(
            &key,
            RESOURCE_GOVERNANCE_PROPERTY,
            HealthReportCode::AvailableResourceCapacityNotDefined,
            &description,
            0,
        ) {
            warn!("Failed to report undefined capacity for {}: {}", id, e);
        }
    }
}

fn scale_cores(cores: f64) -> u64 {
    (cores * CPU_CORRECTION_FACTOR as f64) as u64
}

/// Fraction of the service package's cores for a code package with the
/// given shares, and whether the shares were explicitly defined.
fn cpu_fraction(
    siblings: &[DigestedCodePackageDescription],
    cpu_shares: u32,
) -> (f64, bool) {
    let mut total: u64 = 0;
    for sibling in siblings {
        if sibling.resource_governance_policy.cpu_shares == 0 {
            total = 0;
            break;
        }
        total += u64::from(sibling.resource_governance_policy.cpu_shares);
    }

    if total > 0 {
        (f64::from(cpu_shares) / total as f64, true)
    } else {
        (1.0 / siblings.len().max(1) as f64, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeActivatorClient, FakeHealthReporter, FakeMessageBus};
    use hosting_model::{
        ApplicationIdentifier, EntryPointDescription, ServicePackageIdentifier, WorkingFolder,
    };

    fn sp_instance(n: u64) -> ServicePackageInstanceIdentifier {
        ServicePackageInstanceIdentifier::shared(ServicePackageIdentifier::new(
            ApplicationIdentifier::new("App", n),
            "Pkg",
        ))
    }

    fn governed(cores: f64, memory: u64) -> ServicePackageResourceGovernanceDescription {
        ServicePackageResourceGovernanceDescription {
            is_governed: true,
            cpu_cores: cores,
            memory_in_mb: memory,
        }
    }

    fn manager(declared_cores: f64, declared_memory: u64) -> LocalResourceManager {
        let config = HostingConfig {
            auto_detect_available_resources: false,
            local_resource_manager_test_mode: true,
            ..Default::default()
        };
        LocalResourceManager::new(
            Arc::new(config),
            Arc::new(FakeHealthReporter::new()),
            Arc::new(FakeActivatorClient::new()),
            Arc::new(FakeMessageBus::new()),
            NodeCapacities {
                declared_cpu_cores: Some(declared_cores),
                declared_memory_mb: Some(declared_memory),
                physical_cpu_cores: 8,
                physical_memory_mb: 16_384,
            },
        )
    }

    fn digested(name: &str, shares: u32) -> DigestedCodePackageDescription {
        DigestedCodePackageDescription {
            name: name.to_string(),
            version: "1.0".to_string(),
            rollout_version: hosting_model::RolloutVersion::new(1, 0),
            is_shared: false,
            is_activator: false,
            entry_point: EntryPointDescription::Exe {
                program: "svc".to_string(),
                arguments: vec![],
                working_folder: WorkingFolder::Work,
                console_redirection: false,
            },
            setup_entry_point: None,
            run_as_policy: None,
            setup_run_as_policy: None,
            debug_parameters: None,
            resource_governance_policy: ResourceGovernancePolicyDescription {
                code_package_ref: name.to_string(),
                cpu_shares: shares,
                ..Default::default()
            },
            container_policies: None,
            run_interval_secs: 0,
        }
    }

    #[test]
    fn test_overcommit_is_rejected_then_admitted_after_refund() {
        let lrm = manager(4.0, 8_192);
        let sp1 = sp_instance(1);
        let sp2 = sp_instance(2);

        lrm.register_service_package(&sp1, &governed(3.0, 1_024), "/app/1").unwrap();
        let denied = lrm.register_service_package(&sp2, &governed(2.0, 1_024), "/app/2");
        assert!(matches!(denied, Err(Error::NotEnoughCpuForServicePackage { .. })));

        lrm.unregister_service_package(&sp1, &governed(3.0, 1_024));
        lrm.register_service_package(&sp2, &governed(2.0, 1_024), "/app/2").unwrap();
        assert_eq!(lrm.used_cores_scaled(), 2 * CPU_CORRECTION_FACTOR);
    }

    #[test]
    fn test_exact_fit_succeeds_one_unit_over_fails() {
        let lrm = manager(4.0, 1_000);
        let sp1 = sp_instance(1);
        lrm.register_service_package(&sp1, &governed(4.0, 1_000), "/app/1").unwrap();

        let sp2 = sp_instance(2);
        let denied = lrm.register_service_package(&sp2, &governed(0.000001, 0), "/app/2");
        assert!(matches!(denied, Err(Error::NotEnoughCpuForServicePackage { .. })));
    }

    #[test]
    fn test_register_is_idempotent_but_rejects_changed_settings() {
        let lrm = manager(4.0, 8_192);
        let sp = sp_instance(1);
        let rg = governed(1.5, 512);

        lrm.register_service_package(&sp, &rg, "/app/1").unwrap();
        lrm.register_service_package(&sp, &rg, "/app/1").unwrap();
        assert_eq!(lrm.used_cores_scaled(), 1_500_000);
        assert_eq!(lrm.registered_count(), 1);

        let changed = governed(2.0, 512);
        let denied = lrm.register_service_package(&sp, &changed, "/app/1");
        assert!(matches!(denied, Err(Error::ServicePackageAlreadyRegistered(_))));
    }

    #[test]
    fn test_unregister_restores_counters_exactly() {
        let lrm = manager(4.0, 8_192);
        let sp = sp_instance(1);
        let rg = governed(2.5, 3_000);
        lrm.register_service_package(&sp, &rg, "/app/1").unwrap();
        lrm.unregister_service_package(&sp, &rg);
        assert_eq!(lrm.used_cores_scaled(), 0);
        assert_eq!(lrm.used_memory_mb(), 0);
        assert_eq!(lrm.registered_count(), 0);
    }

    #[test]
    fn test_memory_admission() {
        let lrm = manager(8.0, 1_024);
        let sp1 = sp_instance(1);
        lrm.register_service_package(&sp1, &governed(1.0, 1_024), "/app/1").unwrap();
        let denied = lrm.register_service_package(&sp_instance(2), &governed(1.0, 1), "/app/2");
        assert!(matches!(denied, Err(Error::NotEnoughMemoryForServicePackage { .. })));
    }

    #[test]
    fn test_container_nano_cpus_shaping() {
        let lrm = manager(4.0, 8_192);
        let sp = sp_instance(1);
        lrm.register_service_package(&sp, &governed(2.0, 0), "/app/1").unwrap();

        let siblings = vec![digested("a", 3), digested("b", 1)];
        let mut rg = siblings[0].resource_governance_policy.clone();
        lrm.adjust_cpu_policies_for_code_package(&sp, &siblings, &mut rg, true, false);
        // 3/4 of 2 cores.
        assert_eq!(rg.nano_cpus, 1_500_000_000);
    }

    #[cfg(unix)]
    #[test]
    fn test_process_cfs_quota_shaping() {
        let lrm = manager(4.0, 8_192);
        let sp = sp_instance(1);
        lrm.register_service_package(&sp, &governed(2.0, 0), "/app/1").unwrap();

        let siblings = vec![digested("a", 1), digested("b", 1)];
        let mut rg = siblings[0].resource_governance_policy.clone();
        lrm.adjust_cpu_policies_for_code_package(&sp, &siblings, &mut rg, false, false);
        // Half of 2 cores at a 100ms period.
        assert_eq!(rg.cpu_quota, 100_000);
    }

    #[test]
    fn test_undefined_shares_split_evenly_for_containers() {
        let lrm = manager(4.0, 8_192);
        let sp = sp_instance(1);
        lrm.register_service_package(&sp, &governed(2.0, 0), "/app/1").unwrap();

        let siblings = vec![digested("a", 0), digested("b", 5)];
        let mut rg = siblings[1].resource_governance_policy.clone();
        lrm.adjust_cpu_policies_for_code_package(&sp, &siblings, &mut rg, true, false);
        // Even split: 1 core each.
        assert_eq!(rg.nano_cpus, 1_000_000_000);
    }

    #[test]
    fn test_unregistered_service_package_is_ignored_for_shaping() {
        let lrm = manager(4.0, 8_192);
        let siblings = vec![digested("a", 1)];
        let mut rg = siblings[0].resource_governance_policy.clone();
        lrm.adjust_cpu_policies_for_code_package(&sp_instance(9), &siblings, &mut rg, true, false);
        assert_eq!(rg.nano_cpus, 0);
    }

    #[test]
    fn test_undefined_capacity_reports_per_governed_package() {
        let config = HostingConfig {
            auto_detect_available_resources: false,
            local_resource_manager_test_mode: false,
            ..Default::default()
        };
        let health = Arc::new(FakeHealthReporter::new());
        let lrm = LocalResourceManager::new(
            Arc::new(config),
            health.clone(),
            Arc::new(FakeActivatorClient::new()),
            Arc::new(FakeMessageBus::new()),
            NodeCapacities {
                declared_cpu_cores: None,
                declared_memory_mb: None,
                physical_cpu_cores: 8,
                physical_memory_mb: 16_384,
            },
        );

        // Undeclared capacity means unlimited: admission succeeds, but each
        // governed package gets a warning.
        lrm.register_service_package(&sp_instance(1), &governed(100.0, 1 << 20), "/app/1").unwrap();
        assert_eq!(
            health.count_of(crate::deps::HealthReportCode::AvailableResourceCapacityNotDefined),
            1
        );
    }

    #[test]
    fn test_capacity_mismatch_reported_once() {
        let config = HostingConfig {
            auto_detect_available_resources: false,
            local_resource_manager_test_mode: false,
            ..Default::default()
        };
        let health = Arc::new(FakeHealthReporter::new());
        let lrm = LocalResourceManager::new(
            Arc::new(config),
            health.clone(),
            Arc::new(FakeActivatorClient::new()),
            Arc::new(FakeMessageBus::new()),
            NodeCapacities {
                // Declared above what the node physically has.
                declared_cpu_cores: Some(16.0),
                declared_memory_mb: Some(8_192),
                physical_cpu_cores: 8,
                physical_memory_mb: 16_384,
            },
        );

        lrm.register_service_package(&sp_instance(1), &governed(1.0, 128), "/app/1").unwrap();
        lrm.register_service_package(&sp_instance(2), &governed(1.0, 128), "/app/2").unwrap();
        assert_eq!(
            health.count_of(crate::deps::HealthReportCode::AvailableResourceCapacityMismatch),
            1
        );
    }

    #[smol_potat::test]
    async fn test_image_refresh_publishes_node_images() {
        let config = HostingConfig {
            auto_detect_available_resources: false,
            local_resource_manager_test_mode: false,
            prefer_nodes_for_container_placement: true,
            ..Default::default()
        };
        let activator_client = Arc::new(FakeActivatorClient::new());
        activator_client.set_images(vec!["nginx:1".to_string(), "redis:7".to_string()]);
        let message_bus = Arc::new(FakeMessageBus::new());
        let lrm = LocalResourceManager::new(
            Arc::new(config),
            Arc::new(FakeHealthReporter::new()),
            activator_client,
            message_bus.clone(),
            NodeCapacities {
                declared_cpu_cores: Some(8.0),
                declared_memory_mb: Some(8_192),
                physical_cpu_cores: 8,
                physical_memory_mb: 8_192,
            },
        );

        lrm.refresh_available_container_images().await.unwrap();
        assert_eq!(lrm.node_images(), vec!["nginx:1", "redis:7"]);
        assert_eq!(message_bus.count_of("NodeAvailableContainerImages"), 1);
    }

    #[smol_potat::test]
    async fn test_image_refresh_skipped_in_test_mode() {
        let lrm = manager(4.0, 8_192);
        lrm.refresh_available_container_images().await.unwrap();
        assert!(lrm.node_images().is_empty());
    }
}
