//! Version-instance orchestrator for one service package instance.
//!
//! Presents a single transactional lifecycle across the instance's code
//! packages: open brings the environment and every required code package up,
//! switch rolls between versions while minimising restarts, close drains and
//! tears everything down. For on-demand activation packages the activator
//! code package gates the lifetime of its dependents; its termination drains
//! outstanding operations and aborts them.

use crate::code_package::CodePackage;
use crate::context::HostingContext;
use crate::deps::{EnvironmentContext, HealthReportCode};
use crate::state::StateMachine;
use crate::{Error, Result};
use futures::future::join_all;
use hosting_model::{
    CodePackageOperationRequest, CodePackageOperationType, ContainerHealthStatusInfo,
    DigestedCodePackageDescription, EntryPointDescription, ResourceGovernancePolicyDescription,
    RolloutVersion, ServicePackageDescription, ServicePackageInstanceIdentifier,
    ServicePackageVersion, ServicePackageVersionInstance, ServiceTypeInstanceIdentifier,
    WorkingFolder,
};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Health property the activation lifecycle reports under.
const HEALTH_PROPERTY_ACTIVATION: &str = "Activation";

/// Marker file recording the active rollout version; its presence means the
/// instance is open.
const CURRENT_PACKAGE_FILE: &str = "Current.ServicePackage";

/// Name of the synthesized type host code package.
const IMPLICIT_TYPE_HOST_NAME: &str = "ImplicitTypeHost";

/// Type host variant backed by the replicated block store.
const BLOCK_STORE_TYPE_HOST_NAME: &str = "BlockStoreTypeHost";

/// System service package names with special open handling.
pub(crate) const FILE_STORE_SERVICE_PACKAGE: &str = "FileStoreService";
const DNS_SERVICE_PACKAGE: &str = "DnsService";

/// Action publishing dependent code package events to application hosts.
const DEPENDENT_CODE_PACKAGE_EVENT_ACTION: &str = "DependentCodePackageEvent";

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_EXECUTE: u32 = 0x2000_0000;
const GENERIC_ALL: u32 = 0x1000_0000;

// On-demand operations retry denied transitions on this ladder.
const MODIFY_RETRY_BASE: Duration = Duration::from_millis(500);
const MODIFY_RETRY_CAP: Duration = Duration::from_secs(5);

/// Lifecycle states of a versioned service package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VspState {
    /// Constructed, nothing set up.
    Created,
    /// Open in progress.
    Opening,
    /// Fully activated.
    Opened,
    /// A version switch is in progress.
    Switching,
    /// An upgrade dry-run is reading state.
    Analyzing,
    /// An on-demand code package operation is in progress.
    Modifying,
    /// Close in progress.
    Closing,
    /// Terminal: closed cleanly.
    Closed,
    /// Terminal: open or switch failed.
    Failed,
    /// Terminal: aborted.
    Aborted,
}

/// Result of an upgrade impact dry-run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpgradeImpact {
    /// Runtime ids that will observably restart.
    pub affected_runtime_ids: Vec<String>,
    /// Code package names contributing the restarts.
    pub affected_code_packages: Vec<String>,
    /// Whether package-level resource governance changed.
    pub has_resource_governance_change: bool,
}

struct VspShared {
    current_version_instance: ServicePackageVersionInstance,
    description: ServicePackageDescription,
    environment: Option<EnvironmentContext>,
    service_type_instance_ids: Vec<ServiceTypeInstanceIdentifier>,
}

#[derive(Default)]
struct TrackerInner {
    pending: HashSet<u64>,
    draining: bool,
    waiters: Vec<async_channel::Sender<()>>,
}

/// Tracks outstanding on-demand operations so activator termination can
/// block new ones and drain the rest.
#[derive(Default)]
struct OperationTracker {
    inner: Mutex<TrackerInner>,
}

impl OperationTracker {
    fn try_track(&self, operation_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.draining {
            return false;
        }
        inner.pending.insert(operation_id);
        true
    }

    fn untrack(&self, operation_id: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.remove(&operation_id);
        if inner.pending.is_empty() && inner.draining {
            for waiter in inner.waiters.drain(..) {
                let _ = waiter.try_send(());
            }
        }
    }

    async fn begin_drain(&self) {
        let receiver = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.draining = true;
            if inner.pending.is_empty() {
                None
            } else {
                let (tx, rx) = async_channel::bounded(1);
                inner.waiters.push(tx);
                Some(rx)
            }
        };
        if let Some(rx) = receiver {
            let _ = rx.recv().await;
        }
    }

    fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.draining = false;
    }
}

/// Remembers when service type registrations last became expectable.
struct RegistrationTimeoutTracker {
    last_reset: RwLock<Instant>,
}

impl RegistrationTimeoutTracker {
    fn new() -> Self {
        Self {
            last_reset: RwLock::new(Instant::now()),
        }
    }

    fn reset(&self) {
        *self.last_reset.write().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn expired(&self, timeout: Duration) -> bool {
        self.last_reset
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
            > timeout
    }
}

/// Remaining-time helper shared by the multi-step operations.
#[derive(Clone, Copy)]
pub(crate) struct Deadline {
    at: Instant,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub(crate) fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub(crate) fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

struct OnDemandInfo {
    is_on_demand: bool,
    is_guest_application: bool,
    activator_name: Option<String>,
    activator_rollout_version: Option<RolloutVersion>,
}

/// One service package instance at its current version.
pub struct VersionedServicePackage {
    ctx: Arc<HostingContext>,
    weak_self: std::sync::Weak<VersionedServicePackage>,
    id: ServicePackageInstanceIdentifier,
    instance_id: u64,
    application_name: String,
    failure_id: String,
    state: StateMachine<VspState>,
    shared: RwLock<VspShared>,
    active_code_packages: RwLock<HashMap<String, Arc<CodePackage>>>,
    activator_code_package_name: Option<String>,
    activator_rollout_version: Option<RolloutVersion>,
    activator_instance_id: RwLock<i64>,
    is_on_demand_activation_enabled: bool,
    is_guest_application: bool,
    tracker: OperationTracker,
    registration_tracker: RegistrationTimeoutTracker,
}

impl VersionedServicePackage {
    /// Create an instance at the given version; nothing is activated until
    /// [`open`](Self::open).
    pub fn new(
        ctx: Arc<HostingContext>,
        id: ServicePackageInstanceIdentifier,
        instance_id: u64,
        application_name: String,
        version_instance: ServicePackageVersionInstance,
        description: ServicePackageDescription,
    ) -> Arc<Self> {
        let on_demand = Self::compute_on_demand_info(&ctx, &id, &description);
        let failure_id = format!("VersionedServicePackage:{id}:{instance_id}");

        Arc::new_cyclic(|weak_self| Self {
            ctx,
            weak_self: weak_self.clone(),
            id,
            instance_id,
            application_name,
            failure_id,
            state: StateMachine::new(VspState::Created),
            shared: RwLock::new(VspShared {
                current_version_instance: version_instance,
                description,
                environment: None,
                service_type_instance_ids: Vec::new(),
            }),
            active_code_packages: RwLock::new(HashMap::new()),
            activator_code_package_name: on_demand.activator_name,
            activator_rollout_version: on_demand.activator_rollout_version,
            activator_instance_id: RwLock::new(0),
            is_on_demand_activation_enabled: on_demand.is_on_demand,
            is_guest_application: on_demand.is_guest_application,
            tracker: OperationTracker::default(),
            registration_tracker: RegistrationTimeoutTracker::new(),
        })
    }

    fn compute_on_demand_info(
        ctx: &Arc<HostingContext>,
        id: &ServicePackageInstanceIdentifier,
        description: &ServicePackageDescription,
    ) -> OnDemandInfo {
        let config = ctx.config();

        let mut implicit_count = 0usize;
        let mut implicit_stateful_count = 0usize;
        let mut normal_count = 0usize;
        for service_type in &description.service_types {
            if service_type.use_implicit_host {
                implicit_count += 1;
                if service_type.is_stateful {
                    implicit_stateful_count += 1;
                }
            } else {
                normal_count += 1;
            }
        }

        let activator = description.activator_code_package();
        let is_guest_application = implicit_count > 0;

        debug_assert!(
            !(is_guest_application && activator.is_some()),
            "a guest application cannot declare an explicit activator code package: {id}"
        );

        let is_eligible_guest_app = is_guest_application
            && normal_count == 0
            && id.activation_context.is_exclusive()
            && config.host_guest_service_type_in_proc;

        // The stateless opt-out is evaluated before on-demand activation is
        // enabled, preserving the order of checks the activation contract
        // documents.
        if is_eligible_guest_app
            && implicit_stateful_count == 0
            && config.disable_on_demand_activation_for_stateless_guest_app
        {
            return OnDemandInfo {
                is_on_demand: false,
                is_guest_application,
                activator_name: None,
                activator_rollout_version: None,
            };
        }

        if is_eligible_guest_app || activator.is_some() {
            let (name, rollout) = match activator {
                Some(cp) => (cp.name.clone(), Some(cp.rollout_version)),
                None => (Self::implicit_type_host_name(description).to_string(), None),
            };
            info!("On-demand activation enabled for {} via activator '{}'", id, name);
            return OnDemandInfo {
                is_on_demand: true,
                is_guest_application,
                activator_name: Some(name),
                activator_rollout_version: rollout,
            };
        }

        OnDemandInfo {
            is_on_demand: false,
            is_guest_application,
            activator_name: None,
            activator_rollout_version: None,
        }
    }

    fn implicit_type_host_name(description: &ServicePackageDescription) -> &'static str {
        if description.uses_replicated_store {
            BLOCK_STORE_TYPE_HOST_NAME
        } else {
            IMPLICIT_TYPE_HOST_NAME
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Instance identifier.
    pub fn id(&self) -> &ServicePackageInstanceIdentifier {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VspState {
        self.state.current()
    }

    /// Whether the package reached a terminal or tearing-down state.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(
            self.state.current(),
            VspState::Closing | VspState::Closed | VspState::Failed | VspState::Aborted
        )
    }

    /// Version instance currently active.
    pub fn current_version_instance(&self) -> ServicePackageVersionInstance {
        self.shared
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current_version_instance
    }

    /// Snapshot of the current description.
    pub fn package_description(&self) -> ServicePackageDescription {
        self.shared.read().unwrap_or_else(|e| e.into_inner()).description.clone()
    }

    /// Names of the active code packages.
    pub fn active_code_package_names(&self) -> Vec<String> {
        let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
        map.keys().cloned().collect()
    }

    /// Look up an active code package by name.
    pub fn code_package(&self, name: &str) -> Option<Arc<CodePackage>> {
        let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
        map.get(name).cloned()
    }

    /// Instance id of the live activator code package, zero when none.
    pub fn activator_code_package_instance_id(&self) -> i64 {
        *self.activator_instance_id.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether dependent code packages activate on demand.
    pub fn is_on_demand_activation_enabled(&self) -> bool {
        self.is_on_demand_activation_enabled
    }

    /// Whether the package hosts guest service types.
    pub fn is_guest_application(&self) -> bool {
        self.is_guest_application
    }

    /// Stable failure id used for continuous-failure tracking.
    pub fn failure_id(&self) -> &str {
        &self.failure_id
    }

    /// Continuous failures attributed to this instance.
    pub fn failure_count(&self) -> u32 {
        self.ctx.service_types.failure_count(&self.failure_id)
    }

    /// Path of the current-package marker file, once the environment exists.
    pub fn current_package_file_path(&self) -> Option<PathBuf> {
        let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
        shared
            .environment
            .as_ref()
            .map(|env| env.run_layout_root.join(CURRENT_PACKAGE_FILE))
    }

    // ------------------------------------------------------------------
    // Open
    // ------------------------------------------------------------------

    /// Bring the instance up: admit with the resource manager, set up the
    /// environment, record the current version on disk, declare service
    /// types, and activate the required code packages in parallel.
    pub async fn open(&self, timeout: Duration) -> Result<()> {
        if self.state.current() == VspState::Opened {
            return Ok(());
        }
        self.state.try_transition(&[VspState::Created], VspState::Opening)?;

        let deadline = Deadline::after(timeout);
        match self.open_internal(deadline).await {
            Ok(()) => {
                self.state.try_transition(&[VspState::Opening], VspState::Opened)?;
                let _ = self.ctx.deps.health.report(
                    &self.id.to_string(),
                    HEALTH_PROPERTY_ACTIVATION,
                    HealthReportCode::ServicePackageActivated,
                    "",
                    self.ctx.next_sequence(),
                );
                info!("Service package opened: {}", self.id);
                Ok(())
            }
            Err(e) => {
                warn!("Open of {} failed: {}", self.id, e);
                self.cleanup_after_failure().await;
                self.state.force(VspState::Failed);
                Err(e)
            }
        }
    }

    async fn open_internal(&self, deadline: Deadline) -> Result<()> {
        let (version_instance, description) = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            (shared.current_version_instance, shared.description.clone())
        };

        self.ctx.resource_manager.register_service_package(
            &self.id,
            &description.resource_governance,
            &self.application_name,
        )?;

        self.ctx.deps.health.register_source(
            &self.id.to_string(),
            &self.application_name,
            HEALTH_PROPERTY_ACTIVATION,
        )?;

        let environment = self
            .ctx
            .deps
            .environment
            .setup_service_package_environment(
                &self.id,
                self.instance_id,
                &description,
                deadline.remaining(),
            )
            .await?;

        {
            let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
            shared.environment = Some(environment.clone());
        }

        self.configure_system_package_environment(&environment, deadline).await?;

        self.write_current_package_file(&environment.run_layout_root, version_instance.version)?;

        let type_ids: Vec<ServiceTypeInstanceIdentifier> = description
            .service_types
            .iter()
            .map(|st| ServiceTypeInstanceIdentifier::new(self.id.clone(), &st.service_type_name))
            .collect();
        self.ctx.service_types.register_service_types(type_ids.clone());
        self.registration_tracker.reset();
        {
            let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
            shared.service_type_instance_ids = type_ids;
        }

        let to_load = self.code_package_descriptions_to_load(&description);
        let code_packages: Vec<Arc<CodePackage>> = to_load
            .into_iter()
            .map(|(desc, implicit)| self.create_code_package(desc, implicit, HashMap::new()))
            .collect::<Result<_>>()?;
        {
            let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
            for cp in &code_packages {
                map.insert(cp.name(), cp.clone());
            }
        }

        let results = join_all(
            code_packages
                .iter()
                .map(|cp| cp.activate(deadline.remaining())),
        )
        .await;

        if let Some(first_error) = results.into_iter().find_map(|r| r.err()) {
            return Err(first_error);
        }
        Ok(())
    }

    async fn configure_system_package_environment(
        &self,
        environment: &EnvironmentContext,
        deadline: Deadline,
    ) -> Result<()> {
        if !self.id.application_id().is_system() {
            return Ok(());
        }

        if self.id.service_package_name() == FILE_STORE_SERVICE_PACKAGE {
            let sids = vec![environment.current_user_sid.clone()];
            let work_root = environment.run_layout_root.join("work");

            self.ctx
                .deps
                .activator_client
                .configure_smb_share(
                    sids.clone(),
                    GENERIC_READ | GENERIC_EXECUTE,
                    &work_root.join("Store"),
                    &format!("Store_{}", self.ctx.node_name),
                    deadline.remaining(),
                )
                .await?;

            self.ctx
                .deps
                .activator_client
                .configure_smb_share(
                    sids,
                    GENERIC_ALL,
                    &work_root.join("Staging"),
                    &format!("Staging_{}", self.ctx.node_name),
                    deadline.remaining(),
                )
                .await?;
        } else if self.id.service_package_name() == DNS_SERVICE_PACKAGE {
            self.ctx
                .deps
                .activator_client
                .configure_node_for_dns(&environment.current_user_sid)
                .await?;
        }

        Ok(())
    }

    fn code_package_descriptions_to_load(
        &self,
        description: &ServicePackageDescription,
    ) -> Vec<(DigestedCodePackageDescription, bool)> {
        if self.is_on_demand_activation_enabled {
            // Only the activator comes up with the package; dependents are
            // loaded later on demand.
            if let Some(activator) = description.activator_code_package() {
                return vec![(activator.clone(), false)];
            }
            return vec![(Self::implicit_type_host_description(description), true)];
        }

        let mut result: Vec<(DigestedCodePackageDescription, bool)> = description
            .digested_code_packages
            .iter()
            .map(|cp| (cp.clone(), false))
            .collect();
        if description.has_guest_service_types() {
            result.push((Self::implicit_type_host_description(description), true));
        }
        result
    }

    fn implicit_type_host_description(
        description: &ServicePackageDescription,
    ) -> DigestedCodePackageDescription {
        let guest_types: Vec<String> = description
            .service_types
            .iter()
            .filter(|st| st.use_implicit_host)
            .map(|st| st.service_type_name.clone())
            .collect();

        DigestedCodePackageDescription {
            name: Self::implicit_type_host_name(description).to_string(),
            version: description.manifest_version.clone(),
            rollout_version: RolloutVersion::default(),
            is_shared: false,
            is_activator: false,
            entry_point: EntryPointDescription::Exe {
                program: "GuestTypeHost".to_string(),
                arguments: guest_types,
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

    fn create_code_package(
        &self,
        description: DigestedCodePackageDescription,
        is_implicit_type_host: bool,
        extra_environment: HashMap<String, String>,
    ) -> Result<Arc<CodePackage>> {
        let (version_instance, environment) = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            let environment = shared.environment.clone().ok_or_else(|| Error::InvalidState {
                current: "no environment".to_string(),
                operation: format!("create code package {}", description.name),
            })?;
            (shared.current_version_instance, environment)
        };
        Ok(CodePackage::new(
            self.ctx.clone(),
            self.weak_self.clone(),
            self.id.clone(),
            self.application_name.clone(),
            description,
            version_instance,
            environment,
            is_implicit_type_host,
            extra_environment,
        ))
    }

    fn write_current_package_file(
        &self,
        root: &std::path::Path,
        version: ServicePackageVersion,
    ) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let tmp = root.join(format!("{CURRENT_PACKAGE_FILE}.tmp"));
        std::fs::write(&tmp, version.to_string())?;
        std::fs::rename(&tmp, root.join(CURRENT_PACKAGE_FILE))?;
        Ok(())
    }

    fn remove_current_package_file(&self) {
        if let Some(path) = self.current_package_file_path() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Switch
    // ------------------------------------------------------------------

    /// Roll the instance to a new version in place.
    ///
    /// An unchanged content checksum re-stamps every code package through a
    /// context update with no restarts; otherwise code packages are
    /// partitioned into deactivate/update/activate sets by rollout version.
    pub async fn switch(
        &self,
        new_version_instance: ServicePackageVersionInstance,
        new_description: ServicePackageDescription,
        timeout: Duration,
    ) -> Result<()> {
        self.state.try_transition(&[VspState::Opened], VspState::Switching)?;
        let deadline = Deadline::after(timeout);

        let result = self
            .switch_internal(new_version_instance, new_description, deadline)
            .await;

        match result {
            Ok(()) => {
                self.state.try_transition(&[VspState::Switching], VspState::Opened)?;
                Ok(())
            }
            // A rejected validation is a caller bug, not a package failure;
            // the running version stays untouched.
            Err(e @ Error::InvalidState { .. }) => {
                let _ = self.state.try_transition(&[VspState::Switching], VspState::Opened);
                Err(e)
            }
            Err(e) => {
                warn!("Switch of {} to {} failed: {}", self.id, new_version_instance, e);
                self.cleanup_after_failure().await;
                self.state.force(VspState::Failed);
                Err(e)
            }
        }
    }

    async fn switch_internal(
        &self,
        new_version_instance: ServicePackageVersionInstance,
        new_description: ServicePackageDescription,
        deadline: Deadline,
    ) -> Result<()> {
        let (current_version_instance, current_description) = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            (shared.current_version_instance, shared.description.clone())
        };

        if current_version_instance == new_version_instance {
            return Ok(());
        }

        let version_update_only =
            current_description.content_checksum == new_description.content_checksum;

        if version_update_only {
            let update_set: Vec<Arc<CodePackage>> = {
                let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
                map.values().cloned().collect()
            };
            self.commit_new_version(new_version_instance, &new_description)?;
            self.update_code_packages(&update_set, &new_description, new_version_instance, deadline)
                .await?;
            return Ok(());
        }

        // The activation clock restarts with the new code; registration
        // timeouts must not fire against time spent on the old version.
        self.registration_tracker.reset();

        self.validate_on_demand_switch(&current_description, &new_description)?;

        let (to_deactivate, to_update, to_activate) =
            self.partition_code_packages(&new_description);

        self.deactivate_code_packages(&to_deactivate, deadline).await;

        self.commit_new_version(new_version_instance, &new_description)?;

        let update_result = self
            .update_code_packages(&to_update, &new_description, new_version_instance, deadline)
            .await;

        let mut to_activate = to_activate;
        if let Err(update_error) = update_result {
            to_activate = self
                .handle_update_failures(update_error, &to_update, to_activate, &new_description)
                .await;
        }

        self.activate_code_packages(&to_activate, &new_description, deadline).await?;
        Ok(())
    }

    fn commit_new_version(
        &self,
        new_version_instance: ServicePackageVersionInstance,
        new_description: &ServicePackageDescription,
    ) -> Result<()> {
        let root = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            shared
                .environment
                .as_ref()
                .map(|env| env.run_layout_root.clone())
        };
        if let Some(root) = root {
            self.write_current_package_file(&root, new_version_instance.version)?;
        }

        let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
        shared.current_version_instance = new_version_instance;
        shared.description = new_description.clone();
        info!("Service package {} now at {}", self.id, new_version_instance);
        Ok(())
    }

    fn validate_on_demand_switch(
        &self,
        current: &ServicePackageDescription,
        new: &ServicePackageDescription,
    ) -> Result<()> {
        if !self.is_on_demand_activation_enabled {
            return Ok(());
        }

        let current_names: HashSet<&str> = current
            .digested_code_packages
            .iter()
            .map(|cp| cp.name.as_str())
            .collect();
        let new_names: HashSet<&str> = new
            .digested_code_packages
            .iter()
            .map(|cp| cp.name.as_str())
            .collect();

        let activator_rollout_changed = match (&self.activator_code_package_name, &self.activator_rollout_version) {
            (Some(name), Some(rollout)) => new
                .find_code_package(name)
                .map(|cp| cp.rollout_version != *rollout)
                .unwrap_or(true),
            _ => false,
        };

        if current_names != new_names || activator_rollout_changed {
            return Err(Error::InvalidState {
                current: "on-demand activation".to_string(),
                operation: "switch changing code package set or activator rollout version"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Partition current code packages against the new description.
    ///
    /// Returns (deactivate, update, activate): live packages to stop, live
    /// packages to re-stamp, and new descriptions to bring up.
    fn partition_code_packages(
        &self,
        new_description: &ServicePackageDescription,
    ) -> (
        Vec<Arc<CodePackage>>,
        Vec<Arc<CodePackage>>,
        Vec<(DigestedCodePackageDescription, bool)>,
    ) {
        let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());

        let mut to_deactivate = Vec::new();
        let mut to_update = Vec::new();
        let mut to_activate = Vec::new();

        for new_cp in &new_description.digested_code_packages {
            match map.get(&new_cp.name) {
                None => {
                    // With on-demand activation an absent dependent simply
                    // has not been requested by the activator yet.
                    if !self.is_on_demand_activation_enabled {
                        to_activate.push((new_cp.clone(), false));
                    }
                }
                Some(current) => {
                    if current.rollout_version() != new_cp.rollout_version {
                        to_deactivate.push(current.clone());
                        to_activate.push((new_cp.clone(), false));
                    } else {
                        to_update.push(current.clone());
                    }
                }
            }
        }

        if !self.is_on_demand_activation_enabled {
            for (name, cp) in map.iter() {
                if cp.is_implicit_type_host() {
                    continue;
                }
                if new_description.find_code_package(name).is_none() {
                    to_deactivate.push(cp.clone());
                }
            }
        }

        // The synthesized type host follows the guest type declarations.
        let host_name = Self::implicit_type_host_name(new_description);
        if let Some(host) = map.values().find(|cp| cp.is_implicit_type_host()) {
            if new_description.has_guest_service_types() && host.name() == host_name {
                to_update.push(host.clone());
            } else {
                to_deactivate.push(host.clone());
                if new_description.has_guest_service_types() {
                    to_activate.push((Self::implicit_type_host_description(new_description), true));
                }
            }
        } else if new_description.has_guest_service_types() && !self.is_on_demand_activation_enabled
        {
            to_activate.push((Self::implicit_type_host_description(new_description), true));
        }

        (to_deactivate, to_update, to_activate)
    }

    async fn deactivate_code_packages(
        &self,
        code_packages: &[Arc<CodePackage>],
        deadline: Deadline,
    ) {
        if code_packages.is_empty() {
            return;
        }

        let config = self.ctx.config();
        let per_package_timeout = if config.activation_timeout() <= config.application_upgrade_timeout()
        {
            config.activation_timeout()
        } else {
            deadline.remaining()
        };

        let results = join_all(
            code_packages
                .iter()
                .map(|cp| async move { (cp.clone(), cp.deactivate(per_package_timeout).await) }),
        )
        .await;

        let failed: Vec<Arc<CodePackage>> = results
            .into_iter()
            .filter_map(|(cp, result)| result.err().map(|_| cp))
            .collect();
        if !failed.is_empty() {
            join_all(failed.iter().map(|cp| cp.abort_and_wait_for_termination())).await;
        }

        let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
        for cp in code_packages {
            map.remove(&cp.name());
        }
    }

    async fn update_code_packages(
        &self,
        code_packages: &[Arc<CodePackage>],
        new_description: &ServicePackageDescription,
        new_version_instance: ServicePackageVersionInstance,
        deadline: Deadline,
    ) -> Result<()> {
        if code_packages.is_empty() {
            return Ok(());
        }

        let results = join_all(code_packages.iter().map(|cp| {
            let new_cp_description = if cp.is_implicit_type_host() {
                Self::implicit_type_host_description(new_description)
            } else {
                new_description
                    .find_code_package(&cp.name())
                    .cloned()
                    .unwrap_or_else(|| cp.description())
            };
            async move {
                (
                    cp.clone(),
                    cp.update_context(new_cp_description, new_version_instance, deadline.remaining())
                        .await,
                )
            }
        }))
        .await;

        let failed: Vec<String> = results
            .iter()
            .filter_map(|(cp, result)| result.as_ref().err().map(|_| cp.name()))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "context update failed for: {}",
                failed.join(", ")
            )))
        }
    }

    /// Decide what to abort and re-activate after context-update failures.
    async fn handle_update_failures(
        &self,
        update_error: Error,
        update_set: &[Arc<CodePackage>],
        mut to_activate: Vec<(DigestedCodePackageDescription, bool)>,
        new_description: &ServicePackageDescription,
    ) -> Vec<(DigestedCodePackageDescription, bool)> {
        debug!("Handling update failures for {}: {}", self.id, update_error);

        let activator_failed = self.is_on_demand_activation_enabled
            && self
                .activator_code_package_name
                .as_ref()
                .map(|name| {
                    update_set
                        .iter()
                        .any(|cp| &cp.name() == name && cp.state() != crate::CodePackageState::Active)
                })
                .unwrap_or(false);

        if activator_failed {
            // The activator's context is unknown; nothing it activated can
            // be trusted. Fence new requests and restart from the activator.
            {
                let mut id = self.activator_instance_id.write().unwrap_or_else(|e| e.into_inner());
                *id = 0;
            }

            let all: Vec<Arc<CodePackage>> = {
                let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
                map.values().cloned().collect()
            };
            join_all(all.iter().map(|cp| cp.abort_and_wait_for_termination())).await;
            {
                let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
                map.clear();
            }

            to_activate = self
                .code_package_descriptions_to_load(new_description)
                .into_iter()
                .collect();
            return to_activate;
        }

        // Abort only the failed packages and bring them up at the new
        // version.
        let failed: Vec<Arc<CodePackage>> = update_set
            .iter()
            .filter(|cp| cp.state() != crate::CodePackageState::Active)
            .cloned()
            .collect();
        join_all(failed.iter().map(|cp| cp.abort_and_wait_for_termination())).await;
        {
            let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
            for cp in &failed {
                map.remove(&cp.name());
            }
        }
        for cp in &failed {
            if cp.is_implicit_type_host() {
                to_activate.push((Self::implicit_type_host_description(new_description), true));
            } else if let Some(desc) = new_description.find_code_package(&cp.name()) {
                to_activate.push((desc.clone(), false));
            }
        }
        to_activate
    }

    async fn activate_code_packages(
        &self,
        descriptions: &[(DigestedCodePackageDescription, bool)],
        _new_description: &ServicePackageDescription,
        deadline: Deadline,
    ) -> Result<()> {
        if descriptions.is_empty() {
            return Ok(());
        }

        let code_packages: Vec<Arc<CodePackage>> = descriptions
            .iter()
            .map(|(desc, implicit)| self.create_code_package(desc.clone(), *implicit, HashMap::new()))
            .collect::<Result<_>>()?;
        {
            let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
            for cp in &code_packages {
                map.insert(cp.name(), cp.clone());
            }
        }

        let results = join_all(
            code_packages
                .iter()
                .map(|cp| cp.activate(deadline.remaining())),
        )
        .await;

        if let Some(first_error) = results.into_iter().find_map(|r| r.err()) {
            join_all(code_packages.iter().map(|cp| cp.abort_and_wait_for_termination())).await;
            let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
            for cp in &code_packages {
                map.remove(&cp.name());
            }
            return Err(first_error);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Close / abort
    // ------------------------------------------------------------------

    /// Drain on-demand operations, deactivate every code package, tear the
    /// environment down, and unregister from the per-node registries.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        if self.state.current() == VspState::Closed {
            return Ok(());
        }
        self.state
            .try_transition(&[VspState::Opened, VspState::Failed], VspState::Closing)?;
        let deadline = Deadline::after(timeout);

        self.tracker.begin_drain().await;

        let code_packages: Vec<Arc<CodePackage>> = {
            let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let results = join_all(
            code_packages
                .iter()
                .map(|cp| async move { (cp.clone(), cp.deactivate(deadline.remaining()).await) }),
        )
        .await;
        let failed: Vec<Arc<CodePackage>> = results
            .into_iter()
            .filter_map(|(cp, r)| r.err().map(|_| cp))
            .collect();
        join_all(failed.iter().map(|cp| cp.abort_and_wait_for_termination())).await;
        {
            let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
            map.clear();
        }

        let environment = {
            let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
            shared.environment.take()
        };
        if let Some(env) = &environment {
            // Remove the open marker before the layout goes away.
            let path = env.run_layout_root.join(CURRENT_PACKAGE_FILE);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }

            if let Err(e) = self
                .ctx
                .deps
                .environment
                .cleanup_service_package_environment(env, deadline.remaining())
                .await
            {
                warn!("Environment cleanup for {} failed ({}), aborting it", self.id, e);
                self.ctx.deps.environment.abort_service_package_environment(env).await;
            }
        }

        self.unregister_everything();

        self.state.try_transition(&[VspState::Closing], VspState::Closed)?;
        info!("Service package closed: {}", self.id);
        Ok(())
    }

    /// Abort without graceful stops; always reaches `Aborted`.
    pub async fn abort(&self) {
        self.state.force(VspState::Aborted);
        self.cleanup_after_failure().await;
        info!("Service package aborted: {}", self.id);
    }

    async fn cleanup_after_failure(&self) {
        let code_packages: Vec<Arc<CodePackage>> = {
            let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        join_all(code_packages.iter().map(|cp| cp.abort_and_wait_for_termination())).await;
        {
            let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
            map.clear();
        }

        self.remove_current_package_file();

        let environment = {
            let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
            shared.environment.take()
        };
        if let Some(env) = &environment {
            self.ctx.deps.environment.abort_service_package_environment(env).await;
        }

        self.unregister_everything();
    }

    fn unregister_everything(&self) {
        self.ctx
            .deps
            .health
            .unregister_source(&self.id.to_string(), HEALTH_PROPERTY_ACTIVATION);
        self.ctx.service_types.unregister_failure(&self.failure_id);

        let (type_ids, resource_governance) = {
            let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
            (
                std::mem::take(&mut shared.service_type_instance_ids),
                shared.description.resource_governance.clone(),
            )
        };
        self.ctx.service_types.unregister_service_types(&type_ids);
        self.ctx.resource_manager.unregister_service_package(&self.id, &resource_governance);
    }

    // ------------------------------------------------------------------
    // On-demand code package operations
    // ------------------------------------------------------------------

    /// Handle an activate/deactivate/abort request from the activator code
    /// package for one or more dependent code packages.
    pub async fn on_demand_code_package_operation(
        &self,
        request: CodePackageOperationRequest,
    ) -> Result<()> {
        let deadline = Deadline::after(Duration::from_millis(request.timeout_millis));
        let mut retry_count: u32 = 0;

        // Modifying competes with switch and close; denied transitions are
        // retried on a bounded ladder until the deadline.
        loop {
            match self.state.try_transition(&[VspState::Opened], VspState::Modifying) {
                Ok(_) => break,
                Err(_) => {
                    let current = self.state.current();
                    if matches!(
                        current,
                        VspState::Aborted | VspState::Closing | VspState::Closed | VspState::Failed
                    ) {
                        return Err(Error::ObjectClosed);
                    }
                    if deadline.expired() {
                        return Err(Error::Timeout);
                    }
                    retry_count += 1;
                    let delay = MODIFY_RETRY_BASE
                        .saturating_mul(retry_count)
                        .min(MODIFY_RETRY_CAP);
                    debug!(
                        "On-demand operation on {} waiting for {:?} (state={:?}, retry={})",
                        self.id, delay, current, retry_count
                    );
                    smol::Timer::after(delay).await;
                }
            }
        }

        let requestor = request.code_context.activator_instance_id;
        let current_activator = self.activator_code_package_instance_id();
        if requestor != current_activator {
            self.transition_back_to_opened();
            return Err(Error::InstanceIdMismatch {
                current: current_activator,
                requested: requestor,
            });
        }

        let operation_id = self.ctx.next_sequence();
        if !self.tracker.try_track(operation_id) {
            // The activator terminated and its operations are draining.
            self.transition_back_to_opened();
            return Err(Error::ObjectClosed);
        }

        let result = self.perform_code_package_operations(&request, deadline).await;

        self.tracker.untrack(operation_id);
        self.transition_back_to_opened();
        result
    }

    fn transition_back_to_opened(&self) {
        if self
            .state
            .try_transition(&[VspState::Modifying], VspState::Opened)
            .is_err()
        {
            debug!(
                "Leaving state {:?} untouched after on-demand operation on {}",
                self.state.current(),
                self.id
            );
        }
    }

    async fn perform_code_package_operations(
        &self,
        request: &CodePackageOperationRequest,
        deadline: Deadline,
    ) -> Result<()> {
        let names = self.resolve_operation_targets(request);

        let mut last_error = None;
        let results = join_all(names.iter().map(|name| {
            let name = name.clone();
            async move {
                let result = match request.operation_type {
                    CodePackageOperationType::Activate => {
                        self.activate_dependent_code_package(
                            &name,
                            request.environment_block.clone(),
                            deadline,
                        )
                        .await
                    }
                    CodePackageOperationType::Deactivate => {
                        self.deactivate_dependent_code_package(&name, deadline).await
                    }
                    CodePackageOperationType::Abort => {
                        self.abort_dependent_code_package(&name).await
                    }
                };
                (name, result)
            }
        }))
        .await;

        for (name, result) in results {
            if let Err(e) = result {
                warn!("On-demand {:?} of {} failed: {}", request.operation_type, name, e);
                last_error = Some(e);
            }
        }

        match last_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn resolve_operation_targets(&self, request: &CodePackageOperationRequest) -> Vec<String> {
        if !request.is_all_code_packages {
            return request.code_package_names.clone();
        }

        let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
        shared
            .description
            .digested_code_packages
            .iter()
            .filter(|cp| Some(&cp.name) != self.activator_code_package_name.as_ref())
            .map(|cp| cp.name.clone())
            .collect()
    }

    async fn activate_dependent_code_package(
        &self,
        name: &str,
        environment_block: HashMap<String, String>,
        deadline: Deadline,
    ) -> Result<()> {
        let existing = self.code_package(name);
        let code_package = match existing {
            Some(cp) => cp,
            None => {
                let description = {
                    let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
                    shared
                        .description
                        .find_code_package(name)
                        .cloned()
                        .ok_or_else(|| Error::CodePackageNotFound(name.to_string()))?
                };
                let cp = self.create_code_package(description, false, environment_block)?;
                let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
                map.entry(name.to_string()).or_insert_with(|| cp.clone()).clone()
            }
        };
        code_package.activate(deadline.remaining()).await
    }

    async fn deactivate_dependent_code_package(
        &self,
        name: &str,
        deadline: Deadline,
    ) -> Result<()> {
        let Some(code_package) = self.code_package(name) else {
            return Ok(());
        };
        code_package.deactivate(deadline.remaining()).await?;
        let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
        map.remove(name);
        Ok(())
    }

    async fn abort_dependent_code_package(&self, name: &str) -> Result<()> {
        let Some(code_package) = self.code_package(name) else {
            return Ok(());
        };
        code_package.abort_and_wait_for_termination().await;
        let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
        map.remove(name);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Code package event plumbing
    // ------------------------------------------------------------------

    pub(crate) async fn on_code_package_started(
        &self,
        name: &str,
        instance_id: i64,
        is_activator: bool,
    ) {
        if self.is_on_demand_activation_enabled
            && (is_activator || self.activator_code_package_name.as_deref() == Some(name))
        {
            {
                let mut id = self.activator_instance_id.write().unwrap_or_else(|e| e.into_inner());
                *id = instance_id;
            }
            self.tracker.reset();
            info!("Activator code package {} up with instance id {}", name, instance_id);
        }
        self.publish_code_package_event(name, instance_id, "started").await;
    }

    pub(crate) async fn on_code_package_terminated(
        &self,
        name: &str,
        instance_id: i64,
        exit_code: u32,
        was_activator: bool,
    ) {
        let status = if hosting_model::is_successful_exit(exit_code) {
            "stopped"
        } else {
            "failed"
        };
        self.publish_code_package_event(name, instance_id, status).await;

        if !self.is_on_demand_activation_enabled || !was_activator {
            return;
        }
        let is_current = {
            let mut id = self.activator_instance_id.write().unwrap_or_else(|e| e.into_inner());
            if *id == instance_id {
                *id = 0;
                true
            } else {
                false
            }
        };
        if !is_current {
            return;
        }
        if self.is_terminal() {
            // Close/abort owns teardown of the dependents.
            return;
        }

        info!(
            "Activator code package {} terminated; draining dependents of {}",
            name, self.id
        );
        self.tracker.begin_drain().await;

        let dependents: Vec<Arc<CodePackage>> = {
            let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
            map.values()
                .filter(|cp| cp.name() != name)
                .cloned()
                .collect()
        };
        join_all(dependents.iter().map(|cp| cp.abort_and_wait_for_termination())).await;
        {
            let mut map = self.active_code_packages.write().unwrap_or_else(|e| e.into_inner());
            for cp in &dependents {
                map.remove(&cp.name());
            }
        }
        // The activator's own supervisor retries; new on-demand requests are
        // admitted once it reports a fresh instance id.
        self.tracker.reset();
    }

    async fn publish_code_package_event(&self, name: &str, instance_id: i64, status: &str) {
        if !self.is_on_demand_activation_enabled {
            return;
        }
        let body = serde_json::json!({
            "service_package_instance_id": self.id,
            "code_package_name": name,
            "instance_id": instance_id,
            "status": status,
        });
        if let Err(e) = self
            .ctx
            .deps
            .message_bus
            .notify(DEPENDENT_CODE_PACKAGE_EVENT_ACTION, body)
            .await
        {
            debug!("Dependent event publish for {} failed: {}", name, e);
        }
    }

    // ------------------------------------------------------------------
    // Upgrade analysis
    // ------------------------------------------------------------------

    /// Dry-run of a switch: which registered runtimes would observably
    /// restart. Never mutates package state.
    pub fn analyze_upgrade_impact(
        &self,
        new_description: &ServicePackageDescription,
    ) -> Result<UpgradeImpact> {
        self.state.try_transition(&[VspState::Opened], VspState::Analyzing)?;

        let result = self.analyze_internal(new_description);

        let _ = self.state.try_transition(&[VspState::Analyzing], VspState::Opened);
        result
    }

    fn analyze_internal(&self, new_description: &ServicePackageDescription) -> Result<UpgradeImpact> {
        let current = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            shared.description.clone()
        };

        let mut impact = UpgradeImpact {
            has_resource_governance_change: current.resource_governance
                != new_description.resource_governance,
            ..Default::default()
        };

        for current_cp in &current.digested_code_packages {
            let restarts = match new_description.find_code_package(&current_cp.name) {
                None => true,
                Some(new_cp) => new_cp.rollout_version != current_cp.rollout_version,
            };
            if restarts {
                impact.affected_code_packages.push(current_cp.name.clone());
            }
        }

        let guest_types_changed = current
            .service_types
            .iter()
            .filter(|st| st.use_implicit_host)
            .map(|st| &st.service_type_name)
            .collect::<HashSet<_>>()
            != new_description
                .service_types
                .iter()
                .filter(|st| st.use_implicit_host)
                .map(|st| &st.service_type_name)
                .collect::<HashSet<_>>();

        if current.has_guest_service_types()
            && (impact.has_resource_governance_change || guest_types_changed)
        {
            impact
                .affected_code_packages
                .push(Self::implicit_type_host_name(&current).to_string());
        }

        for name in &impact.affected_code_packages {
            impact
                .affected_runtime_ids
                .extend(self.ctx.service_types.registrations_for_code_package(&self.id, name));
        }
        impact.affected_runtime_ids.sort();
        impact.affected_runtime_ids.dedup();

        Ok(impact)
    }

    // ------------------------------------------------------------------
    // Forced failover and registration timeouts
    // ------------------------------------------------------------------

    /// Kill the type host through the external activator when this instance
    /// has crossed the continuous-failure threshold. Retries lookup with the
    /// returned due-time hints until the host is found or the package leaves
    /// `Opened`.
    pub async fn terminate_type_host_on_continuous_failure(&self) -> Result<bool> {
        let threshold = self
            .ctx
            .config()
            .deployed_service_failover_continuous_failure_threshold;
        if self.failure_count() <= threshold {
            return Ok(false);
        }

        loop {
            if self.state.current() != VspState::Opened {
                return Err(Error::ObjectClosed);
            }

            let type_host = {
                let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
                map.values().find(|cp| cp.is_implicit_type_host()).cloned()
            };

            match type_host {
                None => {
                    smol::Timer::after(self.ctx.config().activation_retry_backoff()).await;
                }
                Some(cp) => match cp.terminate_code_package_externally().await? {
                    None => {
                        info!("Type host of {} terminated for forced failover", self.id);
                        return Ok(true);
                    }
                    Some(due) => {
                        debug!("Type host of {} not registered yet, retrying in {:?}", self.id, due);
                        smol::Timer::after(due).await;
                    }
                },
            }
        }
    }

    /// A placement lookup found no registration for one of this package's
    /// service types. Returns whether the miss is authoritative: the
    /// registration window has expired with the package open, and the state
    /// manager has been informed.
    pub fn on_service_type_registration_not_found(&self, service_type_name: &str) -> bool {
        if self.state.current() != VspState::Opened {
            return false;
        }
        let timeout = self.ctx.config().service_type_registration_timeout();
        if !self.registration_tracker.expired(timeout) {
            return false;
        }

        let type_id = ServiceTypeInstanceIdentifier::new(self.id.clone(), service_type_name);
        self.ctx
            .service_types
            .on_registration_not_found(&type_id, &self.failure_id);
        true
    }

    /// Batched docker health observations; unhealthy containers restart when
    /// their policy asks for it.
    pub async fn on_container_health_changed(&self, infos: &[ContainerHealthStatusInfo]) {
        let by_container: Vec<(String, Arc<CodePackage>)> = {
            let map = self.active_code_packages.read().unwrap_or_else(|e| e.into_inner());
            map.values()
                .filter_map(|cp| cp.container_name().map(|name| (name, cp.clone())))
                .collect()
        };

        for info in infos {
            if info.is_healthy {
                continue;
            }
            for (container_name, cp) in &by_container {
                if container_name == &info.container_name {
                    cp.on_container_unhealthy().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for VersionedServicePackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedServicePackage")
            .field("id", &self.id.to_string())
            .field("state", &self.state.current())
            .field("version", &self.current_version_instance().to_string())
            .finish()
    }
}
