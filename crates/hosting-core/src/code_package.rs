//! Retried supervisor for one activatable unit.
//!
//! A `CodePackage` keeps one OS process or container alive according to its
//! entry point description: it activates through the process activator,
//! watches the instance's exit, classifies the exit code, and schedules the
//! next activation with bounded exponential backoff. The owning versioned
//! service package drives activate/deactivate/update/abort; the query
//! surface drives restart.

use crate::context::HostingContext;
use crate::deps::InstanceHandle;
use crate::run_stats::RunStats;
use crate::state::StateMachine;
use crate::versioned_service_package::VersionedServicePackage;
use crate::{Error, Result};
use hosting_model::{
    hosted_service_job_object_name, is_successful_exit, well_known_env,
    CodePackageInstanceIdentifier, DigestedCodePackageDescription, EntryPointDescription,
    ExitEvent, ProcessDescription, ServicePackageInstanceIdentifier,
    ServicePackageVersionInstance,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Out-of-band action publishing a context update to a live instance.
const UPDATE_CONTEXT_ACTION: &str = "UpdateCodePackageContext";

/// Lifecycle states of a code package.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodePackageState {
    /// No instance and no activation running.
    Inactive,
    /// An activation has been admitted and is preparing.
    Scheduling,
    /// The process activator is starting the instance.
    Starting,
    /// Exactly one instance is alive.
    Active,
    /// A context update is being published to the live instance.
    Updating,
    /// The instance is being stopped.
    Stopping,
    /// Terminal: aborted by the owner.
    Aborted,
    /// Terminal: continuous failures exhausted the retry budget.
    Failed,
}

struct CodePackageShared {
    description: DigestedCodePackageDescription,
    version_instance: ServicePackageVersionInstance,
    process_description: Option<ProcessDescription>,
}

struct RunningInstance {
    handle: InstanceHandle,
    instance_id: i64,
    monitor: Option<smol::Task<()>>,
}

#[derive(Default)]
struct RetryState {
    generation: AtomicU64,
    pending: AtomicBool,
}

/// Supervisor for one process or container instance.
pub struct CodePackage {
    ctx: Arc<HostingContext>,
    weak_self: Weak<CodePackage>,
    vsp: Weak<VersionedServicePackage>,
    id: CodePackageInstanceIdentifier,
    service_package_instance_id: ServicePackageInstanceIdentifier,
    application_name: String,
    is_implicit_type_host: bool,
    environment: crate::deps::EnvironmentContext,
    extra_environment: HashMap<String, String>,
    state: StateMachine<CodePackageState>,
    shared: RwLock<CodePackageShared>,
    stats: RwLock<RunStats>,
    instance: Mutex<Option<RunningInstance>>,
    current_instance_id: AtomicI64,
    retry: RetryState,
}

impl CodePackage {
    /// Create a supervisor for one digested code package of one service
    /// package instance. The back-reference to the owner never keeps it
    /// alive.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        ctx: Arc<HostingContext>,
        vsp: Weak<VersionedServicePackage>,
        service_package_instance_id: ServicePackageInstanceIdentifier,
        application_name: String,
        description: DigestedCodePackageDescription,
        version_instance: ServicePackageVersionInstance,
        environment: crate::deps::EnvironmentContext,
        is_implicit_type_host: bool,
        extra_environment: HashMap<String, String>,
    ) -> Arc<Self> {
        let id =
            CodePackageInstanceIdentifier::new(&service_package_instance_id, &description.name);
        Arc::new_cyclic(|weak_self| Self {
            ctx,
            weak_self: weak_self.clone(),
            vsp,
            id,
            service_package_instance_id,
            application_name,
            is_implicit_type_host,
            environment,
            extra_environment,
            state: StateMachine::new(CodePackageState::Inactive),
            shared: RwLock::new(CodePackageShared {
                description,
                version_instance,
                process_description: None,
            }),
            stats: RwLock::new(RunStats::default()),
            instance: Mutex::new(None),
            current_instance_id: AtomicI64::new(0),
            retry: RetryState::default(),
        })
    }

    /// Code package name.
    pub fn name(&self) -> String {
        self.id.code_package_name().to_string()
    }

    /// Full instance identifier.
    pub fn id(&self) -> &CodePackageInstanceIdentifier {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CodePackageState {
        self.state.current()
    }

    /// Snapshot of the run statistics.
    pub fn stats(&self) -> RunStats {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Instance id of the live instance, zero when none.
    pub fn current_instance_id(&self) -> i64 {
        self.current_instance_id.load(Ordering::SeqCst)
    }

    /// Whether the continuous-failure retry budget is exhausted.
    pub fn is_failed(&self) -> bool {
        self.state.current() == CodePackageState::Failed
    }

    /// Whether a retry activation is scheduled.
    pub fn retry_pending(&self) -> bool {
        self.retry.pending.load(Ordering::SeqCst)
    }

    /// Rollout version of the in-memory descriptor.
    pub fn rollout_version(&self) -> hosting_model::RolloutVersion {
        self.shared.read().unwrap_or_else(|e| e.into_inner()).description.rollout_version
    }

    /// Snapshot of the in-memory descriptor.
    pub fn description(&self) -> DigestedCodePackageDescription {
        self.shared.read().unwrap_or_else(|e| e.into_inner()).description.clone()
    }

    /// Whether this package gates on-demand activation of its siblings.
    pub fn is_activator(&self) -> bool {
        self.shared.read().unwrap_or_else(|e| e.into_inner()).description.is_activator
    }

    /// Whether this is the synthesized type host.
    pub fn is_implicit_type_host(&self) -> bool {
        self.is_implicit_type_host
    }

    /// Container name of the live instance, when it is a container.
    pub fn container_name(&self) -> Option<String> {
        let guard = self.instance.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|inst| inst.handle.container_name.clone())
    }

    /// Start the instance. Idempotent: an already-active package returns
    /// success without touching its statistics.
    pub async fn activate(&self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::Timeout);
        }
        if self.state.current() == CodePackageState::Active {
            return Ok(());
        }

        self.state
            .try_transition(&[CodePackageState::Inactive], CodePackageState::Scheduling)?;
        self.cancel_retry();

        let description = self.build_process_description();

        if let Err(e) = self
            .state
            .try_transition(&[CodePackageState::Scheduling], CodePackageState::Starting)
        {
            self.state.force(CodePackageState::Inactive);
            return Err(e);
        }

        debug!("Activating code package {} ({})", self.id, description.exe_path);

        let activate = self.ctx.deps.process_activator.activate(&description);
        let timed_out = async {
            smol::Timer::after(timeout).await;
            Err(Error::Timeout)
        };
        let result = smol::future::or(activate, timed_out).await;

        match result {
            Ok(handle) => {
                let instance_id = self.ctx.next_sequence() as i64;
                self.current_instance_id.store(instance_id, Ordering::SeqCst);
                {
                    let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
                    stats.update_activation_stats(true);
                }

                let monitor = self.spawn_exit_monitor(handle.clone(), instance_id);
                {
                    let mut guard = self.instance.lock().unwrap_or_else(|e| e.into_inner());
                    *guard = Some(RunningInstance {
                        handle,
                        instance_id,
                        monitor: Some(monitor),
                    });
                }

                if let Err(e) = self
                    .state
                    .try_transition(&[CodePackageState::Starting], CodePackageState::Active)
                {
                    // An abort raced the start; roll the instance back.
                    warn!("Activation of {} raced a terminal transition: {}", self.id, e);
                    self.abort_and_wait_for_termination().await;
                    return Err(e);
                }

                info!("Code package activated: {} instance={}", self.id, instance_id);

                if let Some(vsp) = self.vsp.upgrade() {
                    vsp.on_code_package_started(&self.name(), instance_id, self.is_activator())
                        .await;
                }
                Ok(())
            }
            Err(e) => {
                {
                    let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
                    stats.update_activation_stats(false);
                }
                warn!("Activation of {} failed: {}", self.id, e);
                self.state.force(CodePackageState::Inactive);
                self.schedule_next_activation();
                Err(e)
            }
        }
    }

    /// Stop the instance gracefully, killing it at the timeout. Success is
    /// unconditional for an already-inactive package.
    pub async fn deactivate(&self, timeout: Duration) -> Result<()> {
        self.cancel_retry();

        match self.state.current() {
            CodePackageState::Inactive
            | CodePackageState::Failed
            | CodePackageState::Aborted => return Ok(()),
            _ => {}
        }

        if self
            .state
            .try_transition(
                &[CodePackageState::Active, CodePackageState::Updating],
                CodePackageState::Stopping,
            )
            .is_err()
        {
            // Lost a race against an exit or another stop.
            return match self.state.current() {
                CodePackageState::Inactive
                | CodePackageState::Failed
                | CodePackageState::Aborted => Ok(()),
                current => Err(Error::InvalidState {
                    current: format!("{current:?}"),
                    operation: "deactivate".to_string(),
                }),
            };
        }

        let taken = {
            let mut guard = self.instance.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };

        if let Some(mut inst) = taken {
            info!("Deactivating code package {} instance={}", self.id, inst.instance_id);
            if let Err(e) = self
                .ctx
                .deps
                .process_activator
                .deactivate(&inst.handle, true, timeout)
                .await
            {
                warn!("Graceful stop of {} failed ({}), terminating", self.id, e);
                let _ = self.ctx.deps.process_activator.terminate(&inst.handle).await;
            }
            if let Some(monitor) = inst.monitor.take() {
                monitor.await;
            }
        }

        self.current_instance_id.store(0, Ordering::SeqCst);
        self.state.force(CodePackageState::Inactive);
        Ok(())
    }

    /// Kill the instance without a graceful window; returns only after the
    /// exit has been observed.
    pub async fn abort_and_wait_for_termination(&self) {
        self.cancel_retry();
        self.state.force(CodePackageState::Aborted);

        let taken = {
            let mut guard = self.instance.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };

        if let Some(mut inst) = taken {
            info!("Aborting code package {} instance={}", self.id, inst.instance_id);
            let _ = self.ctx.deps.process_activator.terminate(&inst.handle).await;
            if let Some(monitor) = inst.monitor.take() {
                monitor.await;
            }
        }

        self.current_instance_id.store(0, Ordering::SeqCst);
    }

    /// Adopt a new descriptor and version without restarting the instance.
    ///
    /// The updated context is published to the live instance out-of-band
    /// and resource-governance limits are tightened in place.
    pub async fn update_context(
        &self,
        new_description: DigestedCodePackageDescription,
        new_version_instance: ServicePackageVersionInstance,
        timeout: Duration,
    ) -> Result<()> {
        {
            let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
            shared.description = new_description.clone();
            shared.version_instance = new_version_instance;
            shared.process_description = None;
        }

        if self.state.current() != CodePackageState::Active {
            return Ok(());
        }
        self.state
            .try_transition(&[CodePackageState::Active], CodePackageState::Updating)?;

        let result = self
            .publish_context_update(&new_description, new_version_instance, timeout)
            .await;

        match self
            .state
            .try_transition(&[CodePackageState::Updating], CodePackageState::Active)
        {
            Ok(_) => result,
            // A concurrent stop/abort took over; its outcome wins.
            Err(_) => result,
        }
    }

    async fn publish_context_update(
        &self,
        new_description: &DigestedCodePackageDescription,
        new_version_instance: ServicePackageVersionInstance,
        timeout: Duration,
    ) -> Result<()> {
        let handle = {
            let guard = self.instance.lock().unwrap_or_else(|e| e.into_inner());
            guard.as_ref().map(|inst| inst.handle.clone())
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        let body = serde_json::json!({
            "code_package_instance_id": self.id,
            "rollout_version": new_description.rollout_version,
            "version_instance": new_version_instance,
        });

        let publish = self.ctx.deps.message_bus.notify(UPDATE_CONTEXT_ACTION, body);
        let timed_out = async {
            smol::Timer::after(timeout).await;
            Err(Error::Timeout)
        };
        smol::future::or(publish, timed_out).await?;

        let mut rg = new_description.resource_governance_policy.clone();
        let siblings = self.sibling_descriptions();
        self.ctx.resource_manager.adjust_cpu_policies_for_code_package(
            &self.service_package_instance_id,
            &siblings,
            &mut rg,
            new_description.entry_point.is_container(),
            new_description
                .container_policies
                .as_ref()
                .map(|p| p.is_container_group_member)
                .unwrap_or(false),
        );
        self.ctx
            .deps
            .process_activator
            .update_rg_policy(&handle, &rg)
            .await?;

        debug!("Context updated for {} to {}", self.id, new_version_instance);
        Ok(())
    }

    /// Deactivate then activate, but only if the given instance is still the
    /// live one; a stale instance id makes this a no-op.
    pub async fn restart_code_package_instance(
        &self,
        instance_id: i64,
        timeout: Duration,
    ) -> Result<()> {
        if self.current_instance_id() != instance_id {
            debug!(
                "Restart of {} skipped, instance {} is no longer current",
                self.id, instance_id
            );
            return Ok(());
        }
        self.deactivate(timeout).await?;
        self.activate(timeout).await
    }

    /// Ask the external activator to kill the instance, used by forced
    /// failover. `Ok(Some(due))` means the instance is not currently
    /// registered there and the caller should retry after `due`.
    pub async fn terminate_code_package_externally(&self) -> Result<Option<Duration>> {
        match self
            .ctx
            .deps
            .activator_client
            .terminate_process(&self.id.to_string())
            .await
        {
            Ok(()) => Ok(None),
            Err(Error::NotFound(_)) => {
                let failures = {
                    let stats = self.stats.read().unwrap_or_else(|e| e.into_inner());
                    stats.continuous_failure_count()
                };
                Ok(Some(self.ctx.config().retry_due_time(failures)))
            }
            Err(e) => Err(e),
        }
    }

    /// Docker reported the container unhealthy; restart it when the policy
    /// asks for that.
    pub async fn on_container_unhealthy(&self) {
        let restart = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            shared
                .description
                .container_policies
                .as_ref()
                .and_then(|p| p.health_config.as_ref())
                .map(|h| h.restart_container_on_unhealthy_docker_health_status)
                .unwrap_or(false)
        };
        if !restart {
            return;
        }

        let instance_id = self.current_instance_id();
        if instance_id == 0 {
            return;
        }
        warn!("Restarting unhealthy container for {}", self.id);
        let timeout = self.ctx.config().activation_timeout();
        if let Err(e) = self.restart_code_package_instance(instance_id, timeout).await {
            warn!("Restart of unhealthy container {} failed: {}", self.id, e);
        }
    }

    fn cancel_retry(&self) {
        self.retry.generation.fetch_add(1, Ordering::SeqCst);
        self.retry.pending.store(false, Ordering::SeqCst);
    }

    /// Schedule the next activation after a failure or exit, unless the
    /// owner is tearing down or the continuous-failure budget ran out.
    fn schedule_next_activation(&self) {
        let owner_terminal = match self.vsp.upgrade() {
            Some(vsp) => vsp.is_terminal(),
            None => true,
        };
        if owner_terminal {
            debug!("No retry for {}: owner is terminal", self.id);
            return;
        }

        let config = self.ctx.config();
        let stats = self.stats();
        if stats.max_continuous_failure_count() >= config.activation_max_failure_count {
            warn!(
                "Code package {} exceeded {} continuous failures, giving up",
                self.id, config.activation_max_failure_count
            );
            self.state.force(CodePackageState::Failed);
            return;
        }

        let run_interval = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            Duration::from_secs(shared.description.run_interval_secs)
        };
        let due = stats.due_time(
            run_interval,
            config.activation_retry_backoff(),
            config.activation_max_retry_interval(),
        );
        self.schedule_retry(due);
    }

    fn schedule_retry(&self, due: Duration) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let generation = self.retry.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.retry.pending.store(true, Ordering::SeqCst);
        debug!("Retry for {} scheduled in {:?}", self.id, due);

        smol::spawn(async move {
            smol::Timer::after(due).await;
            if this.retry.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            this.retry.pending.store(false, Ordering::SeqCst);
            if this.state.current() != CodePackageState::Inactive {
                return;
            }
            let timeout = this.ctx.config().activation_timeout();
            if let Err(e) = this.activate(timeout).await {
                debug!("Retry activation of {} failed: {}", this.id, e);
            }
        })
        .detach();
    }

    fn spawn_exit_monitor(&self, handle: InstanceHandle, instance_id: i64) -> smol::Task<()> {
        let receiver = self.ctx.deps.process_activator.subscribe_exit(&handle);
        let weak = self.weak_self.clone();
        smol::spawn(async move {
            let Ok(event) = receiver.recv().await else {
                return;
            };
            if let Some(this) = weak.upgrade() {
                this.on_process_exited(instance_id, event).await;
            }
        })
    }

    async fn on_process_exited(&self, instance_id: i64, event: ExitEvent) {
        if self.current_instance_id() != instance_id {
            return;
        }

        let config = self.ctx.config();
        {
            let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
            stats.update_exit_stats(event.exit_code, config.continuous_exit_failure_reset_interval());
        }

        if is_successful_exit(event.exit_code) {
            info!("Code package {} instance {} exited with {:#x}", self.id, instance_id, event.exit_code);
        } else {
            warn!("Code package {} instance {} failed with {:#x}", self.id, instance_id, event.exit_code);
        }

        let was_activator = self.is_activator();
        if let Some(vsp) = self.vsp.upgrade() {
            vsp.on_code_package_terminated(&self.name(), instance_id, event.exit_code, was_activator)
                .await;
        }

        if self.state.current() != CodePackageState::Active {
            return;
        }

        {
            let mut guard = self.instance.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(inst) = guard.as_mut() {
                if inst.instance_id == instance_id {
                    // The monitor is clearing its own entry; detach rather
                    // than cancel the running task.
                    if let Some(task) = inst.monitor.take() {
                        task.detach();
                    }
                    *guard = None;
                }
            }
        }
        self.current_instance_id.store(0, Ordering::SeqCst);
        self.state.force(CodePackageState::Inactive);
        self.schedule_next_activation();
    }

    fn sibling_descriptions(&self) -> Vec<DigestedCodePackageDescription> {
        match self.vsp.upgrade() {
            Some(vsp) => vsp.package_description().digested_code_packages,
            None => {
                let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
                vec![shared.description.clone()]
            }
        }
    }

    /// Synthesize the effective process description, caching it until the
    /// next context update.
    fn build_process_description(&self) -> ProcessDescription {
        {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            if let Some(cached) = &shared.process_description {
                return cached.clone();
            }
        }

        let description = {
            let shared = self.shared.read().unwrap_or_else(|e| e.into_inner());
            shared.description.clone()
        };

        let root = self.environment.run_layout_root.clone();
        let work_folder = root.join("work");
        let log_folder = root.join("log");
        let temp_folder = root.join("temp");

        let (exe_path, arguments, working_folder, is_container, container_image) =
            match &description.entry_point {
                EntryPointDescription::Exe {
                    program,
                    arguments,
                    working_folder,
                    ..
                } => {
                    let working = match working_folder {
                        hosting_model::WorkingFolder::Work => work_folder.clone(),
                        hosting_model::WorkingFolder::CodePackage => root.join(&description.name),
                        hosting_model::WorkingFolder::CodeBase => root.clone(),
                    };
                    (program.clone(), arguments.clone(), working, false, None)
                }
                EntryPointDescription::Container { image, commands, .. } => (
                    image.clone(),
                    commands.clone(),
                    work_folder.clone(),
                    true,
                    Some(image.clone()),
                ),
            };

        let mut environment = HashMap::new();
        environment.insert(well_known_env::NODE_NAME.to_string(), self.ctx.node_name.clone());
        environment.insert(well_known_env::NODE_ID.to_string(), self.ctx.node_id.clone());
        environment.insert(
            well_known_env::APPLICATION_NAME.to_string(),
            self.application_name.clone(),
        );
        environment.insert(
            well_known_env::APPLICATION_ID.to_string(),
            self.service_package_instance_id.application_id().to_string(),
        );
        environment.insert(
            well_known_env::SERVICE_PACKAGE_NAME.to_string(),
            self.service_package_instance_id.service_package_name().to_string(),
        );
        environment.insert(well_known_env::CODE_PACKAGE_NAME.to_string(), description.name.clone());
        environment.insert(
            well_known_env::CODE_PACKAGE_INSTANCE_ID.to_string(),
            self.id.to_string(),
        );
        environment.insert(
            well_known_env::ACTIVATOR_ADDRESS.to_string(),
            format!("net.pipe://{}/activator", self.ctx.node_id),
        );
        environment.insert(well_known_env::NETWORKING_MODE.to_string(), "Open".to_string());
        if let Some(debug_params) = &description.debug_parameters {
            environment.extend(debug_params.environment.clone());
        }
        environment.extend(self.extra_environment.clone());

        let mut rg = description.resource_governance_policy.clone();
        let siblings = self.sibling_descriptions();
        let is_container_group = description
            .container_policies
            .as_ref()
            .map(|p| p.is_container_group_member)
            .unwrap_or(false);
        self.ctx.resource_manager.adjust_cpu_policies_for_code_package(
            &self.service_package_instance_id,
            &siblings,
            &mut rg,
            is_container,
            is_container_group,
        );

        let mut port_bindings = HashMap::new();
        if let Some(policies) = &description.container_policies {
            for binding in &policies.port_bindings {
                if let Some(host_port) = self.environment.endpoints.get(&binding.endpoint_name) {
                    port_bindings.insert(binding.container_port, *host_port);
                }
            }
        }

        let built = ProcessDescription {
            exe_path,
            arguments,
            working_folder,
            log_folder,
            work_folder,
            temp_folder,
            environment,
            resource_governance: rg,
            job_object_name: hosted_service_job_object_name(&self.id.to_string()),
            ctrl_c_on_exit: !is_container,
            debug_parameters: description.debug_parameters.clone(),
            port_bindings,
            is_container_host: is_container,
            container_image,
        };

        {
            let mut shared = self.shared.write().unwrap_or_else(|e| e.into_inner());
            shared.process_description = Some(built.clone());
        }
        built
    }
}

impl std::fmt::Debug for CodePackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodePackage")
            .field("id", &self.id.to_string())
            .field("state", &self.state.current())
            .finish()
    }
}
