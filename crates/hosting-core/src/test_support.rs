//! In-memory fakes for the capability traits, plus a test host builder.
//!
//! Everything here is deterministic and side-effect free apart from the
//! run-layout directories the fake environment manager creates under the
//! root it is given.

use crate::context::{HostingContext, HostingDeps};
use crate::deps::{
    ActivatorClient, Deactivator, EnvironmentContext, EnvironmentManager, HealthReportCode,
    HealthReporter, InstanceHandle, MessageBus, PackageStore, ProcessActivator,
};
use crate::resource_manager::NodeCapacities;
use crate::{Error, Result};
use async_channel::Receiver;
use async_trait::async_trait;
use hosting_model::{
    ApplicationIdentifier, DigestedCodePackageDescription, EntryPointDescription, ExitEvent,
    HostingConfig, ProcessDescription, ResourceGovernancePolicyDescription, RolloutVersion,
    ServicePackageDescription, ServicePackageIdentifier, ServicePackageInstanceIdentifier,
    ServicePackageResourceGovernanceDescription, ServicePackageVersion, WorkingFolder,
    PROCESS_DEACTIVATE_EXIT_CODE, STATUS_CONTROL_C_EXIT,
};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------
// Process activator
// ---------------------------------------------------------------------

struct FakeInstance {
    description: ProcessDescription,
    exit_tx: async_channel::Sender<ExitEvent>,
    exit_rx: Receiver<ExitEvent>,
    exited: bool,
}

#[derive(Default)]
struct FakeProcessActivatorInner {
    next_id: u64,
    instances: HashMap<u64, FakeInstance>,
    activation_log: Vec<ProcessDescription>,
    rg_updates: Vec<(u64, ResourceGovernancePolicyDescription)>,
    fail_next: VecDeque<Error>,
    fail_by_exe: HashMap<String, VecDeque<Error>>,
    activation_delay: Option<Duration>,
}

/// Fake process activator: instances are bookkeeping entries whose exits
/// are driven by the test.
#[derive(Default)]
pub struct FakeProcessActivator {
    inner: Mutex<FakeProcessActivatorInner>,
}

impl FakeProcessActivator {
    /// Create a fake with no scripted failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `count` activations (of any target) to fail.
    pub fn fail_next_activations(&self, count: usize, error: Error) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count {
            inner.fail_next.push_back(error.clone());
        }
    }

    /// Script the next `count` activations of a given exe/image to fail.
    pub fn fail_activations_of(&self, exe_path: &str, count: usize, error: Error) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let queue = inner.fail_by_exe.entry(exe_path.to_string()).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Delay every activation, forcing a real suspension point.
    pub fn set_activation_delay(&self, delay: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.activation_delay = Some(delay);
    }

    /// Total activation attempts that reached the fake (including scripted
    /// failures).
    pub fn activation_attempts(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.activation_log.len()
    }

    /// Instances started and not yet exited.
    pub fn running_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.instances.values().filter(|i| !i.exited).count()
    }

    /// Ids of running instances, ascending.
    pub fn running_instance_ids(&self) -> Vec<u64> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<u64> = inner
            .instances
            .iter()
            .filter(|(_, i)| !i.exited)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every description handed to `activate`, in order.
    pub fn descriptions(&self) -> Vec<ProcessDescription> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.activation_log.clone()
    }

    /// Recorded in-place governance updates.
    pub fn rg_updates(&self) -> Vec<(u64, ResourceGovernancePolicyDescription)> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rg_updates.clone()
    }

    /// Drive an exit for a running instance; returns whether one was sent.
    pub fn send_exit(&self, instance_id: u64, exit_code: u32) -> bool {
        let (sent, tx) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.instances.get_mut(&instance_id) {
                Some(instance) if !instance.exited => {
                    instance.exited = true;
                    (true, Some(instance.exit_tx.clone()))
                }
                _ => (false, None),
            }
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(ExitEvent::new(exit_code));
            tx.close();
        }
        sent
    }

    /// Drive an exit for the most recent running instance of an exe/image.
    pub fn send_exit_for_exe(&self, exe_path: &str, exit_code: u32) -> bool {
        let instance_id = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner
                .instances
                .iter()
                .filter(|(_, i)| !i.exited && i.description.exe_path == exe_path)
                .map(|(id, _)| *id)
                .max()
        };
        match instance_id {
            Some(id) => self.send_exit(id, exit_code),
            None => false,
        }
    }
}

#[async_trait]
impl ProcessActivator for FakeProcessActivator {
    async fn activate(&self, description: &ProcessDescription) -> Result<InstanceHandle> {
        let (scripted, delay) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.activation_log.push(description.clone());
            let scripted = inner
                .fail_by_exe
                .get_mut(&description.exe_path)
                .and_then(|queue| queue.pop_front())
                .or_else(|| inner.fail_next.pop_front());
            (scripted, inner.activation_delay)
        };

        if let Some(delay) = delay {
            smol::Timer::after(delay).await;
        }
        if let Some(error) = scripted {
            return Err(error);
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.next_id += 1;
        let id = inner.next_id;
        let (exit_tx, exit_rx) = async_channel::bounded(1);
        let container_name = description
            .is_container_host
            .then(|| format!("container-{id}"));
        inner.instances.insert(
            id,
            FakeInstance {
                description: description.clone(),
                exit_tx,
                exit_rx,
                exited: false,
            },
        );

        Ok(InstanceHandle {
            id,
            pid: Some(1000 + id as u32),
            container_name,
        })
    }

    async fn deactivate(
        &self,
        handle: &InstanceHandle,
        _graceful: bool,
        _timeout: Duration,
    ) -> Result<()> {
        self.send_exit(handle.id, PROCESS_DEACTIVATE_EXIT_CODE);
        Ok(())
    }

    async fn terminate(&self, handle: &InstanceHandle) -> Result<()> {
        self.send_exit(handle.id, STATUS_CONTROL_C_EXIT);
        Ok(())
    }

    async fn update_rg_policy(
        &self,
        handle: &InstanceHandle,
        rg: &ResourceGovernancePolicyDescription,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rg_updates.push((handle.id, rg.clone()));
        Ok(())
    }

    fn subscribe_exit(&self, handle: &InstanceHandle) -> Receiver<ExitEvent> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.instances.get(&handle.id) {
            Some(instance) => instance.exit_rx.clone(),
            None => {
                let (tx, rx) = async_channel::bounded(1);
                tx.close();
                rx
            }
        }
    }
}

// ---------------------------------------------------------------------
// Environment manager
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakeEnvironmentManagerInner {
    setup_count: u64,
    cleanups: Vec<ServicePackageInstanceIdentifier>,
    aborts: Vec<ServicePackageInstanceIdentifier>,
    fail_setup: Option<Error>,
}

/// Fake environment manager laying out run directories under a given root.
pub struct FakeEnvironmentManager {
    root: PathBuf,
    inner: Mutex<FakeEnvironmentManagerInner>,
}

impl FakeEnvironmentManager {
    /// Create a fake rooted at `root` (typically a temp directory).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(FakeEnvironmentManagerInner::default()),
        }
    }

    /// Make the next setup fail with `error`.
    pub fn fail_next_setup(&self, error: Error) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.fail_setup = Some(error);
    }

    /// Instances whose environment was cleaned up gracefully.
    pub fn cleanups(&self) -> Vec<ServicePackageInstanceIdentifier> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).cleanups.clone()
    }

    /// Instances whose environment was aborted.
    pub fn aborts(&self) -> Vec<ServicePackageInstanceIdentifier> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).aborts.clone()
    }
}

#[async_trait]
impl EnvironmentManager for FakeEnvironmentManager {
    async fn setup_service_package_environment(
        &self,
        id: &ServicePackageInstanceIdentifier,
        instance_id: u64,
        description: &ServicePackageDescription,
        _timeout: Duration,
    ) -> Result<EnvironmentContext> {
        let run_layout_root = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(error) = inner.fail_setup.take() {
                return Err(error);
            }
            inner.setup_count += 1;
            self.root.join(format!(
                "{}_{}_{}",
                id.application_id().application_number,
                id.service_package_name(),
                instance_id
            ))
        };
        std::fs::create_dir_all(&run_layout_root)?;

        let mut endpoints = HashMap::new();
        for (index, endpoint) in description.endpoints.iter().enumerate() {
            let port = if endpoint.port != 0 {
                endpoint.port
            } else {
                30_000 + index as u16
            };
            endpoints.insert(endpoint.name.clone(), port);
        }

        Ok(EnvironmentContext {
            service_package_instance_id: id.clone(),
            run_layout_root,
            endpoints,
            principal_user: description
                .digested_code_packages
                .iter()
                .find_map(|cp| cp.run_as_policy.as_ref().map(|p| p.user_name.clone())),
            current_user_sid: "S-1-5-21-1000".to_string(),
        })
    }

    async fn cleanup_service_package_environment(
        &self,
        context: &EnvironmentContext,
        _timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.cleanups.push(context.service_package_instance_id.clone());
        Ok(())
    }

    async fn abort_service_package_environment(&self, context: &EnvironmentContext) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.aborts.push(context.service_package_instance_id.clone());
    }
}

// ---------------------------------------------------------------------
// Health reporter
// ---------------------------------------------------------------------

/// One captured health report.
#[derive(Debug, Clone)]
pub struct CapturedHealthReport {
    /// Source key.
    pub key: String,
    /// Property.
    pub property: String,
    /// Report code.
    pub code: HealthReportCode,
    /// Description text.
    pub description: String,
    /// Sequence number.
    pub sequence: u64,
}

#[derive(Default)]
struct FakeHealthReporterInner {
    sources: HashSet<(String, String)>,
    reports: Vec<CapturedHealthReport>,
}

/// Fake health sink capturing every report.
#[derive(Default)]
pub struct FakeHealthReporter {
    inner: Mutex<FakeHealthReporterInner>,
}

impl FakeHealthReporter {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured reports, in order.
    pub fn reports(&self) -> Vec<CapturedHealthReport> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).reports.clone()
    }

    /// Number of captured reports with the given code.
    pub fn count_of(&self, code: HealthReportCode) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.reports.iter().filter(|r| r.code == code).count()
    }

    /// Whether a source is currently registered.
    pub fn has_source(&self, key: &str, property: &str) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sources.contains(&(key.to_string(), property.to_string()))
    }
}

impl HealthReporter for FakeHealthReporter {
    fn register_source(&self, key: &str, _application_name: &str, property: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sources.insert((key.to_string(), property.to_string()));
        Ok(())
    }

    fn unregister_source(&self, key: &str, property: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.sources.remove(&(key.to_string(), property.to_string()));
    }

    fn report(
        &self,
        key: &str,
        property: &str,
        code: HealthReportCode,
        description: &str,
        sequence: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.reports.push(CapturedHealthReport {
            key: key.to_string(),
            property: property.to_string(),
            code,
            description: description.to_string(),
            sequence,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Activator client
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakeActivatorClientInner {
    smb_shares: Vec<(String, PathBuf)>,
    dns_sids: Vec<String>,
    terminate_results: VecDeque<Result<()>>,
    terminated: Vec<String>,
    images: Vec<String>,
}

/// Fake privileged-operation client.
#[derive(Default)]
pub struct FakeActivatorClient {
    inner: Mutex<FakeActivatorClientInner>,
}

impl FakeActivatorClient {
    /// Create a fake that succeeds everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next terminate results (defaults to success once the
    /// queue is empty).
    pub fn script_terminate_results(&self, results: Vec<Result<()>>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.terminate_results = results.into();
    }

    /// Configured shares (name, local path).
    pub fn smb_shares(&self) -> Vec<(String, PathBuf)> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).smb_shares.clone()
    }

    /// SIDs DNS was configured with.
    pub fn dns_sids(&self) -> Vec<String> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).dns_sids.clone()
    }

    /// App service ids terminate was issued for.
    pub fn terminated(&self) -> Vec<String> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).terminated.clone()
    }

    /// Set the container images the node reports.
    pub fn set_images(&self, images: Vec<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.images = images;
    }
}

#[async_trait]
impl ActivatorClient for FakeActivatorClient {
    async fn configure_smb_share(
        &self,
        _sids: Vec<String>,
        _access_mask: u32,
        local_path: &Path,
        share_name: &str,
        _timeout: Duration,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.smb_shares.push((share_name.to_string(), local_path.to_path_buf()));
        Ok(())
    }

    async fn configure_node_for_dns(&self, sid: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.dns_sids.push(sid.to_string());
        Ok(())
    }

    async fn terminate_process(&self, app_service_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.terminated.push(app_service_id.to_string());
        inner.terminate_results.pop_front().unwrap_or(Ok(()))
    }

    async fn get_node_container_images(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).images.clone())
    }
}

// ---------------------------------------------------------------------
// Deactivator
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakeDeactivatorInner {
    unused_applications: HashSet<ApplicationIdentifier>,
    unused_service_packages: HashSet<ServicePackageInstanceIdentifier>,
    scheduled: Vec<ServicePackageInstanceIdentifier>,
    known: HashMap<ApplicationIdentifier, Vec<ServicePackageInstanceIdentifier>>,
}

/// Fake usage oracle: everything is in use unless marked otherwise.
#[derive(Default)]
pub struct FakeDeactivator {
    inner: Mutex<FakeDeactivatorInner>,
}

impl FakeDeactivator {
    /// Create a fake where everything is in use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an application unused.
    pub fn mark_application_unused(&self, id: ApplicationIdentifier) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.unused_applications.insert(id);
    }

    /// Mark a service package instance unused.
    pub fn mark_service_package_unused(&self, id: ServicePackageInstanceIdentifier) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.unused_service_packages.insert(id);
    }

    /// Register a known instance for after-upgrade walks.
    pub fn add_known_instance(&self, id: ServicePackageInstanceIdentifier) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .known
            .entry(id.application_id().clone())
            .or_default()
            .push(id);
    }

    /// Instances queued for deactivation.
    pub fn scheduled(&self) -> Vec<ServicePackageInstanceIdentifier> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).scheduled.clone()
    }
}

impl Deactivator for FakeDeactivator {
    fn is_application_used(&self, id: &ApplicationIdentifier) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !inner.unused_applications.contains(id)
    }

    fn is_service_package_instance_used(&self, id: &ServicePackageInstanceIdentifier) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !inner.unused_service_packages.contains(id)
    }

    fn schedule_deactivation_if_not_used(&self, id: &ServicePackageInstanceIdentifier) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.unused_service_packages.contains(id) {
            inner.scheduled.push(id.clone());
        }
    }

    fn service_package_instances_of(
        &self,
        id: &ApplicationIdentifier,
    ) -> Vec<ServicePackageInstanceIdentifier> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.known.get(id).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------
// Package store
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakePackageStoreInner {
    descriptions: HashMap<(ServicePackageIdentifier, ServicePackageVersion), ServicePackageDescription>,
}

/// Fake package store serving pre-seeded descriptions.
pub struct FakePackageStore {
    root: PathBuf,
    inner: Mutex<FakePackageStoreInner>,
}

impl FakePackageStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: Mutex::new(FakePackageStoreInner::default()),
        }
    }

    /// Seed a description for one package version.
    pub fn add_description(
        &self,
        id: ServicePackageIdentifier,
        version: ServicePackageVersion,
        description: ServicePackageDescription,
    ) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.descriptions.insert((id, version), description);
    }
}

impl PackageStore for FakePackageStore {
    fn service_package_description(
        &self,
        id: &ServicePackageIdentifier,
        version: &ServicePackageVersion,
    ) -> Result<ServicePackageDescription> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .descriptions
            .get(&(id.clone(), *version))
            .cloned()
            .ok_or_else(|| Error::ServiceManifestNotFound(format!("{id} at {version}")))
    }

    fn run_layout_root(&self, id: &ApplicationIdentifier) -> PathBuf {
        self.root.join(id.to_string())
    }
}

// ---------------------------------------------------------------------
// Message bus
// ---------------------------------------------------------------------

#[derive(Default)]
struct FakeMessageBusInner {
    notifications: Vec<(String, Value)>,
}

/// Fake transport recording notifications and answering requests with null.
#[derive(Default)]
pub struct FakeMessageBus {
    inner: Mutex<FakeMessageBusInner>,
}

impl FakeMessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// All notifications, in order.
    pub fn notifications(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).notifications.clone()
    }

    /// Number of notifications for one action.
    pub fn count_of(&self, action: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.notifications.iter().filter(|(a, _)| a == action).count()
    }
}

#[async_trait]
impl MessageBus for FakeMessageBus {
    async fn request(&self, _action: &str, _body: Value) -> Result<Value> {
        Ok(Value::Null)
    }

    async fn notify(&self, action: &str, body: Value) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.notifications.push((action.to_string(), body));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Test host
// ---------------------------------------------------------------------

/// Everything a test needs: a hosting context wired to fakes, with the
/// fakes retained for scripting and assertions.
pub struct TestHost {
    /// The assembled context.
    pub ctx: Arc<HostingContext>,
    /// Fake process activator.
    pub process_activator: Arc<FakeProcessActivator>,
    /// Fake environment manager.
    pub environment: Arc<FakeEnvironmentManager>,
    /// Fake health sink.
    pub health: Arc<FakeHealthReporter>,
    /// Fake privileged-operation client.
    pub activator_client: Arc<FakeActivatorClient>,
    /// Fake usage oracle.
    pub deactivator: Arc<FakeDeactivator>,
    /// Fake package store.
    pub package_store: Arc<FakePackageStore>,
    /// Fake transport.
    pub message_bus: Arc<FakeMessageBus>,
}

impl TestHost {
    /// Build a host with a test-friendly configuration: fast retries, no
    /// auto-detection, generous declared capacity.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let config = HostingConfig {
            activation_retry_backoff_millis: 10,
            activation_max_retry_interval_secs: 1,
            auto_detect_available_resources: false,
            local_resource_manager_test_mode: true,
            ..Default::default()
        };
        Self::with_config(root, config)
    }

    /// Build a host with an explicit configuration.
    pub fn with_config(root: impl Into<PathBuf>, config: HostingConfig) -> Self {
        Self::with_config_and_capacities(
            root,
            config,
            NodeCapacities {
                declared_cpu_cores: Some(64.0),
                declared_memory_mb: Some(262_144),
                physical_cpu_cores: 64,
                physical_memory_mb: 262_144,
            },
        )
    }

    /// Build a host with explicit configuration and node capacities.
    pub fn with_config_and_capacities(
        root: impl Into<PathBuf>,
        config: HostingConfig,
        capacities: NodeCapacities,
    ) -> Self {
        let root = root.into();
        let process_activator = Arc::new(FakeProcessActivator::new());
        let environment = Arc::new(FakeEnvironmentManager::new(root.join("env")));
        let health = Arc::new(FakeHealthReporter::new());
        let activator_client = Arc::new(FakeActivatorClient::new());
        let deactivator = Arc::new(FakeDeactivator::new());
        let package_store = Arc::new(FakePackageStore::new(root.join("store")));
        let message_bus = Arc::new(FakeMessageBus::new());

        let ctx = HostingContext::new(
            "test-node",
            "node-1",
            config,
            HostingDeps {
                process_activator: process_activator.clone(),
                environment: environment.clone(),
                health: health.clone(),
                activator_client: activator_client.clone(),
                deactivator: deactivator.clone(),
                package_store: package_store.clone(),
                message_bus: message_bus.clone(),
            },
            capacities,
        );

        Self {
            ctx,
            process_activator,
            environment,
            health,
            activator_client,
            deactivator,
            package_store,
            message_bus,
        }
    }
}

// ---------------------------------------------------------------------
// Description builders
// ---------------------------------------------------------------------

/// Digested exe code package with the given name and rollout version.
pub fn exe_code_package(name: &str, rollout: RolloutVersion) -> DigestedCodePackageDescription {
    DigestedCodePackageDescription {
        name: name.to_string(),
        version: "1.0".to_string(),
        rollout_version: rollout,
        is_shared: false,
        is_activator: false,
        entry_point: EntryPointDescription::Exe {
            program: format!("{name}.exe"),
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
            ..Default::default()
        },
        container_policies: None,
        run_interval_secs: 0,
    }
}

/// Service package description with the given checksum and code packages.
pub fn package_description(
    checksum: &str,
    code_packages: Vec<DigestedCodePackageDescription>,
) -> ServicePackageDescription {
    ServicePackageDescription {
        manifest_version: "1.0".to_string(),
        content_checksum: checksum.to_string(),
        digested_code_packages: code_packages,
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
