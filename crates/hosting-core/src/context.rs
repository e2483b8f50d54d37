//! Shared context handed to every component.

use crate::deps::{
    ActivatorClient, Deactivator, EnvironmentManager, HealthReporter, MessageBus, PackageStore,
    ProcessActivator,
};
use crate::resource_manager::{LocalResourceManager, NodeCapacities};
use crate::service_type::ServiceTypeStateManager;
use hosting_model::HostingConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// The capability implementations the engine runs against.
pub struct HostingDeps {
    /// Process/container activation primitive.
    pub process_activator: Arc<dyn ProcessActivator>,
    /// Environment setup/teardown.
    pub environment: Arc<dyn EnvironmentManager>,
    /// Health report sink.
    pub health: Arc<dyn HealthReporter>,
    /// Privileged OS operation fan-out.
    pub activator_client: Arc<dyn ActivatorClient>,
    /// Usage oracle of the deactivation subsystem.
    pub deactivator: Arc<dyn Deactivator>,
    /// Package descriptions and layout paths.
    pub package_store: Arc<dyn PackageStore>,
    /// Request/reply transport.
    pub message_bus: Arc<dyn MessageBus>,
}

/// Node-wide shared state: configuration snapshot, capabilities, and the
/// two per-node registries (resource manager, service type state).
///
/// Configuration is read-mostly; components take a snapshot via
/// [`HostingContext::config`] at the start of each operation.
pub struct HostingContext {
    /// Node name surfaced to hosted processes.
    pub node_name: String,
    /// Node id surfaced to hosted processes.
    pub node_id: String,
    config: RwLock<Arc<HostingConfig>>,
    /// Capability implementations.
    pub deps: HostingDeps,
    /// Per-node resource admission.
    pub resource_manager: Arc<LocalResourceManager>,
    /// Per-node service type registry.
    pub service_types: Arc<ServiceTypeStateManager>,
    sequence: AtomicU64,
}

impl HostingContext {
    /// Assemble a context, building the per-node registries from the given
    /// capabilities and capacities.
    pub fn new(
        node_name: impl Into<String>,
        node_id: impl Into<String>,
        config: HostingConfig,
        deps: HostingDeps,
        capacities: NodeCapacities,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let resource_manager = Arc::new(LocalResourceManager::new(
            config.clone(),
            deps.health.clone(),
            deps.activator_client.clone(),
            deps.message_bus.clone(),
            capacities,
        ));
        let service_types = Arc::new(ServiceTypeStateManager::new(config.clone()));

        Arc::new(Self {
            node_name: node_name.into(),
            node_id: node_id.into(),
            config: RwLock::new(config),
            deps,
            resource_manager,
            service_types,
            sequence: AtomicU64::new(1),
        })
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<HostingConfig> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration snapshot; in-flight operations keep the
    /// snapshot they started with.
    pub fn refresh_config(&self, config: HostingConfig) {
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }

    /// Next node-unique sequence number (operation ids, health sequences,
    /// activation instance ids).
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }
}
