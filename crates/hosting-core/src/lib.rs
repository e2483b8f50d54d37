//! # Hosting core
//!
//! The activation/lifecycle engine of the node-local hosting subsystem: the
//! nested state machines that drive a service package instance from declared
//! through activated to deactivated, the versioned service package that owns
//! its code packages, the activator that serializes retried activations with
//! health reporting, and the per-node local resource manager that admits and
//! governs CPU/memory.
//!
//! External effects (process launch, environment setup, privileged OS
//! operations, health sinks) are reached through the capability traits in
//! [`deps`]; the engine itself performs no I/O beyond the per-instance
//! current-package marker file.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod activator;
pub mod application;
pub mod code_package;
mod context;
pub mod deps;
pub mod operation_status;
pub mod query;
pub mod resource_manager;
pub mod run_stats;
pub mod service_type;
mod state;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
pub mod versioned_service_package;

pub use activator::{Activator, EnsureAfterUpgradeOutcome};
pub use application::{Application, ApplicationMap, ApplicationState};
pub use code_package::{CodePackage, CodePackageState};
pub use context::{HostingContext, HostingDeps};
pub use operation_status::{OperationState, OperationStatus, OperationStatusMap};
pub use query::{DeployedCodePackageInfo, HostingQueryManager};
pub use resource_manager::{LocalResourceManager, NodeCapacities, CPU_CORRECTION_FACTOR};
pub use run_stats::RunStats;
pub use service_type::{ServiceTypeRegistration, ServiceTypeStateManager};
pub use versioned_service_package::{UpgradeImpact, VersionedServicePackage, VspState};

/// Error type for hosting operations.
///
/// Variants group into the taxonomy the engine reasons about: transient
/// errors are surfaced and sometimes retried, admission errors come from the
/// local resource manager, protocol errors are part of the activation
/// contract, content errors indicate missing package material, and
/// `InvalidState` marks a denied state-machine transition that is never
/// shown to users.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The operation did not finish within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was canceled by its owner.
    #[error("operation canceled")]
    OperationCanceled,

    /// A lookup raced with removal.
    #[error("not found: {0}")]
    NotFound(String),

    /// The component has been closed.
    #[error("object closed")]
    ObjectClosed,

    /// Not enough CPU capacity to admit a service package.
    #[error("not enough CPU for service package: requested {requested_cores} cores, available {available_cores}")]
    NotEnoughCpuForServicePackage {
        /// Cores requested by the package.
        requested_cores: f64,
        /// Cores currently available on the node.
        available_cores: f64,
    },

    /// Not enough memory capacity to admit a service package.
    #[error("not enough memory for service package: requested {requested_mb} MB, available {available_mb} MB")]
    NotEnoughMemoryForServicePackage {
        /// Memory requested by the package, MB.
        requested_mb: u64,
        /// Memory currently available on the node, MB.
        available_mb: u64,
    },

    /// A service package re-registered with different governance settings.
    #[error("service package already registered with resource manager: {0}")]
    ServicePackageAlreadyRegistered(String),

    /// Another activation for the same id is in flight.
    #[error("activation already in progress: {0}")]
    ActivationInProgress(String),

    /// The activated entity is no longer in use; activation short-circuited.
    #[error("activation entity not in use: {0}")]
    ActivationEntityNotInUse(String),

    /// The requested application version does not match the open one.
    #[error("application version mismatch: open at {open}, requested {requested}")]
    ApplicationVersionMismatch {
        /// Version the application is open at.
        open: String,
        /// Version the caller requested.
        requested: String,
    },

    /// The requested service package version does not match the open one.
    #[error("service package version mismatch: open at {open}, requested {requested}")]
    ServicePackageVersionMismatch {
        /// Version the package is open at.
        open: String,
        /// Version the caller requested.
        requested: String,
    },

    /// An on-demand request carried a stale activator instance id.
    #[error("activator instance id mismatch: current {current}, requested {requested}")]
    InstanceIdMismatch {
        /// Current activator code package instance id.
        current: i64,
        /// Instance id the request carried.
        requested: i64,
    },

    /// A runtime registered twice for the same service type.
    #[error("runtime already registered: {0}")]
    RuntimeAlreadyRegistered(String),

    /// No runtime registration exists for the service type.
    #[error("runtime not registered: {0}")]
    RuntimeNotRegistered(String),

    /// The service type has been disabled on this node.
    #[error("service type disabled: {0}")]
    ServiceTypeDisabled(String),

    /// A referenced code package does not exist in the description.
    #[error("code package not found: {0}")]
    CodePackageNotFound(String),

    /// The service manifest is missing from the package store.
    #[error("service manifest not found: {0}")]
    ServiceManifestNotFound(String),

    /// The application is not deployed on this node.
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    /// A query result entry exceeded the reply size limit.
    #[error("entry too large")]
    EntryTooLarge,

    /// A paged query hit its result cap.
    #[error("max results reached")]
    MaxResultsReached,

    /// A state-machine transition was denied.
    #[error("invalid state: {current} does not allow {operation}")]
    InvalidState {
        /// State the machine was observed in.
        current: String,
        /// Operation that was denied.
        operation: String,
    },

    /// Filesystem error around the current-package marker file.
    #[error("io error: {0}")]
    Io(String),

    /// Uncategorized error from a capability implementation.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Internal errors are bookkeeping noise: they are never counted as
    /// activation failures and never reported as health.
    pub fn is_internal(&self) -> bool {
        matches!(self, Error::InvalidState { .. } | Error::ObjectClosed)
    }

    /// Transient errors may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout | Error::OperationCanceled | Error::NotFound(_) | Error::ObjectClosed
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

/// Result type alias for hosting operations.
pub type Result<T> = std::result::Result<T, Error>;
