//! # Hosting model
//!
//! Shared data model for the node-local hosting subsystem: the identifier
//! scheme for applications, service packages and code packages, the
//! immutable per-version package descriptions, the process description
//! handed to the process activator, the node-wide configuration snapshot,
//! and the typed request/reply bodies exchanged with the privileged
//! activator process.
//!
//! Everything in this crate is plain data; the lifecycle engine lives in
//! `hosting-core`.

#![warn(missing_docs)]
#![warn(unsafe_code)]

mod config;
mod description;
mod ids;
mod messages;
mod process;
mod version;

pub use config::HostingConfig;
pub use description::{
    ContainerCertificateDescription, ContainerHealthConfig, ContainerLabel,
    ContainerPoliciesDescription, DebugParametersDescription, DigestedCodePackageDescription,
    DigestedDataPackageDescription, EndpointResourceDescription, EntryPointDescription,
    PortBinding, ResourceGovernancePolicyDescription, RunAsPolicyDescription,
    ServicePackageDescription, ServicePackageResourceGovernanceDescription,
    ServiceTypeDescription, VolumeMount, WorkingFolder,
};
pub use ids::{
    ActivationContext, ApplicationIdentifier, CodePackageIdentifier,
    CodePackageInstanceIdentifier, ServicePackageIdentifier, ServicePackageInstanceIdentifier,
    ServiceTypeInstanceIdentifier, SYSTEM_APPLICATION_TYPE,
};
pub use messages::{
    actions, ActivateProcessReply, ActivateProcessRequest, ApplicationHostContext,
    CodePackageContext, CodePackageOperationRequest, CodePackageOperationType,
    ConfigureContainerCertificateExportRequest, ConfigureSharedFolderAclRequest,
    ContainerHealthStatusInfo, ContainerHealthStatusNotification, DeactivateCodePackageRequest,
    DeactivateContainerRequest, DeleteFolderRequest, DisableNodeRequest, DispatchError,
    FinishRegisterApplicationHostRequest, GetDeployedNetworksReply, GetDeployedNetworksRequest,
    MessageDispatcher, ReplyStatus,
};
pub use process::{
    hosted_service_job_object_name, is_successful_exit, well_known_env, ExitEvent,
    ProcessDescription, PROCESS_DEACTIVATE_EXIT_CODE, STATUS_CONTROL_C_EXIT,
};
pub use version::{
    ApplicationVersion, RolloutVersion, RolloutVersionParseError, ServicePackageVersion,
    ServicePackageVersionInstance,
};
