//! Typed request/reply bodies and the action dispatch table.
//!
//! Wire framing and routing are owned by the message bus; this module only
//! defines the bodies the hosting core produces and consumes, plus a
//! compile-time registry mapping action strings to typed async handlers.

use crate::ids::CodePackageInstanceIdentifier;
use crate::process::ProcessDescription;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Action strings routed over the message bus.
pub mod actions {
    /// Start a process or container host.
    pub const ACTIVATE_PROCESS: &str = "ActivateProcess";
    /// Stop a code package instance.
    pub const DEACTIVATE_CODE_PACKAGE: &str = "DeactivateCodePackage";
    /// Stop a container.
    pub const DEACTIVATE_CONTAINER: &str = "DeactivateContainer";
    /// Export certificates into a container work directory.
    pub const CONFIGURE_CONTAINER_CERTIFICATE_EXPORT: &str =
        "ConfigureContainerCertificateExport";
    /// ACL shared folders for a package.
    pub const CONFIGURE_SHARED_FOLDER_ACL: &str = "ConfigureSharedFolderAcl";
    /// List deployed networks of a given type.
    pub const GET_DEPLOYED_NETWORKS: &str = "GetDeployedNetworks";
    /// Complete registration of an application host.
    pub const FINISH_REGISTER_APPLICATION_HOST: &str = "FinishRegisterApplicationHost";
    /// Take the node out of rotation.
    pub const DISABLE_NODE: &str = "DisableNode";
    /// Remove application folders.
    pub const DELETE_FOLDER: &str = "DeleteFolder";
    /// On-demand code package operation from an application host.
    pub const APPLICATION_HOST_CODE_PACKAGE_OPERATION: &str =
        "ApplicationHostCodePackageOperation";
    /// Container health status batch from the container event monitor.
    pub const CONTAINER_HEALTH_CHECK_STATUS_CHANGE: &str = "ContainerHealthCheckStatusChange";
}

/// Generic status reply carried by acknowledgement-only actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReplyStatus {
    /// Error text; `None` means success.
    pub error: Option<String>,
}

impl ReplyStatus {
    /// Successful reply.
    pub fn ok() -> Self {
        Self { error: None }
    }

    /// Failed reply with an error description.
    pub fn failed(error: impl Into<String>) -> Self {
        Self { error: Some(error.into()) }
    }
}

/// Request to start a process or container host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateProcessRequest {
    /// Pid of the requesting parent.
    pub parent_pid: u32,
    /// Node identity.
    pub node_id: String,
    /// Owning application id, rendered.
    pub app_id: String,
    /// Application service id the instance runs under.
    pub app_service_id: String,
    /// Full process description.
    pub process_description: ProcessDescription,
    /// User account the instance runs as.
    pub user_id: Option<String>,
    /// Operation deadline in milliseconds.
    pub timeout_millis: u64,
    /// Folder holding the platform binaries.
    pub fabric_bin_folder: String,
    /// Whether the instance is a container host.
    pub is_container_host: bool,
}

/// Reply to [`ActivateProcessRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivateProcessReply {
    /// Status of the activation.
    pub status: ReplyStatus,
    /// Opaque handle to the started instance.
    pub handle: Option<u64>,
}

/// Request to stop a code package instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateCodePackageRequest {
    /// Instance being stopped.
    pub code_package_instance_id: CodePackageInstanceIdentifier,
    /// Activation id of the instance.
    pub activation_id: u64,
    /// Operation deadline in milliseconds.
    pub timeout_millis: u64,
}

/// Request to stop a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateContainerRequest {
    /// Container name or id.
    pub container_name: String,
    /// Deliver a stop signal before killing.
    pub graceful: bool,
    /// Operation deadline in milliseconds.
    pub timeout_millis: u64,
}

/// Request to export certificates into a container work directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureContainerCertificateExportRequest {
    /// Certificate references keyed by code package name.
    pub certificate_refs: HashMap<String, Vec<crate::description::ContainerCertificateDescription>>,
    /// Work directory receiving the exported material.
    pub work_dir: String,
}

/// Request to ACL shared folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureSharedFolderAclRequest {
    /// Folders to ACL.
    pub shared_folders: Vec<String>,
    /// Operation deadline in milliseconds.
    pub timeout_millis: u64,
}

/// Request to list deployed networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDeployedNetworksRequest {
    /// Network type filter.
    pub network_type: String,
}

/// Reply to [`GetDeployedNetworksRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDeployedNetworksReply {
    /// Deployed network names.
    pub network_names: Vec<String>,
}

/// Request to complete an application host registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRegisterApplicationHostRequest {
    /// Host id completing registration.
    pub application_host_id: String,
}

/// Request to take the node out of rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisableNodeRequest {
    /// Operator-visible reason.
    pub reason: String,
}

/// Request to remove application folders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFolderRequest {
    /// Node identity.
    pub node_id: String,
    /// Folders to delete.
    pub app_folders: Vec<String>,
}

/// Kind of on-demand code package operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodePackageOperationType {
    /// Bring dependent code packages up.
    Activate,
    /// Stop dependent code packages gracefully.
    Deactivate,
    /// Stop dependent code packages immediately.
    Abort,
}

/// Identity of the application host issuing an on-demand operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationHostContext {
    /// Host id.
    pub host_id: String,
    /// Host process id.
    pub process_id: u32,
}

/// Code package context of the issuing host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePackageContext {
    /// Instance the host runs as.
    pub code_package_instance_id: CodePackageInstanceIdentifier,
    /// Activation instance id the host observed at startup.
    pub activator_instance_id: i64,
}

/// On-demand code package operation issued by an activator code package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodePackageOperationRequest {
    /// What to do.
    pub operation_type: CodePackageOperationType,
    /// Issuing host.
    pub host_context: ApplicationHostContext,
    /// Issuing code package.
    pub code_context: CodePackageContext,
    /// Target code package names; ignored when `is_all_code_packages`.
    pub code_package_names: Vec<String>,
    /// Extra environment applied on activate.
    pub environment_block: HashMap<String, String>,
    /// Operation deadline in milliseconds.
    pub timeout_millis: u64,
    /// Target every dependent code package of the instance.
    pub is_all_code_packages: bool,
}

/// Health observation for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHealthStatusInfo {
    /// Application host running the container.
    pub host_id: String,
    /// Container name.
    pub container_name: String,
    /// Observation timestamp.
    pub time_stamp_utc: DateTime<Utc>,
    /// Whether docker reports the container healthy.
    pub is_healthy: bool,
}

/// Batched container health observations for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHealthStatusNotification {
    /// Node identity.
    pub node_id: String,
    /// Observations in arrival order.
    pub health_infos: Vec<ContainerHealthStatusInfo>,
}

/// Error raised by the dispatch table.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No handler registered for the action.
    #[error("no handler registered for action '{0}'")]
    UnknownAction(String),

    /// An action was registered twice.
    #[error("action '{0}' already registered")]
    DuplicateAction(String),

    /// The request body did not deserialize into the handler's type.
    #[error("malformed body for action '{action}': {message}")]
    MalformedBody {
        /// The action whose body failed to parse.
        action: String,
        /// Deserialization error text.
        message: String,
    },

    /// The handler failed.
    #[error("handler for '{action}' failed: {message}")]
    HandlerFailed {
        /// The action whose handler failed.
        action: String,
        /// Handler error text.
        message: String,
    },
}

type HandlerFn = Box<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send + 'static>>
        + Send
        + Sync
        + 'static,
>;

/// Registry mapping action strings to typed async handlers.
///
/// Handlers take a typed request body and return a typed reply body; the
/// registry owns the JSON (de)serialization at the boundary.
#[derive(Default)]
pub struct MessageDispatcher {
    handlers: HashMap<&'static str, HandlerFn>,
}

impl MessageDispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for an action.
    pub fn register<Req, Reply, F, Fut>(
        &mut self,
        action: &'static str,
        handler: F,
    ) -> Result<(), DispatchError>
    where
        Req: for<'de> Deserialize<'de> + Send + 'static,
        Reply: Serialize + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, String>> + Send + 'static,
    {
        if self.handlers.contains_key(action) {
            return Err(DispatchError::DuplicateAction(action.to_string()));
        }

        let wrapped: HandlerFn = Box::new(move |body: Value| {
            match serde_json::from_value::<Req>(body) {
                Ok(request) => {
                    let fut = handler(request);
                    Box::pin(async move {
                        let reply = fut.await?;
                        serde_json::to_value(reply).map_err(|e| e.to_string())
                    }) as Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
                }
                Err(e) => {
                    let msg = format!("__malformed__:{e}");
                    Box::pin(async move { Err(msg) })
                        as Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
                }
            }
        });

        self.handlers.insert(action, wrapped);
        Ok(())
    }

    /// Dispatch a raw body to the handler registered for `action`.
    pub async fn dispatch(&self, action: &str, body: Value) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .get(action)
            .ok_or_else(|| DispatchError::UnknownAction(action.to_string()))?;

        handler(body).await.map_err(|message| {
            if let Some(detail) = message.strip_prefix("__malformed__:") {
                DispatchError::MalformedBody {
                    action: action.to_string(),
                    message: detail.to_string(),
                }
            } else {
                DispatchError::HandlerFailed {
                    action: action.to_string(),
                    message,
                }
            }
        })
    }

    /// Registered action names.
    pub fn actions(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[smol_potat::test]
    async fn test_dispatch_round_trip() {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(
                actions::DISABLE_NODE,
                |req: DisableNodeRequest| async move {
                    Ok::<_, String>(ReplyStatus::failed(req.reason))
                },
            )
            .unwrap();

        let body = serde_json::to_value(DisableNodeRequest {
            reason: "maintenance".to_string(),
        })
        .unwrap();

        let reply = dispatcher.dispatch(actions::DISABLE_NODE, body).await.unwrap();
        let reply: ReplyStatus = serde_json::from_value(reply).unwrap();
        assert_eq!(reply.error.as_deref(), Some("maintenance"));
    }

    #[smol_potat::test]
    async fn test_unknown_action_is_rejected() {
        let dispatcher = MessageDispatcher::new();
        let result = dispatcher.dispatch("Nope", Value::Null).await;
        assert!(matches!(result, Err(DispatchError::UnknownAction(_))));
    }

    #[smol_potat::test]
    async fn test_duplicate_registration_is_rejected() {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(actions::DISABLE_NODE, |_req: DisableNodeRequest| async move {
                Ok::<_, String>(ReplyStatus::ok())
            })
            .unwrap();
        let dup = dispatcher.register(actions::DISABLE_NODE, |_req: DisableNodeRequest| async move {
            Ok::<_, String>(ReplyStatus::ok())
        });
        assert!(matches!(dup, Err(DispatchError::DuplicateAction(_))));
    }

    #[smol_potat::test]
    async fn test_malformed_body_is_rejected() {
        let mut dispatcher = MessageDispatcher::new();
        dispatcher
            .register(actions::DISABLE_NODE, |_req: DisableNodeRequest| async move {
                Ok::<_, String>(ReplyStatus::ok())
            })
            .unwrap();

        let result = dispatcher
            .dispatch(actions::DISABLE_NODE, serde_json::json!({"bogus": true}))
            .await;
        assert!(matches!(result, Err(DispatchError::MalformedBody { .. })));
    }
}
