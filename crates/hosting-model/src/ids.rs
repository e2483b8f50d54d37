//! Identifier scheme for hosted entities.
//!
//! Identity is hierarchical: an application owns service packages, a service
//! package instance is a service package plus an activation context, and a
//! code package instance is a code package scoped to the activation context
//! of its owning service package instance.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Application type name reserved for system services.
pub const SYSTEM_APPLICATION_TYPE: &str = "System";

/// Identity of an application on a node, stable across the node's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApplicationIdentifier {
    /// Application type name from the application manifest.
    pub application_type_name: String,
    /// Node-unique application number.
    pub application_number: u64,
}

impl ApplicationIdentifier {
    /// Create a new application identifier.
    pub fn new(application_type_name: impl Into<String>, application_number: u64) -> Self {
        Self {
            application_type_name: application_type_name.into(),
            application_number,
        }
    }

    /// Whether this application belongs to the system application type.
    pub fn is_system(&self) -> bool {
        self.application_type_name == SYSTEM_APPLICATION_TYPE
    }
}

impl fmt::Display for ApplicationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_App{}", self.application_type_name, self.application_number)
    }
}

/// Identity of a service package within an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServicePackageIdentifier {
    /// Owning application.
    pub application_id: ApplicationIdentifier,
    /// Service package name from the service manifest.
    pub service_package_name: String,
}

impl ServicePackageIdentifier {
    /// Create a new service package identifier.
    pub fn new(application_id: ApplicationIdentifier, name: impl Into<String>) -> Self {
        Self {
            application_id,
            service_package_name: name.into(),
        }
    }
}

impl fmt::Display for ServicePackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application_id, self.service_package_name)
    }
}

/// How a service package instance shares its host environment.
///
/// Two exclusive instances of the same service package coexist on a node;
/// shared instances are unique per service package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivationContext {
    /// One shared instance per service package on the node.
    Shared,
    /// A dedicated instance keyed by the partition that requested it.
    Exclusive {
        /// Identity of the exclusive activation.
        activation_guid: Uuid,
    },
}

impl ActivationContext {
    /// Create an exclusive context with a fresh guid.
    pub fn new_exclusive() -> Self {
        Self::Exclusive {
            activation_guid: Uuid::new_v4(),
        }
    }

    /// Whether this is an exclusive context.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Exclusive { .. })
    }
}

impl fmt::Display for ActivationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Exclusive { activation_guid } => write!(f, "exclusive:{activation_guid}"),
        }
    }
}

/// Identity of one concrete runtime instance of a service package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServicePackageInstanceIdentifier {
    /// The service package being instantiated.
    pub service_package_id: ServicePackageIdentifier,
    /// Sharing mode of this instance.
    pub activation_context: ActivationContext,
    /// Public activation id handed back to callers.
    pub public_activation_id: String,
}

impl ServicePackageInstanceIdentifier {
    /// Create a new service package instance identifier.
    pub fn new(
        service_package_id: ServicePackageIdentifier,
        activation_context: ActivationContext,
        public_activation_id: impl Into<String>,
    ) -> Self {
        Self {
            service_package_id,
            activation_context,
            public_activation_id: public_activation_id.into(),
        }
    }

    /// Shared instance with an empty public activation id.
    pub fn shared(service_package_id: ServicePackageIdentifier) -> Self {
        Self::new(service_package_id, ActivationContext::Shared, "")
    }

    /// Owning application identifier.
    pub fn application_id(&self) -> &ApplicationIdentifier {
        &self.service_package_id.application_id
    }

    /// Service package name.
    pub fn service_package_name(&self) -> &str {
        &self.service_package_id.service_package_name
    }
}

impl fmt::Display for ServicePackageInstanceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.service_package_id, self.activation_context)
    }
}

/// Identity of a code package within a service package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodePackageIdentifier {
    /// Owning service package.
    pub service_package_id: ServicePackageIdentifier,
    /// Code package name from the service manifest.
    pub code_package_name: String,
}

impl fmt::Display for CodePackageIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service_package_id, self.code_package_name)
    }
}

/// Identity of a code package scoped to one service package instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CodePackageInstanceIdentifier {
    /// The code package.
    pub code_package_id: CodePackageIdentifier,
    /// Activation context of the owning service package instance.
    pub activation_context: ActivationContext,
}

impl CodePackageInstanceIdentifier {
    /// Create a code package instance identifier from its parts.
    pub fn new(
        service_package_instance_id: &ServicePackageInstanceIdentifier,
        code_package_name: impl Into<String>,
    ) -> Self {
        Self {
            code_package_id: CodePackageIdentifier {
                service_package_id: service_package_instance_id.service_package_id.clone(),
                code_package_name: code_package_name.into(),
            },
            activation_context: service_package_instance_id.activation_context.clone(),
        }
    }

    /// Code package name.
    pub fn code_package_name(&self) -> &str {
        &self.code_package_id.code_package_name
    }
}

impl fmt::Display for CodePackageInstanceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.code_package_id, self.activation_context)
    }
}

/// Identity of a declared service type within a service package instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceTypeInstanceIdentifier {
    /// Owning service package instance.
    pub service_package_instance_id: ServicePackageInstanceIdentifier,
    /// Service type name.
    pub service_type_name: String,
}

impl ServiceTypeInstanceIdentifier {
    /// Create a new service type instance identifier.
    pub fn new(
        service_package_instance_id: ServicePackageInstanceIdentifier,
        service_type_name: impl Into<String>,
    ) -> Self {
        Self {
            service_package_instance_id,
            service_type_name: service_type_name.into(),
        }
    }
}

impl fmt::Display for ServiceTypeInstanceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_package_instance_id, self.service_type_name)
    }
}
