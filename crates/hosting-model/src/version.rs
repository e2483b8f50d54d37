//! Version stamps for service packages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error parsing a rollout version from text.
#[derive(Debug, Error)]
#[error("invalid rollout version '{text}'")]
pub struct RolloutVersionParseError {
    /// The text that failed to parse.
    pub text: String,
}

/// The version stamp that drives upgrade diffing between two package
/// descriptions. Ordered by (major, minor).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RolloutVersion {
    /// Incremented on content changes.
    pub major: u64,
    /// Incremented on configuration-only changes.
    pub minor: u64,
}

impl RolloutVersion {
    /// Create a new rollout version.
    pub fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for RolloutVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for RolloutVersion {
    type Err = RolloutVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || RolloutVersionParseError { text: s.to_string() };
        let (major, minor) = s.split_once('.').ok_or_else(err)?;
        Ok(Self {
            major: major.parse().map_err(|_| err())?,
            minor: minor.parse().map_err(|_| err())?,
        })
    }
}

/// Version of an application as rolled out on the node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ApplicationVersion(pub RolloutVersion);

impl fmt::Display for ApplicationVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Version of a service package: the owning application version plus the
/// package's own rollout version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ServicePackageVersion {
    /// Application version this package ships in.
    pub application_version: ApplicationVersion,
    /// Rollout version of the package itself.
    pub rollout_version: RolloutVersion,
}

impl fmt::Display for ServicePackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application_version, self.rollout_version)
    }
}

/// A service package version plus the activation instance counter.
///
/// The instance id increments on each re-activation of the same version, so
/// two activations of version V are distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ServicePackageVersionInstance {
    /// The package version.
    pub version: ServicePackageVersion,
    /// Activation instance counter.
    pub instance_id: u64,
}

impl ServicePackageVersionInstance {
    /// Create a new version instance.
    pub fn new(version: ServicePackageVersion, instance_id: u64) -> Self {
        Self { version, instance_id }
    }
}

impl fmt::Display for ServicePackageVersionInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.version, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollout_version_ordering() {
        let v1_0: RolloutVersion = "1.0".parse().unwrap();
        let v1_2: RolloutVersion = "1.2".parse().unwrap();
        let v2_0: RolloutVersion = "2.0".parse().unwrap();
        assert!(v1_0 < v1_2);
        assert!(v1_2 < v2_0);
        assert_eq!(v2_0.to_string(), "2.0");
    }

    #[test]
    fn test_rollout_version_parse_rejects_garbage() {
        assert!("".parse::<RolloutVersion>().is_err());
        assert!("1".parse::<RolloutVersion>().is_err());
        assert!("a.b".parse::<RolloutVersion>().is_err());
    }

    #[test]
    fn test_version_instance_distinguishes_reactivation() {
        let version = ServicePackageVersion {
            application_version: ApplicationVersion(RolloutVersion::new(1, 0)),
            rollout_version: RolloutVersion::new(1, 0),
        };
        let first = ServicePackageVersionInstance::new(version, 1);
        let second = ServicePackageVersionInstance::new(version, 2);
        assert_ne!(first, second);
        assert_eq!(first.version, second.version);
    }
}
