//! Infrastructure provider kinds and per-provider behavior
//!
//! Providers are a closed set selected by a typed enum. Behavior that varies
//! per provider lives behind [`InfrastructureProvider`] so the orchestrators
//! never branch on provider name strings.

use std::fmt;
use std::str::FromStr;

use crate::config::{self, keys, ConfigStore};
use crate::version::Version;
use crate::{Error, Result};

/// The infrastructure back-ends this engine can drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Amazon EC2 fleets
    Aws,
    /// Azure VM scale sets
    Azure,
    /// vSphere virtual machines
    VSphere,
    /// Local container-based clusters; single failure domain
    Docker,
    /// Supervisor-managed clusters on a vSphere supervisor
    Supervisor,
}

impl ProviderKind {
    /// Lowercase name as used in provider specs and clusterctl arguments
    pub fn name(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::VSphere => "vsphere",
            Self::Docker => "docker",
            Self::Supervisor => "supervisor",
        }
    }

    /// True for back-ends with a single failure domain; worker distribution
    /// places everything in domain 0 for these
    pub fn is_single_domain(&self) -> bool {
        matches!(self, Self::Docker)
    }

    /// Per-provider behavior implementation
    pub fn implementation(&self) -> &'static dyn InfrastructureProvider {
        match self {
            Self::Aws => &AwsProvider,
            Self::Azure => &AzureProvider,
            Self::VSphere => &VSphereProvider,
            Self::Docker => &DockerProvider,
            Self::Supervisor => &SupervisorProvider,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "azure" => Ok(Self::Azure),
            "vsphere" => Ok(Self::VSphere),
            "docker" => Ok(Self::Docker),
            "supervisor" => Ok(Self::Supervisor),
            other => Err(Error::provider(format!("unknown provider {:?}", other))),
        }
    }
}

/// A provider reference from a provisioning request: name plus optional
/// pinned version, e.g. `aws:v2.1.0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    /// Which provider
    pub kind: ProviderKind,
    /// Pinned provider version, when the caller requested one
    pub version: Option<Version>,
}

impl ProviderSpec {
    /// The identifier handed to the provider installer: `name`, or
    /// `name:version` when the caller pinned one
    pub fn installer_identifier(&self) -> String {
        match &self.version {
            Some(version) => format!("{}:{}", self.kind.name(), version.canonical()),
            None => self.kind.name().to_string(),
        }
    }
}

impl FromStr for ProviderSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = match s.split_once(':') {
            Some((name, version)) => (name, Some(version.parse()?)),
            None => (s, None),
        };
        Ok(ProviderSpec {
            kind: name.parse()?,
            version,
        })
    }
}

/// Behavior that varies per infrastructure provider
pub trait InfrastructureProvider: Send + Sync {
    /// Which provider this implements
    fn kind(&self) -> ProviderKind;

    /// Validate that the configuration store carries everything this
    /// provider needs before any mutation happens
    fn configure_and_validate(&self, store: &dyn ConfigStore) -> Result<()>;

    /// Identity flavor for credential rotation, when supported
    fn credential_flavor(&self) -> Option<CredentialFlavor> {
        None
    }
}

/// Which identity-material shape a provider rotates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFlavor {
    /// Username/password identity, four secrets per cluster
    VSphere,
    /// Service-principal identity with a shared fleet identity object
    Azure,
}

fn require(store: &dyn ConfigStore, key: &str, provider: ProviderKind) -> Result<()> {
    match config::get_optional(store, key) {
        Some(_) => Ok(()),
        None => Err(Error::validation(format!(
            "{} is required for the {} provider",
            key, provider
        ))),
    }
}

/// AWS behavior
pub struct AwsProvider;

impl InfrastructureProvider for AwsProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn configure_and_validate(&self, store: &dyn ConfigStore) -> Result<()> {
        require(store, keys::AWS_REGION, self.kind())
    }
}

/// Azure behavior
pub struct AzureProvider;

impl InfrastructureProvider for AzureProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn configure_and_validate(&self, store: &dyn ConfigStore) -> Result<()> {
        for key in [
            keys::AZURE_SUBSCRIPTION_ID,
            keys::AZURE_TENANT_ID,
            keys::AZURE_CLIENT_ID,
            keys::AZURE_CLIENT_SECRET,
        ] {
            require(store, key, self.kind())?;
        }
        Ok(())
    }

    fn credential_flavor(&self) -> Option<CredentialFlavor> {
        Some(CredentialFlavor::Azure)
    }
}

/// vSphere behavior
pub struct VSphereProvider;

impl InfrastructureProvider for VSphereProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::VSphere
    }

    fn configure_and_validate(&self, store: &dyn ConfigStore) -> Result<()> {
        for key in [
            keys::VSPHERE_SERVER,
            keys::VSPHERE_USERNAME,
            keys::VSPHERE_PASSWORD,
        ] {
            require(store, key, self.kind())?;
        }
        Ok(())
    }

    fn credential_flavor(&self) -> Option<CredentialFlavor> {
        Some(CredentialFlavor::VSphere)
    }
}

/// Local docker behavior; nothing to validate beyond a reachable daemon,
/// which the bootstrap provisioner checks itself
pub struct DockerProvider;

impl InfrastructureProvider for DockerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    fn configure_and_validate(&self, _store: &dyn ConfigStore) -> Result<()> {
        Ok(())
    }
}

/// Supervisor behavior; configuration comes from the supervisor itself
pub struct SupervisorProvider;

impl InfrastructureProvider for SupervisorProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Supervisor
    }

    fn configure_and_validate(&self, _store: &dyn ConfigStore) -> Result<()> {
        Ok(())
    }
}
