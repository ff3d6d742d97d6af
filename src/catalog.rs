//! Version catalog (BOM) collaborator
//!
//! A catalog entry describes the compatible component versions for one
//! release train: the default Kubernetes version, the target version for
//! each provider keyed by its manifest name, and auxiliary images such as
//! the cluster autoscaler per Kubernetes minor series.

use std::collections::BTreeMap;
use std::path::PathBuf;

#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One release train's bill of materials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BomConfiguration {
    /// Release train version, e.g. `v2.4.1`
    pub release_version: String,
    /// Default Kubernetes version for this release
    pub kubernetes_version: String,
    /// Target provider versions keyed by provider manifest name,
    /// e.g. `cluster-api` or `infrastructure-aws`
    #[serde(default)]
    pub providers: BTreeMap<String, String>,
    /// Cluster autoscaler image keyed by Kubernetes minor series (`v1.28`)
    #[serde(default)]
    pub autoscaler_images: BTreeMap<String, String>,
    /// Machine/node OS image identifier keyed by Kubernetes version
    /// (`v1.28.4`); consulted before any upgrade patch is issued
    #[serde(default)]
    pub machine_images: BTreeMap<String, String>,
    /// Registry all component images are pulled from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_repository: Option<String>,
}

impl BomConfiguration {
    /// Autoscaler image compatible with the given Kubernetes minor series
    pub fn autoscaler_image_for(&self, minor_series: &str) -> Option<&str> {
        self.autoscaler_images.get(minor_series).map(String::as_str)
    }

    /// Machine image for the given canonical Kubernetes version
    pub fn machine_image_for(&self, version: &str) -> Option<&str> {
        self.machine_images.get(version).map(String::as_str)
    }
}

/// Access to release catalogs
#[cfg_attr(test, automock)]
pub trait VersionCatalog: Send + Sync {
    /// The default catalog for the release train this build ships with
    fn default_bom(&self) -> Result<BomConfiguration>;

    /// The catalog for a specific release version
    fn bom_for_release(&self, version: &str) -> Result<BomConfiguration>;
}

/// Catalog backed by a directory of YAML files, one per release version
pub struct FileCatalog {
    dir: PathBuf,
    default_release: String,
}

impl FileCatalog {
    /// Create a catalog over `dir` whose default release is `default_release`
    pub fn new(dir: impl Into<PathBuf>, default_release: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            default_release: default_release.into(),
        }
    }
}

impl VersionCatalog for FileCatalog {
    fn default_bom(&self) -> Result<BomConfiguration> {
        self.bom_for_release(&self.default_release)
    }

    fn bom_for_release(&self, version: &str) -> Result<BomConfiguration> {
        let path = self.dir.join(format!("{}.yaml", version));
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            Error::config(format!(
                "unable to read catalog for release {}: {}",
                version, e
            ))
        })?;
        Ok(serde_yaml::from_str(&raw)?)
    }
}
