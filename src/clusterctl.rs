//! Provider installation, upgrade, and object move collaborator
//!
//! Wraps the cluster-api provider tooling: installing providers onto a
//! cluster, applying a batched provider upgrade, and moving all cluster-api
//! objects between two clusters (the pivot). Orchestrators depend on the
//! trait; the real implementation shells out to clusterctl.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::task::spawn_blocking;
use tokio::time::timeout;
use tracing::info;

use crate::{Error, Result};

/// Default timeout for a single clusterctl invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Batched provider upgrade request
///
/// The core provider is singular; the other categories are lists. Entries
/// are formatted `namespace/name:version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePlan {
    /// Core provider target, at most one
    pub core: Option<String>,
    /// Bootstrap provider targets
    pub bootstrap: Vec<String>,
    /// Control-plane provider targets
    pub control_plane: Vec<String>,
    /// Infrastructure provider targets
    pub infrastructure: Vec<String>,
}

impl UpgradePlan {
    /// True when no provider is eligible for upgrade
    pub fn is_empty(&self) -> bool {
        self.core.is_none()
            && self.bootstrap.is_empty()
            && self.control_plane.is_empty()
            && self.infrastructure.is_empty()
    }
}

/// clusterctl operations the orchestrators drive
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderInstaller: Send + Sync {
    /// Install the core, bootstrap, control-plane, and named infrastructure
    /// providers onto the cluster behind `kubeconfig`
    async fn init(&self, kubeconfig: &Path, infrastructure: &str) -> Result<()>;

    /// Submit one batched provider upgrade
    async fn apply_upgrade(&self, kubeconfig: &Path, plan: &UpgradePlan) -> Result<()>;

    /// Move all cluster-api objects, across all namespaces unless one is
    /// given, from one cluster to another
    async fn move_objects<'a>(
        &self,
        from_kubeconfig: &Path,
        to_kubeconfig: &Path,
        namespace: Option<&'a str>,
    ) -> Result<()>;
}

/// Count the resources clusterctl reports moving in its output
///
/// Output lines look like `Moving Cluster API objects Clusters=1`.
pub(crate) fn extract_resource_count(output: &str) -> u32 {
    output
        .lines()
        .filter_map(|line| {
            let (_, count) = line.split_once("Clusters=")?;
            count.trim().parse::<u32>().ok()
        })
        .sum()
}

/// Real implementation backed by the clusterctl binary
pub struct ClusterctlRunner {
    config_path: Option<PathBuf>,
    command_timeout: Duration,
}

impl ClusterctlRunner {
    /// Create a runner using clusterctl's default configuration discovery
    pub fn new() -> Self {
        Self {
            config_path: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// Point clusterctl at an explicit provider configuration file
    pub fn with_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Override the per-command timeout
    pub fn with_command_timeout(mut self, command_timeout: Duration) -> Self {
        self.command_timeout = command_timeout;
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let config_path = self.config_path.clone();
        let rendered = args.join(" ");

        let task = spawn_blocking(move || {
            let mut command = Command::new("clusterctl");
            command.args(&args);
            if let Some(config) = &config_path {
                command.arg("--config").arg(config);
            }
            command.env("CLUSTERCTL_DISABLE_VERSIONCHECK", "true");
            command.output()
        });

        let output = timeout(self.command_timeout, task)
            .await
            .map_err(|_| {
                Error::timeout(
                    format!("clusterctl {}", rendered),
                    self.command_timeout,
                    "command did not finish",
                )
            })?
            .map_err(|e| Error::provider(format!("clusterctl task failed: {}", e)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            return Err(Error::provider(format!(
                "clusterctl {} failed: {} {}",
                rendered, stdout, stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for ClusterctlRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderInstaller for ClusterctlRunner {
    async fn init(&self, kubeconfig: &Path, infrastructure: &str) -> Result<()> {
        info!(infrastructure, "installing providers");
        self.run(vec![
            "init".into(),
            "--kubeconfig".into(),
            kubeconfig.display().to_string(),
            "--infrastructure".into(),
            infrastructure.into(),
        ])
        .await?;
        info!(infrastructure, "providers installed");
        Ok(())
    }

    async fn apply_upgrade(&self, kubeconfig: &Path, plan: &UpgradePlan) -> Result<()> {
        let mut args = vec![
            "upgrade".to_string(),
            "apply".to_string(),
            "--kubeconfig".to_string(),
            kubeconfig.display().to_string(),
        ];
        if let Some(core) = &plan.core {
            args.extend(["--core".to_string(), core.clone()]);
        }
        if !plan.bootstrap.is_empty() {
            args.extend(["--bootstrap".to_string(), plan.bootstrap.join(",")]);
        }
        if !plan.control_plane.is_empty() {
            args.extend(["--control-plane".to_string(), plan.control_plane.join(",")]);
        }
        if !plan.infrastructure.is_empty() {
            args.extend(["--infrastructure".to_string(), plan.infrastructure.join(",")]);
        }
        self.run(args).await?;
        Ok(())
    }

    async fn move_objects<'a>(
        &self,
        from_kubeconfig: &Path,
        to_kubeconfig: &Path,
        namespace: Option<&'a str>,
    ) -> Result<()> {
        let mut args = vec![
            "move".to_string(),
            "--kubeconfig".to_string(),
            from_kubeconfig.display().to_string(),
            "--to-kubeconfig".to_string(),
            to_kubeconfig.display().to_string(),
        ];
        if let Some(namespace) = namespace {
            args.extend(["--namespace".to_string(), namespace.to_string()]);
        }
        let output = self
            .run(args)
            .await
            .map_err(|e| Error::pivot(format!("object move failed: {}", e)))?;

        let moved = extract_resource_count(&output);
        info!(clusters = moved, "cluster-api objects moved");
        Ok(())
    }
}
