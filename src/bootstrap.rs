//! Bootstrap-pivot orchestrator
//!
//! Bringing up a management cluster is a linear state machine that talks to
//! two clusters at once. An ephemeral bootstrap cluster receives the
//! providers and the target cluster's manifest; once the target's own
//! control plane answers, providers are installed there too and every
//! cluster-api object is moved over (the pivot). Each phase is gated on the
//! previous one succeeding.
//!
//! Flow:
//!
//! ```text
//! configure prerequisite
//!   → validate configuration (worker distribution)
//!   → generate cluster configuration
//!   → setup bootstrap cluster (create or adopt)
//!   → install providers on bootstrap cluster (fan-out wait)
//!   → create management cluster (apply manifest, wait control plane,
//!     merge kubeconfigs)
//!   → install providers on management cluster (fan-out wait)
//!   → install addons on management cluster (gated components, then packages)
//!   → move cluster-api objects (relaxed readiness wait, then pivot)
//! ```
//!
//! Failure semantics: a finalizer runs on every exit path with a snapshot of
//! what happened. The target's record is persisted (`Failed` unless the
//! pivot succeeded), the bootstrap cluster is preserved for diagnosis when
//! the target's creation started but never finished, torn down otherwise.
//! The bootstrap kubeconfig file is removed unless the cluster was preserved
//! for diagnosis, in which case it stays so the operator can reach it.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::task::spawn_blocking;
use tracing::{info, warn};

use crate::client::{ClusterClient, InstalledProvider};
use crate::clusterctl::ProviderInstaller;
use crate::config::{self, keys, ConfigStore};
use crate::distribution::{self, DistributionRequest, DomainOverrides, Plan};
use crate::kubeconfig;
use crate::progress::{ProgressSink, StepSequence, StepStatus};
use crate::provider::ProviderSpec;
use crate::registry::{ClusterRegistry, ManagementClusterRecord, RecordStatus};
use crate::version::Version;
use crate::wait::{self, TwoPhaseOptions, WaitTask};
use crate::{Error, Result, BOOTSTRAP_KUBECONFIG_NAME};

/// The ordered phases of a management-cluster bring-up
pub const INIT_STEPS: [&str; 9] = [
    "configure prerequisite",
    "validate configuration",
    "generate cluster configuration",
    "setup bootstrap cluster",
    "install providers on bootstrap cluster",
    "create management cluster",
    "install providers on management cluster",
    "install addons on management cluster",
    "move cluster-api objects",
];

/// Addon controller deployments every management cluster runs
pub const ADDON_COMPONENTS: [(&str, &str); 3] = [
    ("kapp-controller", "packaging-system"),
    ("addons-manager", "addons-system"),
    ("release-controller", "addons-system"),
];

/// Namespace managed addon packages are installed in
pub const ADDON_PACKAGE_NAMESPACE: &str = "addons-system";

/// Immutable input for one bring-up
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    /// Target management cluster name
    pub cluster_name: String,
    /// Namespace the cluster object is created in
    pub namespace: String,
    /// Infrastructure provider, with an optional pinned version
    pub provider: ProviderSpec,
    /// Plan flavor
    pub plan: Plan,
    /// Desired Kubernetes version; the catalog default applies when absent
    pub kubernetes_version: Option<String>,
    /// Control-plane replica count
    pub control_plane_count: u32,
    /// Total worker count, distributed across failure domains
    pub worker_count: u32,
    /// Adopt this existing cluster as the bootstrap cluster instead of
    /// creating an ephemeral one
    pub existing_bootstrap_kubeconfig: Option<PathBuf>,
    /// Edition/build identifier stamped onto the cluster after the pivot
    pub edition: String,
}

impl ProvisioningRequest {
    fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty()
            || !self
                .cluster_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(Error::validation(format!(
                "cluster name {:?} must be lowercase alphanumeric with dashes",
                self.cluster_name
            )));
        }
        if self.control_plane_count == 0 {
            return Err(Error::validation("control plane count must be at least 1"));
        }
        if let Some(version) = &self.kubernetes_version {
            version.parse::<Version>()?;
        }
        Ok(())
    }
}

// =============================================================================
// Collaborators
// =============================================================================

/// Creates and destroys ephemeral bootstrap clusters
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BootstrapClusterManager: Send + Sync {
    /// Create a bootstrap cluster and write its kubeconfig to `kubeconfig`
    async fn create(&self, name: &str, kubeconfig: &Path) -> Result<()>;

    /// Tear down a bootstrap cluster created by [`Self::create`]
    async fn delete(&self, name: &str, kubeconfig: &Path) -> Result<()>;
}

/// Renders the target cluster's manifest; template internals are external
#[cfg_attr(test, automock)]
pub trait ManifestSource: Send + Sync {
    /// Render the full manifest for the requested cluster
    fn render(&self, request: &ProvisioningRequest) -> Result<String>;
}

/// Builds a [`ClusterClient`] for a kubeconfig on disk
#[cfg_attr(test, automock)]
pub trait ClientFactory: Send + Sync {
    /// Client for the cluster reachable through `kubeconfig`
    fn client_for(&self, kubeconfig: &Path) -> Arc<dyn ClusterClient>;
}

/// Optional product-telemetry registration; always best-effort
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TelemetryClient: Send + Sync {
    /// Register the newly created cluster
    async fn register(&self, cluster_name: &str) -> Result<()>;
}

// =============================================================================
// Finalizer snapshot
// =============================================================================

/// Everything the finalizer needs, captured as plain data
///
/// The state machine records what actually happened here instead of mutating
/// flags a cleanup closure would capture; `finalize` runs exactly once per
/// bring-up, on every exit path.
#[derive(Debug, Default)]
pub struct FinalizeState {
    /// The target's record, once one was computed
    pub record: Option<ManagementClusterRecord>,
    /// Set only after the move step returned
    pub pivot_succeeded: bool,
    /// True when this run created the bootstrap cluster (vs adopting one)
    pub bootstrap_created: bool,
    /// True once the target's manifest was applied to the bootstrap cluster
    pub target_creation_started: bool,
    /// Name of the bootstrap cluster
    pub bootstrap_name: String,
    /// Path of the bootstrap kubeconfig this run owns
    pub bootstrap_kubeconfig: Option<PathBuf>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives the bring-up state machine
pub struct BootstrapOrchestrator {
    bootstrap_manager: Arc<dyn BootstrapClusterManager>,
    installer: Arc<dyn ProviderInstaller>,
    clients: Arc<dyn ClientFactory>,
    manifests: Arc<dyn ManifestSource>,
    store: Arc<dyn ConfigStore>,
    progress: Arc<dyn ProgressSink>,
    registry: ClusterRegistry,
    telemetry: Option<Arc<dyn TelemetryClient>>,
    /// Directory for kubeconfigs this run owns
    work_dir: PathBuf,
    /// The user's default kubeconfig; merged without switching context
    user_kubeconfig: PathBuf,
}

impl BootstrapOrchestrator {
    /// Create an orchestrator over the given collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bootstrap_manager: Arc<dyn BootstrapClusterManager>,
        installer: Arc<dyn ProviderInstaller>,
        clients: Arc<dyn ClientFactory>,
        manifests: Arc<dyn ManifestSource>,
        store: Arc<dyn ConfigStore>,
        progress: Arc<dyn ProgressSink>,
        registry: ClusterRegistry,
        work_dir: PathBuf,
        user_kubeconfig: PathBuf,
    ) -> Self {
        Self {
            bootstrap_manager,
            installer,
            clients,
            manifests,
            store,
            progress,
            registry,
            telemetry: None,
            work_dir,
            user_kubeconfig,
        }
    }

    /// Enable telemetry registration after a successful pivot
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryClient>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    fn bootstrap_kubeconfig_path(&self) -> PathBuf {
        self.work_dir.join(BOOTSTRAP_KUBECONFIG_NAME)
    }

    fn target_kubeconfig_path(&self, cluster: &str) -> PathBuf {
        self.work_dir.join(format!("{}.kubeconfig", cluster))
    }

    /// Bring up a management cluster end to end
    pub async fn provision_management_cluster(&self, request: &ProvisioningRequest) -> Result<()> {
        request.validate()?;
        info!(cluster = %request.cluster_name, provider = %request.provider.kind, "starting management cluster bring-up");

        let mut sequence = StepSequence::new(&INIT_STEPS, self.progress.as_ref());
        let mut state = FinalizeState {
            bootstrap_name: format!("{}-bootstrap", request.cluster_name),
            ..FinalizeState::default()
        };

        let result = self.run_phases(request, &mut sequence, &mut state).await;

        sequence.finish(match result {
            Ok(()) => StepStatus::Successful,
            Err(_) => StepStatus::Failed,
        });
        self.finalize(state).await;
        result
    }

    async fn run_phases(
        &self,
        request: &ProvisioningRequest,
        sequence: &mut StepSequence<'_>,
        state: &mut FinalizeState,
    ) -> Result<()> {
        let cluster = request.cluster_name.as_str();
        let namespace = request.namespace.as_str();

        // configure prerequisite
        sequence.enter();
        request
            .provider
            .kind
            .implementation()
            .configure_and_validate(self.store.as_ref())?;

        // validate configuration
        sequence.enter();
        let counts = distribution::distribute_workers(&DistributionRequest {
            total: request.worker_count,
            plan: request.plan,
            is_management_cluster: true,
            provider: request.provider.kind,
            is_windows_workload: false,
            overrides: self.domain_overrides()?,
        })?;
        distribution::apply_worker_counts(
            self.store.as_ref(),
            request.worker_count,
            counts,
            request.plan,
        );

        // generate cluster configuration
        sequence.enter();
        let manifest = self.manifests.render(request)?;

        // setup bootstrap cluster
        sequence.enter();
        let bootstrap_kubeconfig = self.bootstrap_kubeconfig_path();
        match &request.existing_bootstrap_kubeconfig {
            Some(existing) => {
                // adopt: copy to a path this run owns so cleanup never
                // touches the user's file
                std::fs::copy(existing, &bootstrap_kubeconfig).map_err(|e| {
                    Error::bootstrap(format!(
                        "unable to adopt bootstrap cluster kubeconfig {}: {}",
                        existing.display(),
                        e
                    ))
                })?;
                info!(kubeconfig = %existing.display(), "adopting existing bootstrap cluster");
            }
            None => {
                self.bootstrap_manager
                    .create(&state.bootstrap_name, &bootstrap_kubeconfig)
                    .await?;
                state.bootstrap_created = true;
            }
        }
        state.bootstrap_kubeconfig = Some(bootstrap_kubeconfig.clone());
        let bootstrap_client = self.clients.client_for(&bootstrap_kubeconfig);

        // install providers on bootstrap cluster
        sequence.enter();
        self.installer
            .init(&bootstrap_kubeconfig, &request.provider.installer_identifier())
            .await?;
        let providers = bootstrap_client.installed_providers().await?;
        wait_for_providers(&bootstrap_client, &providers).await?;

        // create management cluster
        sequence.enter();
        let record = ManagementClusterRecord::new(
            cluster,
            format!("{}-admin@{}", cluster, cluster),
            self.user_kubeconfig.display().to_string(),
            RecordStatus::Pending,
        );
        if let Err(err) = self.registry.save_best_effort(record.clone()) {
            warn!(error = %err, "unable to persist pending cluster record");
        }
        state.record = Some(record);

        bootstrap_client.apply(&manifest).await?;
        state.target_creation_started = true;

        bootstrap_client
            .wait_control_plane_available(cluster, namespace)
            .await
            .map_err(|e| {
                Error::bootstrap(format!(
                    "unable to wait for cluster control plane available: {}",
                    e
                ))
            })?;

        let fragment = bootstrap_client.admin_kubeconfig(cluster, namespace).await?;
        let target_kubeconfig = self.target_kubeconfig_path(cluster);
        std::fs::write(&target_kubeconfig, &fragment)?;

        kubeconfig::merge_without_switching_context(&self.user_kubeconfig, &fragment)?;
        let context = kubeconfig::merge_and_switch_context(&target_kubeconfig, &fragment)?;
        if let Some(record) = state.record.as_mut() {
            record.context_name = context;
        }

        // install providers on management cluster
        sequence.enter();
        self.installer
            .init(&target_kubeconfig, &request.provider.installer_identifier())
            .await?;
        let target_client = self.clients.client_for(&target_kubeconfig);
        let providers = target_client.installed_providers().await?;
        wait_for_providers(&target_client, &providers).await?;

        // install addons on management cluster
        sequence.enter();
        wait_for_addon_components(&target_client).await.map_err(|e| {
            Error::bootstrap(format!(
                "addon components never became available on the new cluster: {}",
                e
            ))
        })?;
        wait_for_addon_packages(&target_client).await.map_err(|e| {
            Error::bootstrap(format!("addon packages never reconciled: {}", e))
        })?;

        // move cluster-api objects
        sequence.enter();
        // readiness for the move relaxes replica checks: the pivot gates on
        // topology and status reconciliation, not final scale
        bootstrap_client
            .wait_cluster_ready(cluster, namespace, false)
            .await
            .map_err(|e| {
                Error::bootstrap(format!("cluster is not ready to move objects: {}", e))
            })?;
        self.installer
            .move_objects(&bootstrap_kubeconfig, &target_kubeconfig, None)
            .await?;
        state.pivot_succeeded = true;
        if let Some(record) = state.record.as_mut() {
            record.status = RecordStatus::Success;
        }

        // the move restarts the addon controllers on the new cluster
        wait_for_addon_components(&target_client).await.map_err(|e| {
            Error::bootstrap(format!("addon components unavailable after the move: {}", e))
        })?;

        // post-pivot patches and best-effort telemetry
        target_client
            .annotate_cluster(cluster, namespace, crate::RELEASE_ANNOTATION, &request.edition)
            .await?;
        if let Some(telemetry) = &self.telemetry {
            if let Err(err) = telemetry.register(cluster).await {
                warn!(error = %err, "telemetry registration failed; continuing");
            }
        }

        info!(cluster = %cluster, "management cluster bring-up complete");
        Ok(())
    }

    fn domain_overrides(&self) -> Result<DomainOverrides> {
        let mut overrides = DomainOverrides::default();
        for (i, key) in [
            keys::WORKER_MACHINE_COUNT_0,
            keys::WORKER_MACHINE_COUNT_1,
            keys::WORKER_MACHINE_COUNT_2,
        ]
        .iter()
        .enumerate()
        {
            if let Some(raw) = config::get_optional(self.store.as_ref(), key) {
                let value = raw.parse().map_err(|_| {
                    Error::validation(format!("{} must be a non-negative integer, got {:?}", key, raw))
                })?;
                overrides.counts[i] = Some(value);
            }
        }
        Ok(overrides)
    }

    /// Run the exit-path cleanup from a snapshot of what happened
    async fn finalize(&self, state: FinalizeState) {
        if let Some(mut record) = state.record {
            if !state.pivot_succeeded {
                record.status = RecordStatus::Failed;
            }
            let cluster = record.cluster_name.clone();
            let context = record.context_name.clone();
            let succeeded = record.status == RecordStatus::Success;
            if let Err(err) = self.registry.save_best_effort(record) {
                warn!(error = %err, "unable to persist cluster record");
            } else if succeeded {
                if let Err(err) = self.registry.set_current(&cluster, &context) {
                    warn!(error = %err, "unable to mark new cluster as current");
                }
            }
        }

        let preserved_for_diagnosis = state.target_creation_started && !state.pivot_succeeded;
        if preserved_for_diagnosis {
            // leave the bootstrap cluster running, and its kubeconfig on
            // disk so the hint below stays actionable
            if let Some(path) = &state.bootstrap_kubeconfig {
                warn!(
                    bootstrap = %state.bootstrap_name,
                    "bring-up failed after cluster creation started; the bootstrap cluster is left running"
                );
                warn!(
                    "inspect it with: kubectl --kubeconfig {} get clusters,machines -A",
                    path.display()
                );
            }
        } else if state.bootstrap_created {
            if let Some(path) = &state.bootstrap_kubeconfig {
                if let Err(err) = self.bootstrap_manager.delete(&state.bootstrap_name, path).await {
                    warn!(error = %err, "unable to tear down bootstrap cluster");
                }
            }
        }

        if !preserved_for_diagnosis {
            if let Some(path) = &state.bootstrap_kubeconfig {
                if let Err(err) = std::fs::remove_file(path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(error = %err, "unable to remove bootstrap kubeconfig");
                    }
                }
            }
        }
    }
}

/// Wait for every installed provider's controller deployment in parallel
///
/// One wait per provider, all run to completion, first error reported.
pub async fn wait_for_providers(
    client: &Arc<dyn ClusterClient>,
    providers: &[InstalledProvider],
) -> Result<()> {
    let tasks: Vec<WaitTask> = providers
        .iter()
        .map(|provider| {
            let client = Arc::clone(client);
            let deployment = provider.controller_deployment.clone();
            let namespace = provider.namespace.clone();
            WaitTask::new(provider.name.clone(), async move {
                client
                    .wait_deployment_available(&deployment, &namespace)
                    .await
            })
        })
        .collect();
    wait::wait_all_settled(tasks).await
}

/// Wait for the managed addon controller deployments
///
/// Each component gates the ones after it; a single unavailable controller
/// fails the whole wait.
pub async fn wait_for_addon_components(client: &Arc<dyn ClusterClient>) -> Result<()> {
    let gating: Vec<WaitTask> = ADDON_COMPONENTS
        .iter()
        .copied()
        .map(|(name, namespace)| {
            let client = Arc::clone(client);
            WaitTask::new(name, async move {
                client.wait_deployment_available(name, namespace).await
            })
        })
        .collect();
    wait::wait_two_phase(gating, Vec::new(), TwoPhaseOptions::default()).await
}

/// Wait for every managed addon package except the package manager itself,
/// which is covered by the component wait
pub async fn wait_for_addon_packages(client: &Arc<dyn ClusterClient>) -> Result<()> {
    let names = client.list_addon_packages(ADDON_PACKAGE_NAMESPACE).await?;
    let tasks: Vec<WaitTask> = names
        .into_iter()
        .filter(|name| name != "kapp-controller")
        .map(|name| {
            let client = Arc::clone(client);
            WaitTask::new(name.clone(), async move {
                client
                    .wait_package_reconciled(&name, ADDON_PACKAGE_NAMESPACE)
                    .await
            })
        })
        .collect();
    wait::wait_two_phase(Vec::new(), tasks, TwoPhaseOptions::default()).await
}

// =============================================================================
// kind-backed bootstrap manager
// =============================================================================

/// Bootstrap manager that drives local kind clusters
pub struct KindBootstrapManager;

impl KindBootstrapManager {
    async fn run(args: Vec<String>) -> Result<()> {
        let rendered = args.join(" ");
        let output = spawn_blocking(move || Command::new("kind").args(&args).output())
            .await
            .map_err(|e| Error::bootstrap(format!("kind task failed: {}", e)))??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::bootstrap(format!(
                "kind {} failed: {}",
                rendered, stderr
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BootstrapClusterManager for KindBootstrapManager {
    async fn create(&self, name: &str, kubeconfig: &Path) -> Result<()> {
        info!(name, "creating bootstrap cluster");
        Self::run(vec![
            "create".into(),
            "cluster".into(),
            "--name".into(),
            name.into(),
            "--kubeconfig".into(),
            kubeconfig.display().to_string(),
        ])
        .await
    }

    async fn delete(&self, name: &str, kubeconfig: &Path) -> Result<()> {
        info!(name, "tearing down bootstrap cluster");
        Self::run(vec![
            "delete".into(),
            "cluster".into(),
            "--name".into(),
            name.into(),
            "--kubeconfig".into(),
            kubeconfig.display().to_string(),
        ])
        .await
    }
}
