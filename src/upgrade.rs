//! Upgrade orchestrator
//!
//! Two independent upgrade tracks, run in sequence for a management cluster:
//!
//! 1. **Provider upgrade**: diff installed providers against the release
//!    catalog, batch the eligible ones into a single upgrade apply, then
//!    confirm every provider controller is healthy again with a parallel
//!    fan-out wait.
//! 2. **Kubernetes upgrade**, chosen per cluster style. Legacy clusters get
//!    new infrastructure templates and per-resource version patches
//!    (control plane first, workers only after control-plane convergence).
//!    Topology-managed clusters get a single topology version patch and the
//!    same convergence waits.
//!
//! A build-metadata-aware downgrade guard runs before any mutation on both
//! tracks, and management-cluster upgrades run a compatibility pre-flight
//! against the running release and, when present, the fleet-management
//! service's interoperability descriptor.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use crate::bootstrap::{wait_for_addon_components, wait_for_addon_packages, wait_for_providers};
use crate::catalog::{BomConfiguration, VersionCatalog};
use crate::client::{ClusterClient, ControlPlaneInfo, ProviderCategory, TemplateRef};
use crate::clusterctl::{ProviderInstaller, UpgradePlan};
use crate::registry::{ClusterRegistry, RecordStatus};
use crate::version::{compare_versions, Version};
use crate::wait::{self, PollOptions, WaitOutcome};
use crate::{Error, Result, RELEASE_ANNOTATION, TEMPLATE_FINGERPRINT_ANNOTATION};

const CLUSTER_KIND: &str = "clusters.cluster.x-k8s.io";
const CONTROL_PLANE_KIND: &str = "kubeadmcontrolplanes.controlplane.cluster.x-k8s.io";
const MACHINE_DEPLOYMENT_KIND: &str = "machinedeployments.cluster.x-k8s.io";

/// Namespace the fleet-management agent runs in, when registered
const FLEET_NAMESPACE: &str = "fleet-system";

/// Asks the operator to confirm a risky but allowed operation
#[cfg_attr(test, automock)]
pub trait Prompter: Send + Sync {
    /// Return `Ok` when the operator confirmed, an error otherwise
    fn confirm(&self, message: &str) -> Result<()>;
}

/// Prompter for non-interactive callers: every confirmation is declined
#[derive(Debug, Default)]
pub struct NonInteractivePrompter;

impl Prompter for NonInteractivePrompter {
    fn confirm(&self, message: &str) -> Result<()> {
        Err(Error::validation(format!(
            "operator confirmation required: {}",
            message
        )))
    }
}

/// Input for one upgrade run
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Cluster to upgrade
    pub cluster_name: String,
    /// Namespace its cluster object lives in
    pub namespace: String,
    /// Target Kubernetes version; the catalog default applies when absent
    pub target_kubernetes_version: Option<String>,
    /// Target release train; the shipped default applies when absent
    pub target_release: Option<String>,
    /// Proceed past confirmations with a warning instead of prompting
    pub skip_prompt: bool,
}

/// Where a legacy upgrade currently stands; carried in memory only
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpgradePhase {
    Initiated,
    TemplatesCreated,
    ControlPlanePatched,
    ControlPlaneUpgraded,
    WorkersPatched,
    Done,
}

/// Reject any upgrade where the target is older than what runs today
///
/// Equal major.minor.patch falls back to the numeric build metadata. The
/// error names both versions so the operator can see what was compared.
pub fn verify_no_downgrade(current: &str, target: &str) -> Result<()> {
    if compare_versions(current, target)? == Ordering::Greater {
        return Err(Error::upgrade(format!(
            "attempted to upgrade kubernetes from {} to {}: downgrade is not allowed",
            current, target
        )));
    }
    Ok(())
}

fn template_fingerprint(kind: &str, version: &str, machine_image: &str) -> String {
    let mut hasher = DefaultHasher::new();
    (kind, version, machine_image).hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn template_name(cluster: &str, role: &str, target: &Version) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..5).map(|_| rng.gen_range(b'a'..=b'z') as char).collect();
    format!(
        "{}-{}-{}-{}",
        cluster,
        role,
        target.canonical().replace(['.', '+'], "-"),
        suffix
    )
}

/// Drives provider and Kubernetes upgrades on one cluster
pub struct UpgradeOrchestrator {
    client: Arc<dyn ClusterClient>,
    installer: Arc<dyn ProviderInstaller>,
    catalog: Arc<dyn VersionCatalog>,
    prompter: Arc<dyn Prompter>,
    registry: Option<ClusterRegistry>,
    kubeconfig: PathBuf,
    poll: PollOptions,
}

impl UpgradeOrchestrator {
    /// Create an orchestrator for the cluster behind `client`/`kubeconfig`
    pub fn new(
        client: Arc<dyn ClusterClient>,
        installer: Arc<dyn ProviderInstaller>,
        catalog: Arc<dyn VersionCatalog>,
        kubeconfig: PathBuf,
    ) -> Self {
        Self {
            client,
            installer,
            catalog,
            prompter: Arc::new(NonInteractivePrompter),
            registry: None,
            kubeconfig,
            poll: PollOptions::default(),
        }
    }

    /// Use an interactive prompter for compatibility confirmations
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Consult the cluster registry to refuse upgrading half-built clusters
    pub fn with_registry(mut self, registry: ClusterRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the poll bounds used by the convergence waits
    pub fn with_poll_options(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    /// Upgrade a management cluster: pre-flight, providers, then Kubernetes
    pub async fn upgrade_management_cluster(&self, request: &UpgradeRequest) -> Result<()> {
        if let Some(registry) = &self.registry {
            if let Some(record) = registry.get(&request.cluster_name)? {
                if record.status == RecordStatus::Failed {
                    return Err(Error::upgrade(format!(
                        "cluster {} never finished its bring-up; clean it up before upgrading",
                        request.cluster_name
                    )));
                }
            }
        }

        let bom = self.resolve_bom(request)?;
        let current_release = self.cluster_release(request).await?;
        let target_release: Version = bom.release_version.parse()?;
        self.validate_release_compatibility(&current_release, &target_release, request.skip_prompt)?;
        self.validate_fleet_compatibility(&target_release, request.skip_prompt)
            .await?;

        self.upgrade_providers(&bom).await?;
        self.upgrade_kubernetes(request, &bom).await?;

        self.client
            .annotate_cluster(
                &request.cluster_name,
                &request.namespace,
                RELEASE_ANNOTATION,
                &bom.release_version,
            )
            .await?;

        wait_for_addon_components(&self.client).await.map_err(|e| {
            Error::upgrade(format!("addon components unavailable after upgrade: {}", e))
        })?;
        if let Err(err) = wait_for_addon_packages(&self.client).await {
            warn!(error = %err, "addon packages not fully reconciled; continuing");
        }

        info!(cluster = %request.cluster_name, release = %bom.release_version, "management cluster upgrade complete");
        Ok(())
    }

    /// Upgrade a workload cluster's Kubernetes version
    pub async fn upgrade_cluster(&self, request: &UpgradeRequest) -> Result<()> {
        let bom = self.resolve_bom(request)?;
        self.upgrade_kubernetes(request, &bom).await
    }

    fn resolve_bom(&self, request: &UpgradeRequest) -> Result<BomConfiguration> {
        match &request.target_release {
            Some(release) => self.catalog.bom_for_release(release),
            None => self.catalog.default_bom(),
        }
    }

    async fn cluster_release(&self, request: &UpgradeRequest) -> Result<Version> {
        let value = self
            .client
            .get_resource(CLUSTER_KIND, &request.cluster_name, &request.namespace)
            .await?
            .ok_or_else(|| {
                Error::upgrade(format!("cluster {} not found", request.cluster_name))
            })?;
        let pointer = format!(
            "/metadata/annotations/{}",
            RELEASE_ANNOTATION.replace('/', "~1")
        );
        let raw = value
            .pointer(&pointer)
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                Error::upgrade(format!(
                    "unable to determine the release version running on cluster {}",
                    request.cluster_name
                ))
            })?;
        Ok(raw.parse()?)
    }

    fn validate_release_compatibility(
        &self,
        current: &Version,
        target: &Version,
        skip_prompt: bool,
    ) -> Result<()> {
        if target.major != current.major {
            return Err(Error::upgrade(format!(
                "major version mismatch detected: running {}, target {}",
                current, target
            )));
        }
        let minor_gap = target.minor as i64 - current.minor as i64;
        if minor_gap < 0 || (minor_gap == 0 && target.patch < current.patch) {
            return Err(Error::upgrade(format!(
                "release version downgrade is not supported: running {}, target {}",
                current, target
            )));
        }
        if minor_gap > 1 {
            let message = format!(
                "upgrading from {} to {} skips more than one minor version",
                current, target
            );
            if skip_prompt {
                warn!(message = %message, "continuing without confirmation");
            } else {
                self.prompter.confirm(&message)?;
            }
        }
        Ok(())
    }

    async fn validate_fleet_compatibility(&self, target: &Version, skip_prompt: bool) -> Result<()> {
        if self
            .client
            .deployment_replicas("fleet-agent", FLEET_NAMESPACE)
            .await?
            .is_none()
        {
            return Ok(());
        }

        let data = match self
            .client
            .config_map_data("interop", FLEET_NAMESPACE)
            .await?
        {
            Some(data) => data,
            None => {
                return self.confirm_unknown_fleet(
                    "interoperability descriptor not found",
                    skip_prompt,
                )
            }
        };

        if data.get("interop-schema-version").map(String::as_str) != Some("v1.0") {
            return self.confirm_unknown_fleet("unrecognized interoperability schema", skip_prompt);
        }

        let supported = data.get("supported-versions").cloned().unwrap_or_default();
        if supported
            .split(',')
            .map(str::trim)
            .any(|v| v == target.canonical())
        {
            Ok(())
        } else {
            Err(Error::upgrade(format!(
                "the fleet-management service does not support release {}",
                target.canonical()
            )))
        }
    }

    fn confirm_unknown_fleet(&self, reason: &str, skip_prompt: bool) -> Result<()> {
        if skip_prompt {
            warn!(reason, "fleet compatibility unknown; continuing");
            Ok(())
        } else {
            self.prompter.confirm(&format!(
                "fleet compatibility is unknown ({}); continue anyway?",
                reason
            ))
        }
    }

    // =========================================================================
    // Provider upgrade
    // =========================================================================

    async fn upgrade_providers(&self, bom: &BomConfiguration) -> Result<()> {
        let providers = self.client.installed_providers().await?;
        let mut plan = UpgradePlan::default();

        for provider in &providers {
            let Some(catalog_version) = bom.providers.get(&provider.name) else {
                info!(provider = %provider.name, "no catalog entry; skipping provider");
                continue;
            };
            let target: Version = match catalog_version.parse() {
                Ok(version) => version,
                Err(err) => {
                    warn!(provider = %provider.name, version = %catalog_version, error = %err,
                        "unparsable catalog version; skipping provider");
                    continue;
                }
            };
            let current: Version = provider.version.parse()?;
            if target < current {
                info!(provider = %provider.name, installed = %current, catalog = %target,
                    "catalog version is older than installed; skipping provider");
                continue;
            }

            let entry = format!("{}/{}:{}", provider.namespace, provider.name, target.canonical());
            match provider.category {
                ProviderCategory::Core => {
                    if plan.core.is_some() {
                        return Err(Error::upgrade(
                            "more than one core provider is installed",
                        ));
                    }
                    plan.core = Some(entry);
                }
                ProviderCategory::Bootstrap => plan.bootstrap.push(entry),
                ProviderCategory::ControlPlane => plan.control_plane.push(entry),
                ProviderCategory::Infrastructure => plan.infrastructure.push(entry),
            }
        }

        if plan.is_empty() {
            info!("all providers are already at their catalog versions");
            return Ok(());
        }

        self.installer.apply_upgrade(&self.kubeconfig, &plan).await?;

        let providers = self.client.installed_providers().await?;
        wait_for_providers(&self.client, &providers).await
    }

    // =========================================================================
    // Kubernetes upgrade
    // =========================================================================

    async fn upgrade_kubernetes(
        &self,
        request: &UpgradeRequest,
        bom: &BomConfiguration,
    ) -> Result<()> {
        let cluster = request.cluster_name.as_str();
        let namespace = request.namespace.as_str();

        let control_plane = self.client.control_plane(cluster, namespace).await?;
        let target_raw = request
            .target_kubernetes_version
            .clone()
            .unwrap_or_else(|| bom.kubernetes_version.clone());
        let target: Version = target_raw.parse()?;

        verify_no_downgrade(&control_plane.version, &target_raw)?;

        if self.client.is_topology_managed(cluster, namespace).await? {
            self.topology_upgrade(cluster, namespace, bom, &target, &target_raw)
                .await
        } else {
            self.legacy_upgrade(cluster, namespace, bom, &control_plane, &target, &target_raw)
                .await
        }
    }

    async fn topology_upgrade(
        &self,
        cluster: &str,
        namespace: &str,
        bom: &BomConfiguration,
        target: &Version,
        target_raw: &str,
    ) -> Result<()> {
        info!(cluster, version = target_raw, "upgrading topology-managed cluster");
        self.client
            .patch_resource(
                CLUSTER_KIND,
                cluster,
                namespace,
                json!({"spec": {"topology": {"version": target_raw}}}),
            )
            .await?;

        self.wait_machines_upgraded(cluster, namespace, true, target_raw)
            .await?;
        self.wait_machines_upgraded(cluster, namespace, false, target_raw)
            .await?;
        self.patch_autoscaler(cluster, namespace, bom, target).await
    }

    async fn legacy_upgrade(
        &self,
        cluster: &str,
        namespace: &str,
        bom: &BomConfiguration,
        control_plane: &ControlPlaneInfo,
        target: &Version,
        target_raw: &str,
    ) -> Result<()> {
        let mut phase = UpgradePhase::Initiated;
        info!(cluster, version = target_raw, ?phase, "upgrading legacy cluster");

        let machine_deployments = self.client.machine_deployments(cluster, namespace).await?;

        // anything unresolvable aborts here, before any patch is issued
        let machine_image = bom.machine_image_for(&target.canonical()).ok_or_else(|| {
            Error::upgrade(format!(
                "no machine image available for kubernetes {}",
                target.canonical()
            ))
        })?;

        let cp_template = self
            .ensure_infrastructure_template(
                namespace,
                cluster,
                "control-plane",
                &control_plane.infrastructure_template,
                target,
                machine_image,
            )
            .await?;
        let mut md_templates = Vec::with_capacity(machine_deployments.len());
        for md in &machine_deployments {
            let template = self
                .ensure_infrastructure_template(
                    namespace,
                    cluster,
                    &md.name,
                    &md.infrastructure_template,
                    target,
                    machine_image,
                )
                .await?;
            md_templates.push(template);
        }
        phase = UpgradePhase::TemplatesCreated;
        info!(cluster, ?phase, "infrastructure templates in place");

        if control_plane.version == target_raw
            && control_plane.infrastructure_template.name == cp_template.name
        {
            info!(cluster, "control plane already at target version and template");
        } else {
            self.client
                .patch_resource(
                    CONTROL_PLANE_KIND,
                    &control_plane.name,
                    namespace,
                    json!({"spec": {
                        "version": target_raw,
                        "machineTemplate": {"infrastructureRef": {
                            "kind": cp_template.kind,
                            "name": cp_template.name,
                        }},
                    }}),
                )
                .await?;
        }
        phase = UpgradePhase::ControlPlanePatched;
        info!(cluster, ?phase, "control plane patched");

        self.wait_machines_upgraded(cluster, namespace, true, target_raw)
            .await?;
        phase = UpgradePhase::ControlPlaneUpgraded;
        info!(cluster, ?phase, "control plane machines converged");

        for (md, template) in machine_deployments.iter().zip(&md_templates) {
            self.client
                .patch_resource(
                    MACHINE_DEPLOYMENT_KIND,
                    &md.name,
                    namespace,
                    json!({"spec": {"template": {"spec": {
                        "version": target_raw,
                        "infrastructureRef": {"kind": template.kind, "name": template.name},
                    }}}}),
                )
                .await?;
        }
        phase = UpgradePhase::WorkersPatched;
        info!(cluster, ?phase, "worker node groups patched");

        self.wait_machines_upgraded(cluster, namespace, false, target_raw)
            .await?;
        self.patch_autoscaler(cluster, namespace, bom, target).await?;

        phase = UpgradePhase::Done;
        info!(cluster, ?phase, "kubernetes upgrade complete");
        Ok(())
    }

    /// Reuse an equivalent existing template or clone the current one
    ///
    /// Equivalence is detected through a content-derived fingerprint
    /// annotation covering the template kind, target version, and machine
    /// image.
    async fn ensure_infrastructure_template(
        &self,
        namespace: &str,
        cluster: &str,
        role: &str,
        current: &TemplateRef,
        target: &Version,
        machine_image: &str,
    ) -> Result<TemplateRef> {
        let fingerprint = template_fingerprint(&current.kind, &target.canonical(), machine_image);
        if let Some(existing) = self
            .client
            .find_template_by_fingerprint(&current.kind, namespace, &fingerprint)
            .await?
        {
            info!(template = %existing, "reusing existing infrastructure template");
            return Ok(TemplateRef {
                kind: current.kind.clone(),
                name: existing,
            });
        }

        let mut body = self
            .client
            .get_resource(&current.kind, &current.name, namespace)
            .await?
            .ok_or_else(|| {
                Error::upgrade(format!(
                    "infrastructure template {}/{} not found",
                    namespace, current.name
                ))
            })?;

        let name = template_name(cluster, role, target);
        body["metadata"] = json!({
            "name": name,
            "namespace": namespace,
            "annotations": {
                TEMPLATE_FINGERPRINT_ANNOTATION: fingerprint,
                "regatta.io/machine-image": machine_image,
            },
        });
        if let Some(object) = body.as_object_mut() {
            object.remove("status");
        }
        self.client
            .create_resource(&current.kind, namespace, body)
            .await?;
        info!(template = %name, "created infrastructure template");
        Ok(TemplateRef {
            kind: current.kind.clone(),
            name,
        })
    }

    async fn wait_machines_upgraded(
        &self,
        cluster: &str,
        namespace: &str,
        control_plane: bool,
        target_raw: &str,
    ) -> Result<()> {
        let role = if control_plane { "control plane" } else { "worker" };
        let operation = format!("{} machines of cluster {} at {}", role, cluster, target_raw);
        wait::wait_until(self.poll, &operation, || async move {
            let machines = self.client.machines(cluster, namespace).await?;
            let mut pending: Vec<String> = machines
                .iter()
                .filter(|m| m.is_control_plane == control_plane)
                .filter(|m| m.version.as_deref() != Some(target_raw) || !m.running)
                .map(|m| m.name.clone())
                .collect();
            if pending.is_empty() {
                Ok(WaitOutcome::Ready)
            } else {
                pending.sort();
                Ok(WaitOutcome::NotReady(format!(
                    "machines not yet upgraded: {}",
                    pending.join(", ")
                )))
            }
        })
        .await
    }

    /// Point the cluster autoscaler at the image for the target minor
    ///
    /// An absent deployment is a skip; a present deployment with no
    /// compatible image in the catalog is a hard failure.
    async fn patch_autoscaler(
        &self,
        cluster: &str,
        namespace: &str,
        bom: &BomConfiguration,
        target: &Version,
    ) -> Result<()> {
        let name = format!("{}-cluster-autoscaler", cluster);
        if self
            .client
            .deployment_replicas(&name, namespace)
            .await?
            .is_none()
        {
            info!(deployment = %name, "no autoscaler deployment; skipping image update");
            return Ok(());
        }

        let image = bom
            .autoscaler_image_for(&target.minor_series())
            .ok_or_else(|| {
                Error::upgrade(format!(
                    "no autoscaler image available for kubernetes {}",
                    target.minor_series()
                ))
            })?;
        self.client
            .set_deployment_image(&name, namespace, "cluster-autoscaler", image)
            .await?;
        if let Err(err) = self.client.wait_deployment_available(&name, namespace).await {
            warn!(error = %err, "autoscaler not ready after image update; continuing");
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MockVersionCatalog;
    use crate::client::{InstalledProvider, MachineInfo, MockClusterClient};
    use crate::clusterctl::MockProviderInstaller;
    use mockall::Sequence;
    use std::time::Duration;

    fn bom() -> BomConfiguration {
        BomConfiguration {
            release_version: "v2.5.0".into(),
            kubernetes_version: "v1.28.4".into(),
            providers: [
                ("cluster-api".to_string(), "v1.6.1".to_string()),
                ("bootstrap-kubeadm".to_string(), "v1.4.0".to_string()),
            ]
            .into(),
            autoscaler_images: [(
                "v1.28".to_string(),
                "registry.example.com/autoscaler:v1.28.0".to_string(),
            )]
            .into(),
            machine_images: [("v1.28.4".to_string(), "ami-0123456789".to_string())].into(),
            image_repository: None,
        }
    }

    fn request() -> UpgradeRequest {
        UpgradeRequest {
            cluster_name: "mgmt-a".into(),
            namespace: "default".into(),
            target_kubernetes_version: None,
            target_release: None,
            skip_prompt: false,
        }
    }

    fn fast_poll() -> PollOptions {
        PollOptions::default()
            .with_interval(Duration::from_millis(5))
            .with_timeout(Duration::from_millis(50))
    }

    fn provider(
        name: &str,
        namespace: &str,
        version: &str,
        category: ProviderCategory,
    ) -> InstalledProvider {
        InstalledProvider {
            name: name.into(),
            namespace: namespace.into(),
            version: version.into(),
            category,
            controller_deployment: format!("{}-controller-manager", name),
        }
    }

    fn machine(name: &str, version: &str, control_plane: bool) -> MachineInfo {
        MachineInfo {
            name: name.into(),
            version: Some(version.into()),
            is_control_plane: control_plane,
            running: true,
        }
    }

    fn orchestrator(client: MockClusterClient, installer: MockProviderInstaller) -> UpgradeOrchestrator {
        let mut catalog = MockVersionCatalog::new();
        catalog.expect_default_bom().returning(|| Ok(bom()));
        UpgradeOrchestrator::new(
            Arc::new(client),
            Arc::new(installer),
            Arc::new(catalog),
            PathBuf::from("/tmp/mgmt-a.kubeconfig"),
        )
        .with_poll_options(fast_poll())
    }

    // ==========================================================================
    // Story: Downgrade Guard
    //
    // Any target older than the running version aborts before any patch,
    // and the error names both versions.
    // ==========================================================================

    #[test]
    fn downgrades_are_rejected_naming_both_versions() {
        let err = verify_no_downgrade("v1.28.4", "v1.27.0").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("v1.28.4"));
        assert!(text.contains("v1.27.0"));
        assert!(text.contains("downgrade is not allowed"));

        // equal triples fall back to build metadata
        assert!(verify_no_downgrade("v1.28.4+vmware.2", "v1.28.4+vmware.1").is_err());
        assert!(verify_no_downgrade("v1.28.4", "v1.28.4").is_ok());
        assert!(verify_no_downgrade("v1.28.4", "v1.29.0").is_ok());
    }

    #[tokio::test]
    async fn when_target_is_older_no_patch_is_ever_issued() {
        let mut client = MockClusterClient::new();
        client.expect_control_plane().returning(|_, _| {
            Ok(ControlPlaneInfo {
                name: "mgmt-a-control-plane".into(),
                namespace: "default".into(),
                version: "v1.28.4".into(),
                replicas: 3,
                ready_replicas: 3,
                infrastructure_template: TemplateRef {
                    kind: "AWSMachineTemplate".into(),
                    name: "mgmt-a-cp".into(),
                },
            })
        });
        client.expect_patch_resource().never();
        client.expect_create_resource().never();

        let mut request = request();
        request.target_kubernetes_version = Some("v1.27.0".into());

        let err = orchestrator(client, MockProviderInstaller::new())
            .upgrade_cluster(&request)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("downgrade is not allowed"));
    }

    // ==========================================================================
    // Story: Provider Eligibility and Batching
    //
    // No catalog entry, an unparsable entry, or a catalog version older
    // than installed all skip the provider; the rest go out in one batch.
    // ==========================================================================

    #[tokio::test]
    async fn only_eligible_providers_are_batched_into_the_upgrade() {
        let mut client = MockClusterClient::new();
        client.expect_installed_providers().times(2).returning(|| {
            Ok(vec![
                provider("cluster-api", "capi-system", "v1.5.3", ProviderCategory::Core),
                provider(
                    "bootstrap-kubeadm",
                    "capi-kubeadm-bootstrap-system",
                    "v1.5.3",
                    ProviderCategory::Bootstrap,
                ),
                provider(
                    "infrastructure-aws",
                    "capa-system",
                    "v2.2.0",
                    ProviderCategory::Infrastructure,
                ),
            ])
        });
        client
            .expect_wait_deployment_available()
            .times(3)
            .returning(|_, _| Ok(()));

        let mut installer = MockProviderInstaller::new();
        installer
            .expect_apply_upgrade()
            .withf(|_, plan| {
                // catalog: cluster-api newer, bootstrap-kubeadm older than
                // installed, infrastructure-aws absent
                plan.core.as_deref() == Some("capi-system/cluster-api:v1.6.1")
                    && plan.bootstrap.is_empty()
                    && plan.control_plane.is_empty()
                    && plan.infrastructure.is_empty()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        orchestrator(client, installer)
            .upgrade_providers(&bom())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn when_no_provider_is_eligible_nothing_is_submitted() {
        let mut client = MockClusterClient::new();
        client.expect_installed_providers().times(1).returning(|| {
            Ok(vec![provider(
                "infrastructure-aws",
                "capa-system",
                "v2.2.0",
                ProviderCategory::Infrastructure,
            )])
        });

        let mut installer = MockProviderInstaller::new();
        installer.expect_apply_upgrade().never();

        orchestrator(client, installer)
            .upgrade_providers(&bom())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn two_core_providers_are_an_error() {
        let mut client = MockClusterClient::new();
        client.expect_installed_providers().returning(|| {
            Ok(vec![
                provider("cluster-api", "capi-system", "v1.5.3", ProviderCategory::Core),
                provider("cluster-api", "capi-legacy", "v1.4.0", ProviderCategory::Core),
            ])
        });

        let err = orchestrator(client, MockProviderInstaller::new())
            .upgrade_providers(&bom())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("core provider"));
    }

    // ==========================================================================
    // Story: Release Compatibility Pre-Flight
    // ==========================================================================

    #[test]
    fn major_mismatch_and_minor_downgrade_are_fatal() {
        let orchestrator = orchestrator(MockClusterClient::new(), MockProviderInstaller::new());

        let err = orchestrator
            .validate_release_compatibility(
                &"v1.9.0".parse().unwrap(),
                &"v2.0.0".parse().unwrap(),
                false,
            )
            .unwrap_err();
        assert!(err.to_string().contains("major version mismatch"));

        let err = orchestrator
            .validate_release_compatibility(
                &"v2.5.0".parse().unwrap(),
                &"v2.4.0".parse().unwrap(),
                false,
            )
            .unwrap_err();
        assert!(err.to_string().contains("downgrade is not supported"));
    }

    #[test]
    fn skipping_more_than_one_minor_requires_confirmation() {
        let mut prompter = MockPrompter::new();
        prompter
            .expect_confirm()
            .withf(|message| message.contains("skips more than one minor version"))
            .times(1)
            .returning(|_| Ok(()));

        let orchestrator = orchestrator(MockClusterClient::new(), MockProviderInstaller::new())
            .with_prompter(Arc::new(prompter));
        orchestrator
            .validate_release_compatibility(
                &"v2.2.0".parse().unwrap(),
                &"v2.4.0".parse().unwrap(),
                false,
            )
            .unwrap();

        // suppressed confirmation proceeds with a warning instead
        let orchestrator = orchestrator.with_prompter(Arc::new(NonInteractivePrompter));
        orchestrator
            .validate_release_compatibility(
                &"v2.2.0".parse().unwrap(),
                &"v2.4.0".parse().unwrap(),
                true,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn fleet_descriptor_gates_the_upgrade_when_the_agent_is_registered() {
        // supported version listed: allowed
        let mut client = MockClusterClient::new();
        client
            .expect_deployment_replicas()
            .returning(|_, _| Ok(Some(1)));
        client.expect_config_map_data().returning(|_, _| {
            Ok(Some(
                [
                    ("interop-schema-version".to_string(), "v1.0".to_string()),
                    ("supported-versions".to_string(), "v2.4.0, v2.5.0".to_string()),
                ]
                .into(),
            ))
        });
        orchestrator(client, MockProviderInstaller::new())
            .validate_fleet_compatibility(&"v2.5.0".parse().unwrap(), false)
            .await
            .unwrap();

        // unsupported version: hard failure
        let mut client = MockClusterClient::new();
        client
            .expect_deployment_replicas()
            .returning(|_, _| Ok(Some(1)));
        client.expect_config_map_data().returning(|_, _| {
            Ok(Some(
                [
                    ("interop-schema-version".to_string(), "v1.0".to_string()),
                    ("supported-versions".to_string(), "v2.4.0".to_string()),
                ]
                .into(),
            ))
        });
        let err = orchestrator(client, MockProviderInstaller::new())
            .validate_fleet_compatibility(&"v2.5.0".parse().unwrap(), false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not support"));

        // missing descriptor: unknown compatibility, needs confirmation
        let mut client = MockClusterClient::new();
        client
            .expect_deployment_replicas()
            .returning(|_, _| Ok(Some(1)));
        client.expect_config_map_data().returning(|_, _| Ok(None));
        let mut prompter = MockPrompter::new();
        prompter.expect_confirm().times(1).returning(|_| Ok(()));
        orchestrator(client, MockProviderInstaller::new())
            .with_prompter(Arc::new(prompter))
            .validate_fleet_compatibility(&"v2.5.0".parse().unwrap(), false)
            .await
            .unwrap();

        // no agent: nothing to check
        let mut client = MockClusterClient::new();
        client.expect_deployment_replicas().returning(|_, _| Ok(None));
        client.expect_config_map_data().never();
        orchestrator(client, MockProviderInstaller::new())
            .validate_fleet_compatibility(&"v2.5.0".parse().unwrap(), false)
            .await
            .unwrap();
    }

    // ==========================================================================
    // Story: Topology-Managed Upgrade
    // ==========================================================================

    #[tokio::test]
    async fn topology_upgrade_is_a_single_version_patch_plus_convergence_waits() {
        let mut client = MockClusterClient::new();
        client.expect_control_plane().returning(|_, _| {
            Ok(ControlPlaneInfo {
                name: "mgmt-a-control-plane".into(),
                namespace: "default".into(),
                version: "v1.27.5".into(),
                replicas: 1,
                ready_replicas: 1,
                infrastructure_template: TemplateRef {
                    kind: "DockerMachineTemplate".into(),
                    name: "mgmt-a-cp".into(),
                },
            })
        });
        client.expect_is_topology_managed().returning(|_, _| Ok(true));
        client
            .expect_patch_resource()
            .withf(|kind, _, _, patch| {
                kind == CLUSTER_KIND
                    && patch.pointer("/spec/topology/version").and_then(|v| v.as_str())
                        == Some("v1.28.4")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        client.expect_machines().returning(|_, _| {
            Ok(vec![
                machine("cp-0", "v1.28.4", true),
                machine("md-0-a", "v1.28.4", false),
            ])
        });
        // autoscaler absent: skipped
        client.expect_deployment_replicas().returning(|_, _| Ok(None));

        orchestrator(client, MockProviderInstaller::new())
            .upgrade_cluster(&request())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn a_present_autoscaler_with_no_compatible_image_is_a_hard_failure() {
        let mut client = MockClusterClient::new();
        client.expect_control_plane().returning(|_, _| {
            Ok(ControlPlaneInfo {
                name: "mgmt-a-control-plane".into(),
                namespace: "default".into(),
                version: "v1.28.4".into(),
                replicas: 1,
                ready_replicas: 1,
                infrastructure_template: TemplateRef {
                    kind: "DockerMachineTemplate".into(),
                    name: "mgmt-a-cp".into(),
                },
            })
        });
        client.expect_is_topology_managed().returning(|_, _| Ok(true));
        client.expect_patch_resource().returning(|_, _, _, _| Ok(()));
        client
            .expect_machines()
            .returning(|_, _| Ok(vec![machine("cp-0", "v1.29.0", true)]));
        client
            .expect_deployment_replicas()
            .returning(|_, _| Ok(Some(1)));
        client.expect_set_deployment_image().never();

        // v1.29 has no autoscaler image in the catalog
        let mut request = request();
        request.target_kubernetes_version = Some("v1.29.0".into());

        let err = orchestrator(client, MockProviderInstaller::new())
            .upgrade_cluster(&request)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("autoscaler image"));
    }

    // ==========================================================================
    // Story: Legacy Upgrade
    //
    // Templates first, control plane patch, control-plane convergence, only
    // then the worker patches. Equivalent templates are reused.
    // ==========================================================================

    #[tokio::test]
    async fn legacy_upgrade_patches_control_plane_before_workers_and_reuses_templates() {
        let mut seq = Sequence::new();
        let mut client = MockClusterClient::new();
        client.expect_control_plane().returning(|_, _| {
            Ok(ControlPlaneInfo {
                name: "mgmt-a-control-plane".into(),
                namespace: "default".into(),
                version: "v1.27.5".into(),
                replicas: 1,
                ready_replicas: 1,
                infrastructure_template: TemplateRef {
                    kind: "AWSMachineTemplate".into(),
                    name: "mgmt-a-cp-old".into(),
                },
            })
        });
        client.expect_is_topology_managed().returning(|_, _| Ok(false));
        client.expect_machine_deployments().returning(|_, _| {
            Ok(vec![crate::client::MachineDeploymentInfo {
                name: "mgmt-a-md-0".into(),
                namespace: "default".into(),
                version: "v1.27.5".into(),
                replicas: 2,
                ready_replicas: 2,
                infrastructure_template: TemplateRef {
                    kind: "AWSMachineTemplate".into(),
                    name: "mgmt-a-md-old".into(),
                },
            }])
        });
        // both templates already exist with the right fingerprint
        client
            .expect_find_template_by_fingerprint()
            .times(2)
            .returning(|_, _, _| Ok(Some("mgmt-a-shared-template".into())));
        client.expect_create_resource().never();

        client
            .expect_patch_resource()
            .withf(|kind, name, _, _| kind == CONTROL_PLANE_KIND && name == "mgmt-a-control-plane")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        client
            .expect_patch_resource()
            .withf(|kind, name, _, patch| {
                kind == MACHINE_DEPLOYMENT_KIND
                    && name == "mgmt-a-md-0"
                    && patch
                        .pointer("/spec/template/spec/infrastructureRef/name")
                        .and_then(|v| v.as_str())
                        == Some("mgmt-a-shared-template")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));

        client
            .expect_machines()
            .returning(|_, _| Ok(vec![machine("cp-0", "v1.28.4", true), machine("w-0", "v1.28.4", false)]));
        client.expect_deployment_replicas().returning(|_, _| Ok(None));

        orchestrator(client, MockProviderInstaller::new())
            .upgrade_cluster(&request())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn a_missing_machine_image_aborts_before_any_patch() {
        let mut client = MockClusterClient::new();
        client.expect_control_plane().returning(|_, _| {
            Ok(ControlPlaneInfo {
                name: "mgmt-a-control-plane".into(),
                namespace: "default".into(),
                version: "v1.28.4".into(),
                replicas: 1,
                ready_replicas: 1,
                infrastructure_template: TemplateRef {
                    kind: "AWSMachineTemplate".into(),
                    name: "mgmt-a-cp-old".into(),
                },
            })
        });
        client.expect_is_topology_managed().returning(|_, _| Ok(false));
        client
            .expect_machine_deployments()
            .returning(|_, _| Ok(Vec::new()));
        client.expect_patch_resource().never();
        client.expect_create_resource().never();

        // the catalog has no machine image for v1.29.0
        let mut request = request();
        request.target_kubernetes_version = Some("v1.29.0".into());

        let err = orchestrator(client, MockProviderInstaller::new())
            .upgrade_cluster(&request)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("machine image"));
    }

    #[tokio::test]
    async fn machine_convergence_timeout_lists_the_lagging_machines() {
        let mut client = MockClusterClient::new();
        client.expect_machines().returning(|_, _| {
            Ok(vec![
                machine("cp-0", "v1.28.4", true),
                machine("cp-1", "v1.27.5", true),
            ])
        });

        let err = orchestrator(client, MockProviderInstaller::new())
            .wait_machines_upgraded("mgmt-a", "default", true, "v1.28.4")
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains("cp-1"));
    }

    // ==========================================================================
    // Story: Half-Built Clusters Cannot Be Upgraded
    // ==========================================================================

    #[tokio::test]
    async fn a_failed_bring_up_record_blocks_the_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ClusterRegistry::new(dir.path().join("clusters.json"));
        registry
            .save(crate::registry::ManagementClusterRecord::new(
                "mgmt-a",
                "mgmt-a-admin",
                "/tmp/kubeconfig",
                RecordStatus::Failed,
            ))
            .unwrap();

        let err = orchestrator(MockClusterClient::new(), MockProviderInstaller::new())
            .with_registry(registry)
            .upgrade_management_cluster(&request())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("never finished"));
    }

    // ==========================================================================
    // Story: Template Naming and Fingerprints
    // ==========================================================================

    #[test]
    fn template_names_embed_cluster_role_and_version() {
        let target: Version = "v1.28.4".parse().unwrap();
        let name = template_name("mgmt-a", "control-plane", &target);
        assert!(name.starts_with("mgmt-a-control-plane-v1-28-4-"));
        assert_eq!(name.len(), "mgmt-a-control-plane-v1-28-4-".len() + 5);
    }

    #[test]
    fn fingerprints_change_with_any_input() {
        let base = template_fingerprint("AWSMachineTemplate", "v1.28.4", "ami-1");
        assert_eq!(
            base,
            template_fingerprint("AWSMachineTemplate", "v1.28.4", "ami-1")
        );
        assert_ne!(base, template_fingerprint("AWSMachineTemplate", "v1.28.5", "ami-1"));
        assert_ne!(base, template_fingerprint("AWSMachineTemplate", "v1.28.4", "ami-2"));
    }
}
