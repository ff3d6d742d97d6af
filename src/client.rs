//! Cluster resource client
//!
//! One [`ClusterClient`] instance talks to one cluster: the bootstrap
//! cluster, the target management cluster, or an existing cluster being
//! upgraded. Orchestrators depend only on the trait; the real
//! implementation shells out to kubectl and parses its JSON output, which
//! keeps the engine independent of any in-process API machinery.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine as _;
use k8s_openapi::api::apps::v1::Deployment;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::wait::{self, PollOptions, WaitOutcome};
use crate::{Error, Result};

// =============================================================================
// Typed resource views
// =============================================================================

/// Name and namespace of a cluster object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterRef {
    /// Cluster name
    pub name: String,
    /// Namespace the cluster object lives in
    pub namespace: String,
}

/// Category of an installed provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderCategory {
    /// The cluster-api core provider; exactly one per cluster
    Core,
    /// Bootstrap providers
    Bootstrap,
    /// Control-plane providers
    ControlPlane,
    /// Infrastructure providers
    Infrastructure,
}

impl FromStr for ProviderCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CoreProvider" => Ok(Self::Core),
            "BootstrapProvider" => Ok(Self::Bootstrap),
            "ControlPlaneProvider" => Ok(Self::ControlPlane),
            "InfrastructureProvider" => Ok(Self::Infrastructure),
            other => Err(Error::provider(format!(
                "unknown provider category {:?}",
                other
            ))),
        }
    }
}

/// A provider installed on a cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProvider {
    /// Manifest name used as the catalog key, e.g. `infrastructure-aws`
    pub name: String,
    /// Namespace the provider runs in
    pub namespace: String,
    /// Installed version
    pub version: String,
    /// Provider category
    pub category: ProviderCategory,
    /// Name of the provider's controller deployment
    pub controller_deployment: String,
}

/// Reference to an infrastructure machine template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    /// Template kind, e.g. `AWSMachineTemplate`
    pub kind: String,
    /// Template name
    pub name: String,
}

/// Control-plane object view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneInfo {
    /// Object name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Kubernetes version currently set on the control plane
    pub version: String,
    /// Desired replicas
    pub replicas: i32,
    /// Ready replicas
    pub ready_replicas: i32,
    /// Infrastructure template currently referenced
    pub infrastructure_template: TemplateRef,
}

/// Worker node-group view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDeploymentInfo {
    /// Object name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Kubernetes version currently set on the node group
    pub version: String,
    /// Desired replicas
    pub replicas: i32,
    /// Ready replicas
    pub ready_replicas: i32,
    /// Infrastructure template currently referenced
    pub infrastructure_template: TemplateRef,
}

/// Individual machine view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    /// Machine name
    pub name: String,
    /// Kubernetes version reported on the machine spec
    pub version: Option<String>,
    /// True for control-plane machines
    pub is_control_plane: bool,
    /// True when the machine is in the running phase
    pub running: bool,
}

// =============================================================================
// Collaborator trait
// =============================================================================

/// Operations the orchestrators need against one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Apply a rendered manifest
    async fn apply(&self, manifest: &str) -> Result<()>;

    /// Create a namespaced resource from its JSON representation
    async fn create_resource(&self, kind: &str, namespace: &str, body: Value) -> Result<()>;

    /// Merge-patch a namespaced resource
    async fn patch_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        patch: Value,
    ) -> Result<()>;

    /// Fetch a namespaced resource as JSON; `None` when it does not exist
    async fn get_resource(&self, kind: &str, name: &str, namespace: &str)
        -> Result<Option<Value>>;

    /// Clusters known to this cluster's API, optionally scoped by namespace
    async fn list_clusters<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<ClusterRef>>;

    /// Providers installed on this cluster
    async fn installed_providers(&self) -> Result<Vec<InstalledProvider>>;

    /// Admin kubeconfig for a cluster managed by this one
    async fn admin_kubeconfig(&self, cluster: &str, namespace: &str) -> Result<String>;

    /// True when the named cluster is driven by a declarative topology
    async fn is_topology_managed(&self, cluster: &str, namespace: &str) -> Result<bool>;

    /// Control-plane object owned by the named cluster
    async fn control_plane(&self, cluster: &str, namespace: &str) -> Result<ControlPlaneInfo>;

    /// Worker node groups owned by the named cluster
    async fn machine_deployments(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<MachineDeploymentInfo>>;

    /// Machines owned by the named cluster
    async fn machines(&self, cluster: &str, namespace: &str) -> Result<Vec<MachineInfo>>;

    /// Wait until the cluster's control plane reports available
    async fn wait_control_plane_available(&self, cluster: &str, namespace: &str) -> Result<()>;

    /// Wait until the cluster is fully reconciled
    ///
    /// With `check_all_replicas` the wait also requires every control-plane
    /// and worker replica to be ready; the relaxed form is used before a
    /// pivot, where only topology and status reconciliation matter.
    async fn wait_cluster_ready(
        &self,
        cluster: &str,
        namespace: &str,
        check_all_replicas: bool,
    ) -> Result<()>;

    /// Wait until a deployment has its desired replicas available
    async fn wait_deployment_available(&self, name: &str, namespace: &str) -> Result<()>;

    /// Annotate a cluster object
    async fn annotate_cluster(
        &self,
        cluster: &str,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Current replica count of a deployment; `None` when it does not exist
    async fn deployment_replicas(&self, name: &str, namespace: &str) -> Result<Option<i32>>;

    /// Scale a deployment
    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()>;

    /// Replace the image of one container in a deployment
    async fn set_deployment_image(
        &self,
        name: &str,
        namespace: &str,
        container: &str,
        image: &str,
    ) -> Result<()>;

    /// Data of a config map; `None` when it does not exist
    async fn config_map_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>>;

    /// Create or update a secret with the given string data
    async fn upsert_secret(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Name of an existing infrastructure template carrying the given
    /// content fingerprint, if one exists in the namespace
    async fn find_template_by_fingerprint(
        &self,
        kind: &str,
        namespace: &str,
        fingerprint: &str,
    ) -> Result<Option<String>>;

    /// Names of managed addon packages installed on this cluster
    async fn list_addon_packages(&self, namespace: &str) -> Result<Vec<String>>;

    /// Wait until a package install reports a successful reconcile
    async fn wait_package_reconciled(&self, name: &str, namespace: &str) -> Result<()>;

    /// True when the named cluster references a dedicated identity secret
    async fn has_identity_reference(&self, cluster: &str, namespace: &str) -> Result<bool>;

    /// True when the named cluster shares the management cluster's fleet
    /// identity object instead of owning a dedicated one
    async fn shares_fleet_identity(&self, cluster: &str, namespace: &str) -> Result<bool>;

    /// Trigger a rolling restart of the cluster's control-plane machines
    async fn rollout_control_plane(&self, cluster: &str, namespace: &str) -> Result<()>;
}

// =============================================================================
// JSON view parsing
// =============================================================================

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

fn int_at(value: &Value, pointer: &str) -> i32 {
    value.pointer(pointer).and_then(Value::as_i64).unwrap_or(0) as i32
}

pub(crate) fn provider_from_value(item: &Value) -> Result<InstalledProvider> {
    let name = str_at(item, "/metadata/name")
        .ok_or_else(|| Error::provider("provider object has no name"))?
        .to_string();
    let namespace = str_at(item, "/metadata/namespace").unwrap_or("default").to_string();
    let version = str_at(item, "/spec/version")
        .or_else(|| str_at(item, "/status/installedVersion"))
        .ok_or_else(|| Error::provider(format!("provider {} has no version", name)))?
        .to_string();
    let category: ProviderCategory = str_at(item, "/kind")
        .ok_or_else(|| Error::provider(format!("provider {} has no kind", name)))?
        .parse()?;

    // controller deployments follow the capi convention:
    // infrastructure-aws -> capa-controller-manager lives next to the
    // provider object, named by its own label
    let controller_deployment = str_at(item, "/metadata/labels/cluster.x-k8s.io~1provider")
        .map(|p| format!("{}-controller-manager", p))
        .unwrap_or_else(|| format!("{}-controller-manager", name));

    Ok(InstalledProvider {
        name,
        namespace,
        version,
        category,
        controller_deployment,
    })
}

pub(crate) fn control_plane_from_value(item: &Value) -> Result<ControlPlaneInfo> {
    let name = str_at(item, "/metadata/name")
        .ok_or_else(|| Error::upgrade("control plane object has no name"))?
        .to_string();
    Ok(ControlPlaneInfo {
        namespace: str_at(item, "/metadata/namespace").unwrap_or("default").to_string(),
        version: str_at(item, "/spec/version").unwrap_or_default().to_string(),
        replicas: int_at(item, "/spec/replicas"),
        ready_replicas: int_at(item, "/status/readyReplicas"),
        infrastructure_template: TemplateRef {
            kind: str_at(item, "/spec/machineTemplate/infrastructureRef/kind")
                .unwrap_or_default()
                .to_string(),
            name: str_at(item, "/spec/machineTemplate/infrastructureRef/name")
                .unwrap_or_default()
                .to_string(),
        },
        name,
    })
}

pub(crate) fn machine_deployment_from_value(item: &Value) -> Result<MachineDeploymentInfo> {
    let name = str_at(item, "/metadata/name")
        .ok_or_else(|| Error::upgrade("machine deployment has no name"))?
        .to_string();
    Ok(MachineDeploymentInfo {
        namespace: str_at(item, "/metadata/namespace").unwrap_or("default").to_string(),
        version: str_at(item, "/spec/template/spec/version")
            .unwrap_or_default()
            .to_string(),
        replicas: int_at(item, "/spec/replicas"),
        ready_replicas: int_at(item, "/status/readyReplicas"),
        infrastructure_template: TemplateRef {
            kind: str_at(item, "/spec/template/spec/infrastructureRef/kind")
                .unwrap_or_default()
                .to_string(),
            name: str_at(item, "/spec/template/spec/infrastructureRef/name")
                .unwrap_or_default()
                .to_string(),
        },
        name,
    })
}

pub(crate) fn machine_from_value(item: &Value) -> Result<MachineInfo> {
    let name = str_at(item, "/metadata/name")
        .ok_or_else(|| Error::upgrade("machine has no name"))?
        .to_string();
    let labels = item.pointer("/metadata/labels");
    let is_control_plane = labels
        .and_then(|l| l.get("cluster.x-k8s.io/control-plane"))
        .is_some();
    Ok(MachineInfo {
        name,
        version: str_at(item, "/spec/version").map(str::to_string),
        is_control_plane,
        running: str_at(item, "/status/phase") == Some("Running"),
    })
}

pub(crate) fn deployment_available(deployment: &Deployment) -> WaitOutcome {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .unwrap_or(0);
    if available >= desired {
        WaitOutcome::Ready
    } else {
        WaitOutcome::NotReady(format!("{} of {} replicas available", available, desired))
    }
}

// =============================================================================
// kubectl-backed implementation
// =============================================================================

/// Client that drives a cluster through kubectl
pub struct KubectlClient {
    kubeconfig: PathBuf,
    context: Option<String>,
    poll: PollOptions,
}

impl KubectlClient {
    /// Create a client for the cluster reachable through `kubeconfig`
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            context: None,
            poll: PollOptions::default(),
        }
    }

    /// Pin the kubeconfig context to use
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Override the poll bounds used by the wait methods
    pub fn with_poll_options(mut self, poll: PollOptions) -> Self {
        self.poll = poll;
        self
    }

    async fn run(&self, args: Vec<String>, stdin: Option<String>) -> Result<Vec<u8>> {
        let kubeconfig = self.kubeconfig.clone();
        let context = self.context.clone();
        let rendered = args.join(" ");
        debug!(command = %rendered, "running kubectl");

        let output = spawn_blocking(move || {
            let mut command = Command::new("kubectl");
            command.arg("--kubeconfig").arg(&kubeconfig);
            if let Some(context) = &context {
                command.arg("--context").arg(context);
            }
            command.args(&args);
            if let Some(input) = stdin {
                use std::io::Write;
                command
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped())
                    .stderr(std::process::Stdio::piped());
                let mut child = command.spawn()?;
                if let Some(pipe) = child.stdin.as_mut() {
                    pipe.write_all(input.as_bytes())?;
                }
                child.wait_with_output()
            } else {
                command.output()
            }
        })
        .await
        .map_err(|e| Error::provider(format!("kubectl task failed: {}", e)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("NotFound") || stderr.contains("not found") {
                return Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: stderr.to_string(),
                    reason: "NotFound".to_string(),
                    code: 404,
                })));
            }
            return Err(Error::provider(format!(
                "kubectl {} failed: {}",
                rendered, stderr
            )));
        }
        Ok(output.stdout)
    }

    fn is_not_found(err: &Error) -> bool {
        matches!(err, Error::Kube(kube::Error::Api(response)) if response.code == 404)
    }

    async fn get_json(&self, args: Vec<String>) -> Result<Value> {
        let mut args = args;
        args.extend(["-o".to_string(), "json".to_string()]);
        let stdout = self.run(args, None).await?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    async fn try_get_json(&self, args: Vec<String>) -> Result<Option<Value>> {
        match self.get_json(args).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if Self::is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_items(&self, args: Vec<String>) -> Result<Vec<Value>> {
        let value = self.get_json(args).await?;
        Ok(value
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    fn owned_selector(cluster: &str) -> String {
        format!("cluster.x-k8s.io/cluster-name={}", cluster)
    }
}

#[async_trait]
impl ClusterClient for KubectlClient {
    async fn apply(&self, manifest: &str) -> Result<()> {
        self.run(
            vec!["apply".into(), "-f".into(), "-".into()],
            Some(manifest.to_string()),
        )
        .await?;
        Ok(())
    }

    async fn create_resource(&self, kind: &str, namespace: &str, body: Value) -> Result<()> {
        info!(kind, namespace, "creating resource");
        self.run(
            vec!["create".into(), "-n".into(), namespace.into(), "-f".into(), "-".into()],
            Some(serde_json::to_string(&body)?),
        )
        .await?;
        Ok(())
    }

    async fn patch_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
        patch: Value,
    ) -> Result<()> {
        self.run(
            vec![
                "patch".into(),
                kind.into(),
                name.into(),
                "-n".into(),
                namespace.into(),
                "--type".into(),
                "merge".into(),
                "-p".into(),
                serde_json::to_string(&patch)?,
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn get_resource(
        &self,
        kind: &str,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Value>> {
        self.try_get_json(vec![
            "get".into(),
            kind.into(),
            name.into(),
            "-n".into(),
            namespace.into(),
        ])
        .await
    }

    async fn list_clusters<'a>(&self, namespace: Option<&'a str>) -> Result<Vec<ClusterRef>> {
        let mut args = vec!["get".to_string(), "clusters.cluster.x-k8s.io".to_string()];
        match namespace {
            Some(ns) => args.extend(["-n".to_string(), ns.to_string()]),
            None => args.push("-A".to_string()),
        }
        let items = self.list_items(args).await?;
        Ok(items
            .iter()
            .filter_map(|item| {
                Some(ClusterRef {
                    name: str_at(item, "/metadata/name")?.to_string(),
                    namespace: str_at(item, "/metadata/namespace")?.to_string(),
                })
            })
            .collect())
    }

    async fn installed_providers(&self) -> Result<Vec<InstalledProvider>> {
        let mut providers = Vec::new();
        for kind in [
            "coreproviders.operator.cluster.x-k8s.io",
            "bootstrapproviders.operator.cluster.x-k8s.io",
            "controlplaneproviders.operator.cluster.x-k8s.io",
            "infrastructureproviders.operator.cluster.x-k8s.io",
        ] {
            let items = self
                .list_items(vec!["get".into(), kind.into(), "-A".into()])
                .await?;
            for item in &items {
                providers.push(provider_from_value(item)?);
            }
        }
        Ok(providers)
    }

    async fn admin_kubeconfig(&self, cluster: &str, namespace: &str) -> Result<String> {
        let secret = self
            .get_resource("secret", &format!("{}-kubeconfig", cluster), namespace)
            .await?
            .ok_or_else(|| {
                Error::provider(format!("kubeconfig secret for cluster {} not found", cluster))
            })?;
        let encoded = str_at(&secret, "/data/value")
            .ok_or_else(|| Error::provider("kubeconfig secret has no value key"))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::serialization(format!("kubeconfig secret is not base64: {}", e)))?;
        String::from_utf8(decoded)
            .map_err(|e| Error::serialization(format!("kubeconfig is not utf-8: {}", e)))
    }

    async fn is_topology_managed(&self, cluster: &str, namespace: &str) -> Result<bool> {
        let value = self
            .get_resource("clusters.cluster.x-k8s.io", cluster, namespace)
            .await?
            .ok_or_else(|| Error::upgrade(format!("cluster {} not found", cluster)))?;
        Ok(value.pointer("/spec/topology/class").is_some())
    }

    async fn control_plane(&self, cluster: &str, namespace: &str) -> Result<ControlPlaneInfo> {
        let items = self
            .list_items(vec![
                "get".into(),
                "kubeadmcontrolplanes.controlplane.cluster.x-k8s.io".into(),
                "-n".into(),
                namespace.into(),
                "-l".into(),
                Self::owned_selector(cluster),
            ])
            .await?;
        let item = items.first().ok_or_else(|| {
            Error::upgrade(format!("no control plane object found for cluster {}", cluster))
        })?;
        control_plane_from_value(item)
    }

    async fn machine_deployments(
        &self,
        cluster: &str,
        namespace: &str,
    ) -> Result<Vec<MachineDeploymentInfo>> {
        let items = self
            .list_items(vec![
                "get".into(),
                "machinedeployments.cluster.x-k8s.io".into(),
                "-n".into(),
                namespace.into(),
                "-l".into(),
                Self::owned_selector(cluster),
            ])
            .await?;
        items.iter().map(machine_deployment_from_value).collect()
    }

    async fn machines(&self, cluster: &str, namespace: &str) -> Result<Vec<MachineInfo>> {
        let items = self
            .list_items(vec![
                "get".into(),
                "machines.cluster.x-k8s.io".into(),
                "-n".into(),
                namespace.into(),
                "-l".into(),
                Self::owned_selector(cluster),
            ])
            .await?;
        items.iter().map(machine_from_value).collect()
    }

    async fn wait_control_plane_available(&self, cluster: &str, namespace: &str) -> Result<()> {
        let operation = format!("cluster {} control plane available", cluster);
        wait::wait_until(self.poll, &operation, || async move {
            let info = self.control_plane(cluster, namespace).await?;
            if info.ready_replicas > 0 {
                Ok(WaitOutcome::Ready)
            } else {
                Ok(WaitOutcome::NotReady(format!(
                    "0 of {} control plane replicas ready",
                    info.replicas
                )))
            }
        })
        .await
    }

    async fn wait_cluster_ready(
        &self,
        cluster: &str,
        namespace: &str,
        check_all_replicas: bool,
    ) -> Result<()> {
        let operation = format!("cluster {} ready", cluster);
        wait::wait_until(self.poll, &operation, || async move {
            let value = self
                .get_resource("clusters.cluster.x-k8s.io", cluster, namespace)
                .await?
                .ok_or_else(|| Error::upgrade(format!("cluster {} not found", cluster)))?;
            if str_at(&value, "/status/phase") != Some("Provisioned") {
                return Ok(WaitOutcome::NotReady("cluster phase not Provisioned".into()));
            }
            if check_all_replicas {
                let control_plane = self.control_plane(cluster, namespace).await?;
                if control_plane.ready_replicas < control_plane.replicas {
                    return Ok(WaitOutcome::NotReady(format!(
                        "{} of {} control plane replicas ready",
                        control_plane.ready_replicas, control_plane.replicas
                    )));
                }
                for md in self.machine_deployments(cluster, namespace).await? {
                    if md.ready_replicas < md.replicas {
                        return Ok(WaitOutcome::NotReady(format!(
                            "node group {}: {} of {} replicas ready",
                            md.name, md.ready_replicas, md.replicas
                        )));
                    }
                }
            }
            Ok(WaitOutcome::Ready)
        })
        .await
    }

    async fn wait_deployment_available(&self, name: &str, namespace: &str) -> Result<()> {
        let operation = format!("deployment {}/{} available", namespace, name);
        wait::wait_until(self.poll, &operation, || async move {
            let value = self
                .get_resource("deployment", name, namespace)
                .await?
                .ok_or_else(|| {
                    Error::provider(format!("deployment {}/{} not found", namespace, name))
                })?;
            let deployment: Deployment = serde_json::from_value(value)?;
            Ok(deployment_available(&deployment))
        })
        .await
    }

    async fn annotate_cluster(
        &self,
        cluster: &str,
        namespace: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        self.patch_resource(
            "clusters.cluster.x-k8s.io",
            cluster,
            namespace,
            json!({"metadata": {"annotations": {key: value}}}),
        )
        .await
    }

    async fn deployment_replicas(&self, name: &str, namespace: &str) -> Result<Option<i32>> {
        match self.get_resource("deployment", name, namespace).await? {
            Some(value) => Ok(Some(int_at(&value, "/spec/replicas"))),
            None => Ok(None),
        }
    }

    async fn scale_deployment(&self, name: &str, namespace: &str, replicas: i32) -> Result<()> {
        info!(deployment = name, namespace, replicas, "scaling deployment");
        self.run(
            vec![
                "scale".into(),
                "deployment".into(),
                name.into(),
                "-n".into(),
                namespace.into(),
                format!("--replicas={}", replicas),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn set_deployment_image(
        &self,
        name: &str,
        namespace: &str,
        container: &str,
        image: &str,
    ) -> Result<()> {
        info!(deployment = name, namespace, image, "updating deployment image");
        self.run(
            vec![
                "set".into(),
                "image".into(),
                format!("deployment/{}", name),
                format!("{}={}", container, image),
                "-n".into(),
                namespace.into(),
            ],
            None,
        )
        .await?;
        Ok(())
    }

    async fn config_map_data(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<BTreeMap<String, String>>> {
        match self.get_resource("configmap", name, namespace).await? {
            Some(value) => {
                let data = value
                    .pointer("/data")
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    async fn upsert_secret(
        &self,
        name: &str,
        namespace: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        let encoded: BTreeMap<String, String> = data
            .into_iter()
            .map(|(k, v)| (k, base64::engine::general_purpose::STANDARD.encode(v)))
            .collect();
        let body = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {"name": name, "namespace": namespace},
            "data": encoded,
        });
        if self.get_resource("secret", name, namespace).await?.is_some() {
            self.patch_resource("secret", name, namespace, json!({"data": body["data"].clone()}))
                .await
        } else {
            self.create_resource("secret", namespace, body).await
        }
    }

    async fn find_template_by_fingerprint(
        &self,
        kind: &str,
        namespace: &str,
        fingerprint: &str,
    ) -> Result<Option<String>> {
        let items = self
            .list_items(vec!["get".into(), kind.to_ascii_lowercase(), "-n".into(), namespace.into()])
            .await?;
        Ok(items.iter().find_map(|item| {
            let annotation = str_at(
                item,
                &format!(
                    "/metadata/annotations/{}",
                    crate::TEMPLATE_FINGERPRINT_ANNOTATION.replace('/', "~1")
                ),
            )?;
            if annotation == fingerprint {
                str_at(item, "/metadata/name").map(str::to_string)
            } else {
                None
            }
        }))
    }

    async fn list_addon_packages(&self, namespace: &str) -> Result<Vec<String>> {
        let items = self
            .list_items(vec![
                "get".into(),
                "packageinstalls.packaging.carvel.dev".into(),
                "-n".into(),
                namespace.into(),
            ])
            .await?;
        Ok(items
            .iter()
            .filter_map(|item| str_at(item, "/metadata/name").map(str::to_string))
            .collect())
    }

    async fn wait_package_reconciled(&self, name: &str, namespace: &str) -> Result<()> {
        let operation = format!("package {}/{} reconciled", namespace, name);
        wait::wait_until(self.poll, &operation, || async move {
            let value = self
                .get_resource("packageinstalls.packaging.carvel.dev", name, namespace)
                .await?
                .ok_or_else(|| {
                    Error::provider(format!("package install {}/{} not found", namespace, name))
                })?;
            let reconciled = value
                .pointer("/status/conditions")
                .and_then(Value::as_array)
                .map(|conditions| {
                    conditions.iter().any(|c| {
                        str_at(c, "/type") == Some("ReconcileSucceeded")
                            && str_at(c, "/status") == Some("True")
                    })
                })
                .unwrap_or(false);
            if reconciled {
                Ok(WaitOutcome::Ready)
            } else {
                Ok(WaitOutcome::NotReady("reconcile not yet succeeded".into()))
            }
        })
        .await
    }

    async fn has_identity_reference(&self, cluster: &str, namespace: &str) -> Result<bool> {
        let value = self
            .get_resource("clusters.cluster.x-k8s.io", cluster, namespace)
            .await?
            .ok_or_else(|| Error::credentials(format!("cluster {} not found", cluster)))?;
        Ok(value
            .pointer("/spec/infrastructureRef")
            .and_then(|r| r.get("identityRef"))
            .is_some()
            || str_at(&value, "/spec/identityRef/name").is_some())
    }

    async fn shares_fleet_identity(&self, cluster: &str, namespace: &str) -> Result<bool> {
        let value = self
            .get_resource("azureclusters.infrastructure.cluster.x-k8s.io", cluster, namespace)
            .await?;
        match value {
            Some(value) => Ok(str_at(&value, "/spec/identityRef/namespace")
                .map(|ns| ns != namespace)
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    async fn rollout_control_plane(&self, cluster: &str, namespace: &str) -> Result<()> {
        let control_plane = self.control_plane(cluster, namespace).await?;
        self.patch_resource(
            "kubeadmcontrolplanes.controlplane.cluster.x-k8s.io",
            &control_plane.name,
            namespace,
            json!({"spec": {"rolloutAfter": chrono::Utc::now().to_rfc3339()}}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story: Parsing Resource Views from API JSON
    // ==========================================================================

    #[test]
    fn provider_view_carries_category_and_controller_deployment() {
        let item = json!({
            "kind": "InfrastructureProvider",
            "metadata": {
                "name": "infrastructure-aws",
                "namespace": "capa-system",
                "labels": {"cluster.x-k8s.io/provider": "capa"}
            },
            "spec": {"version": "v2.2.0"}
        });
        let provider = provider_from_value(&item).unwrap();
        assert_eq!(provider.category, ProviderCategory::Infrastructure);
        assert_eq!(provider.version, "v2.2.0");
        assert_eq!(provider.controller_deployment, "capa-controller-manager");
    }

    #[test]
    fn provider_view_rejects_unknown_categories() {
        let item = json!({
            "kind": "MysteryProvider",
            "metadata": {"name": "x", "namespace": "default"},
            "spec": {"version": "v1.0.0"}
        });
        assert!(provider_from_value(&item).is_err());
    }

    #[test]
    fn control_plane_view_reads_version_replicas_and_template() {
        let item = json!({
            "metadata": {"name": "mgmt-control-plane", "namespace": "default"},
            "spec": {
                "version": "v1.27.5",
                "replicas": 3,
                "machineTemplate": {
                    "infrastructureRef": {"kind": "AWSMachineTemplate", "name": "mgmt-cp-v1-27-5"}
                }
            },
            "status": {"readyReplicas": 2}
        });
        let info = control_plane_from_value(&item).unwrap();
        assert_eq!(info.version, "v1.27.5");
        assert_eq!(info.replicas, 3);
        assert_eq!(info.ready_replicas, 2);
        assert_eq!(info.infrastructure_template.kind, "AWSMachineTemplate");
    }

    #[test]
    fn machine_view_distinguishes_control_plane_machines() {
        let worker = json!({
            "metadata": {"name": "md-0-abc", "labels": {}},
            "spec": {"version": "v1.27.5"},
            "status": {"phase": "Running"}
        });
        let cp = json!({
            "metadata": {
                "name": "cp-0",
                "labels": {"cluster.x-k8s.io/control-plane": ""}
            },
            "spec": {"version": "v1.28.4"},
            "status": {"phase": "Provisioning"}
        });

        let worker = machine_from_value(&worker).unwrap();
        assert!(!worker.is_control_plane);
        assert!(worker.running);

        let cp = machine_from_value(&cp).unwrap();
        assert!(cp.is_control_plane);
        assert!(!cp.running);
        assert_eq!(cp.version.as_deref(), Some("v1.28.4"));
    }

    #[test]
    fn deployment_availability_compares_available_to_desired() {
        let deployment: Deployment = serde_json::from_value(json!({
            "spec": {"replicas": 2},
            "status": {"availableReplicas": 1}
        }))
        .unwrap();
        assert_eq!(
            deployment_available(&deployment),
            WaitOutcome::NotReady("1 of 2 replicas available".into())
        );

        let deployment: Deployment = serde_json::from_value(json!({
            "spec": {"replicas": 2},
            "status": {"availableReplicas": 2}
        }))
        .unwrap();
        assert_eq!(deployment_available(&deployment), WaitOutcome::Ready);
    }

    #[test]
    fn deployment_without_explicit_replicas_defaults_to_one() {
        let deployment: Deployment = serde_json::from_value(json!({
            "status": {"availableReplicas": 1}
        }))
        .unwrap();
        assert_eq!(deployment_available(&deployment), WaitOutcome::Ready);
    }
}
