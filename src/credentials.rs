//! Credential rotation engine
//!
//! Rotates provider identity material on a single cluster or across a whole
//! fleet. All mutations go through the management cluster's API: provider
//! bootstrap secrets, per-cluster identity objects, and the per-cluster
//! cloud-provider and storage credential secrets all live there.
//!
//! A fixed order is applied per cluster: (management cluster only) the
//! provider's bootstrap-manager secret, then the cluster's identity object,
//! then the cloud-provider secret, then the CSI secret. Rotating the
//! bootstrap-manager secret also bounces the controller that caches it in
//! memory, restoring whatever replica count it had before the bounce.
//!
//! Cascading updates treat the management cluster as load-bearing and the
//! workload clusters as best-effort: a management failure aborts everything,
//! a workload failure is logged and the rest of the fleet is still attempted.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::client::ClusterClient;
use crate::{Error, Result};

const CAPV_NAMESPACE: &str = "capv-system";
const CAPV_BOOTSTRAP_SECRET: &str = "capv-manager-bootstrap-credentials";
const CAPV_CONTROLLER: &str = "capv-controller-manager";

const CAPZ_NAMESPACE: &str = "capz-system";
const CAPZ_BOOTSTRAP_SECRET: &str = "capz-manager-bootstrap-credentials";
const CAPZ_CONTROLLER: &str = "capz-controller-manager";

const AZURE_IDENTITY_KIND: &str = "azureclusteridentities.infrastructure.cluster.x-k8s.io";

/// New identity material, typed per provider
#[derive(Debug, Clone)]
pub enum IdentityMaterial {
    /// vSphere username/password pair
    VSphere {
        /// vCenter username
        username: String,
        /// vCenter password
        password: String,
    },
    /// Azure service principal
    Azure {
        /// AAD tenant
        tenant_id: String,
        /// Service principal application id
        client_id: String,
        /// Service principal secret
        client_secret: String,
        /// Target subscription
        subscription_id: String,
    },
}

impl IdentityMaterial {
    /// Reject material with any required field left empty
    pub fn validate(&self) -> Result<()> {
        match self {
            IdentityMaterial::VSphere { username, password } => {
                if username.is_empty() || password.is_empty() {
                    return Err(Error::credentials(
                        "either username or password should not be empty",
                    ));
                }
            }
            IdentityMaterial::Azure {
                tenant_id,
                client_id,
                client_secret,
                subscription_id,
            } => {
                let fields = [
                    ("tenant id", tenant_id),
                    ("client id", client_id),
                    ("client secret", client_secret),
                    ("subscription id", subscription_id),
                ];
                for (label, value) in fields {
                    if value.is_empty() {
                        return Err(Error::credentials(format!(
                            "azure {} should not be empty",
                            label
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Input for one rotation run
#[derive(Debug, Clone)]
pub struct CredentialUpdateRequest {
    /// Cluster whose credentials are rotated
    pub cluster_name: String,
    /// Namespace its cluster object lives in
    pub namespace: String,
    /// The new identity material
    pub material: IdentityMaterial,
    /// True when `cluster_name` is the management cluster itself
    pub is_management_cluster: bool,
    /// Also rotate every workload cluster this management cluster manages
    pub is_cascading: bool,
}

/// Rotates identity material through a management cluster's API
pub struct CredentialRotationEngine {
    client: Arc<dyn ClusterClient>,
}

impl CredentialRotationEngine {
    /// Create an engine over the management cluster's client
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Rotate credentials per the request
    ///
    /// Cascading runs update the management cluster first and abort on its
    /// failure; workload cluster failures are logged and skipped over.
    pub async fn update_credentials(&self, request: &CredentialUpdateRequest) -> Result<()> {
        request.material.validate()?;

        if !request.is_cascading {
            return self
                .update_one(
                    &request.cluster_name,
                    &request.namespace,
                    request.is_management_cluster,
                    &request.material,
                )
                .await;
        }

        if !request.is_management_cluster {
            return Err(Error::credentials(
                "cascading updates must target a management cluster",
            ));
        }

        self.update_one(&request.cluster_name, &request.namespace, true, &request.material)
            .await?;

        let clusters = self.client.list_clusters(None).await?;
        let mut failed = 0usize;
        for cluster in clusters
            .iter()
            .filter(|c| c.name != request.cluster_name)
        {
            info!(cluster = %cluster.name, namespace = %cluster.namespace, "rotating workload cluster credentials");
            if let Err(err) = self
                .update_one(&cluster.name, &cluster.namespace, false, &request.material)
                .await
            {
                failed += 1;
                error!(cluster = %cluster.name, error = %err,
                    "workload cluster credential update failed; continuing with the rest of the fleet");
            }
        }
        if failed > 0 {
            warn!(failed, "some workload clusters were not updated");
        }
        Ok(())
    }

    async fn update_one(
        &self,
        cluster: &str,
        namespace: &str,
        is_management: bool,
        material: &IdentityMaterial,
    ) -> Result<()> {
        match material {
            IdentityMaterial::VSphere { username, password } => {
                self.update_vsphere(cluster, namespace, is_management, username, password)
                    .await
            }
            IdentityMaterial::Azure {
                tenant_id,
                client_id,
                client_secret,
                subscription_id,
            } => {
                self.update_azure(
                    cluster,
                    namespace,
                    is_management,
                    tenant_id,
                    client_id,
                    client_secret,
                    subscription_id,
                )
                .await
            }
        }
    }

    // =========================================================================
    // vSphere
    // =========================================================================

    async fn update_vsphere(
        &self,
        cluster: &str,
        namespace: &str,
        is_management: bool,
        username: &str,
        password: &str,
    ) -> Result<()> {
        if is_management {
            let credentials =
                format!("username: '{}'\npassword: '{}'\n", username, password);
            self.client
                .upsert_secret(
                    CAPV_BOOTSTRAP_SECRET,
                    CAPV_NAMESPACE,
                    BTreeMap::from([("credentials.yaml".to_string(), credentials)]),
                )
                .await?;
            self.bounce_controller(CAPV_CONTROLLER, CAPV_NAMESPACE).await?;
        }

        let pair = BTreeMap::from([
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ]);

        if self.client.has_identity_reference(cluster, namespace).await? {
            self.client
                .upsert_secret(cluster, namespace, pair.clone())
                .await?;
        } else {
            info!(cluster, "cluster has no dedicated identity reference; skipping identity secret");
        }

        self.client
            .upsert_secret(
                &format!("{}-cloud-provider-credentials", cluster),
                namespace,
                pair.clone(),
            )
            .await?;
        self.client
            .upsert_secret(&format!("{}-csi-credentials", cluster), namespace, pair)
            .await?;

        info!(cluster, "vsphere credentials rotated");
        Ok(())
    }

    // =========================================================================
    // Azure
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn update_azure(
        &self,
        cluster: &str,
        namespace: &str,
        is_management: bool,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
        subscription_id: &str,
    ) -> Result<()> {
        if is_management {
            self.client
                .upsert_secret(
                    CAPZ_BOOTSTRAP_SECRET,
                    CAPZ_NAMESPACE,
                    BTreeMap::from([
                        ("tenant-id".to_string(), tenant_id.to_string()),
                        ("client-id".to_string(), client_id.to_string()),
                        ("client-secret".to_string(), client_secret.to_string()),
                        ("subscription-id".to_string(), subscription_id.to_string()),
                    ]),
                )
                .await?;
            self.bounce_controller(CAPZ_CONTROLLER, CAPZ_NAMESPACE).await?;
        }

        if self.client.shares_fleet_identity(cluster, namespace).await? {
            info!(cluster, "cluster shares the fleet identity; rolling the control plane only");
        } else {
            let secret_name = format!("{}-identity-secret", cluster);
            self.client
                .upsert_secret(
                    &secret_name,
                    namespace,
                    BTreeMap::from([("clientSecret".to_string(), client_secret.to_string())]),
                )
                .await?;
            self.client
                .patch_resource(
                    AZURE_IDENTITY_KIND,
                    &format!("{}-identity", cluster),
                    namespace,
                    json!({"spec": {
                        "tenantID": tenant_id,
                        "clientID": client_id,
                        "clientSecret": {"name": secret_name, "namespace": namespace},
                    }}),
                )
                .await?;
        }

        // nodes read the identity at boot; a rollout picks up the change
        self.client.rollout_control_plane(cluster, namespace).await?;

        info!(cluster, "azure credentials rotated");
        Ok(())
    }

    /// Restart a controller so it drops cached credentials
    ///
    /// The replica count is read first and restored verbatim; a controller
    /// already scaled to zero is left alone.
    async fn bounce_controller(&self, name: &str, namespace: &str) -> Result<()> {
        let replicas = self
            .client
            .deployment_replicas(name, namespace)
            .await?
            .unwrap_or(0);
        if replicas == 0 {
            info!(deployment = %name, "controller has no replicas; skipping restart");
            return Ok(());
        }
        self.client.scale_deployment(name, namespace, 0).await?;
        self.client.scale_deployment(name, namespace, replicas).await?;
        info!(deployment = %name, replicas, "controller restarted");
        Ok(())
    }
}
