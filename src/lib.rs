//! Regatta: cluster lifecycle orchestration
//!
//! Regatta provisions, upgrades, and maintains Kubernetes management and
//! workload clusters across multiple infrastructure back-ends. The hard part
//! of the problem is the bring-up procedure, which talks to two moving
//! targets at once: an ephemeral bootstrap control plane and the permanent
//! target control plane, and ends with a pivot that transfers ownership of
//! live objects between them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   BootstrapOrchestrator                     │
//! │  prerequisites → config → bootstrap cluster → providers     │
//! │  → target manifest → control plane wait → merge credentials │
//! │  → target providers → ready-for-move wait → pivot           │
//! └───────┬───────────────────┬───────────────────┬─────────────┘
//!         │                   │                   │
//!   ┌─────▼─────┐      ┌──────▼───────┐   ┌───────▼──────────┐
//!   │   wait    │      │ ClusterClient│   │ ProviderInstaller│
//!   │  engine   │      │ (per cluster)│   │   (clusterctl)   │
//!   └───────────┘      └──────────────┘   └──────────────────┘
//! ```
//!
//! The [`upgrade::UpgradeOrchestrator`] and
//! [`credentials::CredentialRotationEngine`] operate on clusters produced by
//! the bootstrap flow, through the same collaborator traits.
//!
//! # Collaborators
//!
//! All I/O goes through traits ([`client::ClusterClient`],
//! [`clusterctl::ProviderInstaller`], [`catalog::VersionCatalog`],
//! [`config::ConfigStore`], [`progress::ProgressSink`]) so orchestration
//! logic is testable without a cluster.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod catalog;
pub mod client;
pub mod clusterctl;
pub mod config;
pub mod credentials;
pub mod distribution;
pub mod error;
pub mod kubeconfig;
pub mod progress;
pub mod provider;
pub mod registry;
pub mod upgrade;
pub mod version;
pub mod wait;

pub use error::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the cluster-api core objects live in by default
pub const DEFAULT_CAPI_NAMESPACE: &str = "capi-system";

/// Namespace target clusters are created in when the request does not name one
pub const DEFAULT_TARGET_NAMESPACE: &str = "default";

/// Well-known file name for the bootstrap cluster's kubeconfig
pub const BOOTSTRAP_KUBECONFIG_NAME: &str = "bootstrap.kubeconfig";

/// Cluster annotation carrying the release/edition the cluster runs
pub const RELEASE_ANNOTATION: &str = "regatta.io/release";

/// Annotation carrying a content fingerprint on infrastructure templates,
/// used to detect an equivalent existing template during upgrades
pub const TEMPLATE_FINGERPRINT_ANNOTATION: &str = "regatta.io/template-fingerprint";
