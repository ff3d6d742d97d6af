//! Persisted management-cluster records
//!
//! Every bring-up writes a record for the target cluster: name, context,
//! source kubeconfig path, and lifecycle status. Records are written with
//! `Failed` status as soon as bring-up starts and flipped to `Success` only
//! after the pivot completes, so a later cleanup or retry can find clusters
//! that never finished. The registry file is shared between concurrent
//! process invocations and guarded by a cooperative lock file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Lifecycle status of a management-cluster record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordStatus {
    /// Bring-up has started but not finished
    Pending,
    /// The pivot completed; the cluster is usable
    Success,
    /// Bring-up aborted; the record is kept for cleanup or retry
    Failed,
}

/// One management cluster known to this workstation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementClusterRecord {
    /// Cluster name
    pub cluster_name: String,
    /// Kubeconfig context name for this cluster
    pub context_name: String,
    /// Path of the kubeconfig file the context lives in
    pub source_file_path: String,
    /// Lifecycle status
    pub status: RecordStatus,
    /// Last time this record was written
    pub updated_at: DateTime<Utc>,
}

impl ManagementClusterRecord {
    /// Create a record in the given status, stamped now
    pub fn new(
        cluster_name: impl Into<String>,
        context_name: impl Into<String>,
        source_file_path: impl Into<String>,
        status: RecordStatus,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            context_name: context_name.into(),
            source_file_path: source_file_path.into(),
            status,
            updated_at: Utc::now(),
        }
    }
}

/// A held cooperative lock; released on drop
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock at `path`, retrying until `timeout`
    ///
    /// The lock is a plain lock file created with `create_new`, which is
    /// atomic on every filesystem we care about. Callers decide whether a
    /// failed acquisition is fatal or best-effort.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    debug!(lock = %path.display(), "acquired file lock");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(Error::timeout(
                            format!("file lock {}", path.display()),
                            timeout,
                            "lock is held by another process",
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_context: Option<String>,
    #[serde(default)]
    records: Vec<ManagementClusterRecord>,
}

/// Default lock acquisition timeout for registry operations
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// File-backed store of management-cluster records
pub struct ClusterRegistry {
    path: PathBuf,
    lock_timeout: Duration,
}

impl ClusterRegistry {
    /// Open (or create on first write) the registry at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Override the lock acquisition timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Acquire the registry's lock; exposed so callers that must be
    /// fail-closed can hold it across a wider critical section
    pub fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.lock_path(), self.lock_timeout)
    }

    fn lock_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }

    fn read(&self) -> Result<RegistryFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(RegistryFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, file: &RegistryFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_vec_pretty(file)?)?;
        Ok(())
    }

    /// Insert or overwrite the record for its cluster name
    pub fn save(&self, record: ManagementClusterRecord) -> Result<()> {
        let _lock = self.lock()?;
        let mut file = self.read()?;
        match file
            .records
            .iter_mut()
            .find(|r| r.cluster_name == record.cluster_name)
        {
            Some(existing) => *existing = record,
            None => file.records.push(record),
        }
        self.write(&file)
    }

    /// Insert or overwrite a record, proceeding without the lock if it
    /// cannot be acquired in time
    ///
    /// Finalizers use this: losing a record to a stuck lock would orphan a
    /// half-built cluster, which is worse than a rare unsynchronized write.
    pub fn save_best_effort(&self, record: ManagementClusterRecord) -> Result<()> {
        let lock = match self.lock() {
            Ok(lock) => Some(lock),
            Err(err) => {
                warn!(error = %err, "saving cluster record without the registry lock");
                None
            }
        };
        let _lock = lock;
        let mut file = self.read()?;
        match file
            .records
            .iter_mut()
            .find(|r| r.cluster_name == record.cluster_name)
        {
            Some(existing) => *existing = record,
            None => file.records.push(record),
        }
        self.write(&file)
    }

    /// All known records
    pub fn list(&self) -> Result<Vec<ManagementClusterRecord>> {
        let _lock = self.lock()?;
        Ok(self.read()?.records)
    }

    /// Look up one record by cluster name
    pub fn get(&self, cluster_name: &str) -> Result<Option<ManagementClusterRecord>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.cluster_name == cluster_name))
    }

    /// Mark the named cluster's context as the current one
    ///
    /// Fails if no record with that name and context exists.
    pub fn set_current(&self, cluster_name: &str, context_name: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut file = self.read()?;
        let known = file
            .records
            .iter()
            .any(|r| r.cluster_name == cluster_name && r.context_name == context_name);
        if !known {
            return Err(Error::validation(format!(
                "no record for cluster {} with context {}",
                cluster_name, context_name
            )));
        }
        file.current_context = Some(context_name.to_string());
        self.write(&file)
    }

    /// The currently selected context, if any
    pub fn current_context(&self) -> Result<Option<String>> {
        let _lock = self.lock()?;
        Ok(self.read()?.current_context)
    }

    /// Remove the record for a cluster; no-op when absent
    pub fn delete(&self, cluster_name: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut file = self.read()?;
        file.records.retain(|r| r.cluster_name != cluster_name);
        if let Some(current) = &file.current_context {
            let still_known = file.records.iter().any(|r| &r.context_name == current);
            if !still_known {
                file.current_context = None;
            }
        }
        self.write(&file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (tempfile::TempDir, ClusterRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ClusterRegistry::new(dir.path().join("clusters.json"));
        (dir, registry)
    }

    // ==========================================================================
    // Story: Record Lifecycle
    //
    // A record is written as Failed when bring-up starts and flipped to
    // Success after the pivot; it is never silently dropped.
    // ==========================================================================

    #[test]
    fn save_then_list_round_trips_and_overwrites_by_name() {
        let (_dir, registry) = registry();

        registry
            .save(ManagementClusterRecord::new(
                "mgmt-prod",
                "mgmt-prod-admin@mgmt-prod",
                "/home/op/.kube/config",
                RecordStatus::Failed,
            ))
            .unwrap();

        let records = registry.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Failed);

        registry
            .save(ManagementClusterRecord::new(
                "mgmt-prod",
                "mgmt-prod-admin@mgmt-prod",
                "/home/op/.kube/config",
                RecordStatus::Success,
            ))
            .unwrap();

        let records = registry.list().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RecordStatus::Success);
    }

    #[test]
    fn set_current_requires_a_matching_record() {
        let (_dir, registry) = registry();
        let err = registry.set_current("ghost", "ghost-admin").unwrap_err();
        assert!(err.to_string().contains("no record"));

        registry
            .save(ManagementClusterRecord::new(
                "mgmt-a",
                "mgmt-a-admin",
                "/tmp/kubeconfig",
                RecordStatus::Success,
            ))
            .unwrap();
        registry.set_current("mgmt-a", "mgmt-a-admin").unwrap();
        assert_eq!(
            registry.current_context().unwrap().as_deref(),
            Some("mgmt-a-admin")
        );
    }

    #[test]
    fn delete_removes_the_record_and_clears_a_dangling_current_context() {
        let (_dir, registry) = registry();
        registry
            .save(ManagementClusterRecord::new(
                "mgmt-a",
                "mgmt-a-admin",
                "/tmp/kubeconfig",
                RecordStatus::Success,
            ))
            .unwrap();
        registry.set_current("mgmt-a", "mgmt-a-admin").unwrap();

        registry.delete("mgmt-a").unwrap();
        assert!(registry.list().unwrap().is_empty());
        assert_eq!(registry.current_context().unwrap(), None);
    }

    // ==========================================================================
    // Story: Cooperative Lock
    // ==========================================================================

    #[test]
    fn when_the_lock_is_held_acquisition_times_out_with_a_timeout_error() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("clusters.json.lock");

        let _held = FileLock::acquire(&lock_path, Duration::from_millis(200)).unwrap();
        let err = FileLock::acquire(&lock_path, Duration::from_millis(200)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn dropping_the_lock_releases_it_for_the_next_acquirer() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("clusters.json.lock");

        {
            let _held = FileLock::acquire(&lock_path, Duration::from_millis(200)).unwrap();
        }
        assert!(FileLock::acquire(&lock_path, Duration::from_millis(200)).is_ok());
    }
}
