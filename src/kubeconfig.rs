//! Kubeconfig merging
//!
//! Once a target cluster's control plane is reachable, its admin kubeconfig
//! is merged into (a) the user's default kubeconfig without touching the
//! active context, and (b) an internally tracked kubeconfig where the
//! context is switched. Merged files are shared between concurrent
//! invocations, so both operations take the cooperative file lock; only the
//! context-switching variant is fail-closed on lock acquisition.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kube::config::Kubeconfig;
use tracing::{debug, warn};

use crate::registry::FileLock;
use crate::{Error, Result};

/// Lock acquisition timeout for kubeconfig merges
pub const MERGE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

fn lock_path(target: &Path) -> PathBuf {
    let mut path = target.to_path_buf().into_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

fn load(path: &Path) -> Result<Kubeconfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(serde_yaml::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Kubeconfig::default()),
        Err(e) => Err(e.into()),
    }
}

fn store(path: &Path, config: &Kubeconfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_yaml::to_string(config)?)?;
    Ok(())
}

/// Append the fragment's clusters, users, and contexts into `target`,
/// skipping entries whose names already exist
fn merge_into(target: &mut Kubeconfig, fragment: Kubeconfig) {
    for cluster in fragment.clusters {
        if !target.clusters.iter().any(|c| c.name == cluster.name) {
            target.clusters.push(cluster);
        }
    }
    for user in fragment.auth_infos {
        if !target.auth_infos.iter().any(|u| u.name == user.name) {
            target.auth_infos.push(user);
        }
    }
    for context in fragment.contexts {
        if !target.contexts.iter().any(|c| c.name == context.name) {
            target.contexts.push(context);
        }
    }
}

fn fragment_context(fragment: &Kubeconfig) -> Result<String> {
    fragment
        .current_context
        .clone()
        .or_else(|| fragment.contexts.first().map(|c| c.name.clone()))
        .ok_or_else(|| Error::validation("kubeconfig fragment carries no context"))
}

/// Merge `fragment_yaml` into the kubeconfig at `target` without changing
/// the active context
///
/// Lock acquisition failure is logged and the merge proceeds; this path
/// touches the user's default kubeconfig additively only.
pub fn merge_without_switching_context(target: &Path, fragment_yaml: &str) -> Result<()> {
    let _lock = match FileLock::acquire(&lock_path(target), MERGE_LOCK_TIMEOUT) {
        Ok(lock) => Some(lock),
        Err(err) => {
            warn!(target = %target.display(), error = %err, "proceeding without kubeconfig lock");
            None
        }
    };

    let fragment: Kubeconfig = serde_yaml::from_str(fragment_yaml)?;
    let mut config = load(target)?;
    merge_into(&mut config, fragment);
    store(target, &config)?;
    debug!(target = %target.display(), "merged kubeconfig without switching context");
    Ok(())
}

/// Merge `fragment_yaml` into the kubeconfig at `target` and switch the
/// active context to the fragment's context
///
/// Fail-closed on lock acquisition: switching the active context of a
/// shared file under a concurrent writer is never safe.
pub fn merge_and_switch_context(target: &Path, fragment_yaml: &str) -> Result<String> {
    let _lock = FileLock::acquire(&lock_path(target), MERGE_LOCK_TIMEOUT)?;

    let fragment: Kubeconfig = serde_yaml::from_str(fragment_yaml)?;
    let context = fragment_context(&fragment)?;
    let mut config = load(target)?;
    merge_into(&mut config, fragment);
    config.current_context = Some(context.clone());
    store(target, &config)?;
    debug!(target = %target.display(), context = %context, "merged kubeconfig and switched context");
    Ok(context)
}
