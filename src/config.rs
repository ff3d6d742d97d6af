//! Configuration store collaborator
//!
//! The store holds externally supplied configuration and manifest-template
//! inputs only. Values computed mid-pipeline travel through typed state
//! objects, never through this store; the one exception is the worker count
//! write-back, which exists so downstream manifest rendering is
//! deterministic given the same input.

use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Well-known configuration keys read and written by the engine
pub mod keys {
    /// Total requested worker count
    pub const WORKER_MACHINE_COUNT: &str = "WORKER_MACHINE_COUNT";
    /// Worker count for failure domain 0
    pub const WORKER_MACHINE_COUNT_0: &str = "WORKER_MACHINE_COUNT_0";
    /// Worker count for failure domain 1
    pub const WORKER_MACHINE_COUNT_1: &str = "WORKER_MACHINE_COUNT_1";
    /// Worker count for failure domain 2
    pub const WORKER_MACHINE_COUNT_2: &str = "WORKER_MACHINE_COUNT_2";

    /// vSphere endpoint
    pub const VSPHERE_SERVER: &str = "VSPHERE_SERVER";
    /// vSphere username
    pub const VSPHERE_USERNAME: &str = "VSPHERE_USERNAME";
    /// vSphere password
    pub const VSPHERE_PASSWORD: &str = "VSPHERE_PASSWORD";

    /// AWS region
    pub const AWS_REGION: &str = "AWS_REGION";

    /// Azure subscription
    pub const AZURE_SUBSCRIPTION_ID: &str = "AZURE_SUBSCRIPTION_ID";
    /// Azure tenant
    pub const AZURE_TENANT_ID: &str = "AZURE_TENANT_ID";
    /// Azure client id
    pub const AZURE_CLIENT_ID: &str = "AZURE_CLIENT_ID";
    /// Azure client secret
    pub const AZURE_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
}

/// Key-value configuration store
///
/// One instance per orchestrator invocation; backed by files or flags in the
/// operator-facing layer, by memory in tests.
#[cfg_attr(test, automock)]
pub trait ConfigStore: Send + Sync {
    /// Read a value; missing keys are an error so callers can distinguish
    /// "unset" from "empty"
    fn get(&self, key: &str) -> Result<String>;

    /// Write a value
    fn set(&self, key: &str, value: &str);
}

/// Read a key, mapping absence to `None` instead of an error
pub fn get_optional(store: &dyn ConfigStore, key: &str) -> Option<String> {
    store.get(key).ok().filter(|v| !v.is_empty())
}

/// In-memory configuration store
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: DashMap<String, String>,
}

impl MemoryConfigStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from key/value pairs
    pub fn with_values<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let store = Self::new();
        for (k, v) in pairs {
            store.values.insert(k.into(), v.into());
        }
        store
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Result<String> {
        self.values
            .get(key)
            .map(|v| v.clone())
            .ok_or_else(|| Error::config(format!("key {} is not set", key)))
    }

    fn set(&self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}
