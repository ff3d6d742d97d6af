//! Error types for cluster lifecycle operations

use std::time::Duration;

use thiserror::Error;

/// Main error type for lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error (registry, lock files, kubeconfigs)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Pre-flight validation error; occurs before any mutation
    #[error("validation error: {0}")]
    Validation(String),

    /// Infrastructure provider error
    #[error("provider error: {0}")]
    Provider(String),

    /// Bootstrap cluster setup or teardown error
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Pivot (object move) error
    #[error("pivot error: {0}")]
    Pivot(String),

    /// Upgrade orchestration error
    #[error("upgrade error: {0}")]
    Upgrade(String),

    /// Credential rotation error
    #[error("credentials error: {0}")]
    Credentials(String),

    /// Configuration store error (missing or malformed keys)
    #[error("config error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A bounded wait elapsed without the target becoming ready
    #[error("timed out waiting for {operation} after {after:?}: {reason}")]
    Timeout {
        /// Human-readable name of the operation that was waited on
        operation: String,
        /// How long the wait ran before giving up
        after: Duration,
        /// The last observed not-ready reason
        reason: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create a pivot error with the given message
    pub fn pivot(msg: impl Into<String>) -> Self {
        Self::Pivot(msg.into())
    }

    /// Create an upgrade error with the given message
    pub fn upgrade(msg: impl Into<String>) -> Self {
        Self::Upgrade(msg.into())
    }

    /// Create a credentials error with the given message
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a timeout error for the named operation
    pub fn timeout(operation: impl Into<String>, after: Duration, reason: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
            reason: reason.into(),
        }
    }

    /// True for timeout errors from the wait engine
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Categories Across the Cluster Lifecycle
    // ==========================================================================
    //
    // Each variant represents a distinct failure category with its own
    // handling policy: pre-flight errors fail fast, infrastructure errors
    // carry one layer of call-site context, and timeouts record the last
    // observed state so operators can act on them.

    /// Story: pre-flight validation rejects bad requests before any mutation
    #[test]
    fn story_validation_fails_before_any_mutation() {
        let err = Error::validation("prod plan requires at least 3 workers");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("at least 3 workers"));

        match Error::validation("any message") {
            Error::Validation(msg) => assert_eq!(msg, "any message"),
            _ => panic!("expected Validation variant"),
        }
    }

    /// Story: wait timeouts carry the operation name and the last reason
    #[test]
    fn story_timeout_reports_operation_and_last_observed_state() {
        let err = Error::timeout(
            "cluster control plane available",
            Duration::from_secs(300),
            "0 of 3 replicas ready",
        );
        assert!(err.is_timeout());
        let text = err.to_string();
        assert!(text.contains("cluster control plane available"));
        assert!(text.contains("0 of 3 replicas ready"));
    }

    /// Story: upgrade and credential failures are distinguishable for callers
    #[test]
    fn story_lifecycle_errors_are_categorized() {
        fn categorize(err: &Error) -> &'static str {
            match err {
                Error::Validation(_) | Error::Config(_) | Error::Serialization(_) => "reject",
                Error::Timeout { .. } => "inspect_target",
                Error::Pivot(_) => "manual_intervention",
                _ => "surface_to_operator",
            }
        }

        assert_eq!(categorize(&Error::validation("bad plan")), "reject");
        assert_eq!(
            categorize(&Error::timeout("providers", Duration::from_secs(1), "pending")),
            "inspect_target"
        );
        assert_eq!(categorize(&Error::pivot("partial move")), "manual_intervention");
        assert_eq!(categorize(&Error::upgrade("patch rejected")), "surface_to_operator");
    }

    /// Story: constructors accept both String and &str
    #[test]
    fn story_error_construction_ergonomics() {
        let cluster = "prod-us-west";
        let err = Error::upgrade(format!("unable to upgrade cluster {}", cluster));
        assert!(err.to_string().contains("prod-us-west"));

        let err = Error::credentials("either username or password should not be empty");
        assert!(err.to_string().contains("should not be empty"));
    }
}
