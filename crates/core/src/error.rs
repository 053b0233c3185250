use serde::{Deserialize, Serialize};

/// Failure taxonomy of the provisioning core.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// A required configuration key is missing or malformed. Never retried.
    #[error("configuration: {0}")]
    Configuration(String),
    /// The container runtime call failed or returned unparseable output.
    #[error("runtime: {0}")]
    RuntimeInvocation(String),
    /// Deploying or removing the service of a process failed.
    #[error("deploying process {process}: {message}")]
    Convergence { process: String, message: String },
    /// A cluster control-plane call failed.
    #[error("cluster api: {context}: {message}")]
    ClusterApi { context: String, message: String },
    #[error("image store: {0}")]
    Store(String),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl ProvisionError {
    pub fn convergence(process: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ProvisionError::Convergence { process: process.into(), message: message.to_string() }
    }

    pub fn cluster(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        ProvisionError::ClusterApi { context: context.into(), message: message.to_string() }
    }
}

/// Best-effort failure that was reported but not escalated
/// (compensation failures, cleanup of superseded services).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Advisory {
    /// Where it happened, e.g. `update-services/web`.
    pub scope: String,
    pub message: String,
}

impl Advisory {
    pub fn new(scope: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self { scope: scope.into(), message: message.to_string() }
    }
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.scope, self.message)
    }
}
