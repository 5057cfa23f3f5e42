//! Controller-specific error types.

use thiserror::Error;

use cluster_gateway::GatewayError;

/// Errors that can occur in the runboat controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// No such build
    #[error("build not found: {0}")]
    NotFound(String),

    /// Duplicate deploy, or command illegal in the current state
    #[error("{0}")]
    Conflict(String),

    /// Repo/branch matches no rule, or the input is malformed
    #[error("{0}")]
    Rejected(String),

    /// The index has not completed its initial list yet
    #[error("controller is still starting")]
    Unavailable,

    /// Cluster API error
    #[error("cluster error: {0}")]
    Gateway(#[from] GatewayError),

    /// Watch stream failed
    #[error("watch failed: {0}")]
    Watch(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error (server bind, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
