//! Error types for the discovery and load-balancer seams.

use thiserror::Error;

/// Failure to resolve an application's backends.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The orchestrator has no such application or service.  The caller
    /// treats this as an empty desired set.
    #[error("application {0} not found")]
    NotFound(String),
    /// The orchestrator could not be reached or rejected the request.  No
    /// load-balancer change may be applied on this pass.
    #[error("discovery unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for DiscoveryError {
    fn from(e: reqwest::Error) -> Self {
        DiscoveryError::Unavailable(e.to_string())
    }
}

impl From<bollard::errors::Error> for DiscoveryError {
    fn from(e: bollard::errors::Error) -> Self {
        DiscoveryError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for DiscoveryError {
    fn from(e: serde_json::Error) -> Self {
        DiscoveryError::Unavailable(format!("malformed response: {}", e))
    }
}

/// Failure reported by the load-balancer control plane.
#[derive(Debug, Error)]
pub enum LbError {
    #[error("NITRO error {code}: {message}")]
    Api { code: i64, message: String },
    /// An object exists under the requested name with different attributes.
    #[error("{0}")]
    Conflict(String),
    #[error("no such resource: {0}")]
    NotFound(String),
    #[error("malformed NITRO response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("session error: {0}")]
    Session(String),
}
