//! Error types for the bootstrap system.

use thiserror::Error;

/// Result type alias for bootstrap operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while bootstrapping.
#[derive(Error, Debug)]
pub enum Error {
    /// A network location was requested before networking was allowed
    #[error("Networking not available to load resource: {0}")]
    NoNetwork(String),

    /// No location yielded the resource
    #[error("Failed to find resource: {0}")]
    NotFound(String),

    /// HTTP request completed with a non-success status
    #[error("Non-success HTTP response from {url}: {status}")]
    HttpStatus { url: String, status: u16 },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Directory transfer failed
    #[error("Directory transfer failed: {0}")]
    Transfer(String),

    /// A service from a service set failed
    #[error("Service {service} in set {set} failed: {reason}")]
    ServiceFailed {
        set: String,
        service: String,
        reason: String,
    },

    /// The bootstrap engine could not be started
    #[error("Failed to spawn bootstrap engine: {0}")]
    EngineSpawn(String),

    /// The bootstrap engine could not be stopped cleanly
    #[error("Failed to stop bootstrap engine: {0}")]
    EngineStop(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether nothing could be resolved for a resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether a resource load needed networking that was not yet allowed.
    pub fn is_no_network(&self) -> bool {
        matches!(self, Error::NoNetwork(_))
    }
}
