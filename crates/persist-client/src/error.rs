//! Error types for the persistence client session controller.
//!
//! All errors use thiserror for consistent error handling across the codebase.

use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Result type returned by collaborator implementations.
pub type CollaboratorResult<T> = std::result::Result<T, CollaboratorError>;

/// Errors reported by the public entry points.
#[derive(Debug, Error)]
pub enum ClientError {
    /// `deinit` or a negotiation call without a matching `init`.
    #[error("Library not initialized")]
    NotInitialized,

    /// Lifecycle negotiation is disabled for this session.
    #[error("Lifecycle negotiation not permitted: session has no shutdown mode")]
    ShutdownNotPermitted,

    /// The per-session shutdown cancel budget is used up.
    #[error("Shutdown cancel budget exceeded")]
    ShutdownMaxCancelExceeded,

    /// Generic negotiation failure (unknown request, invalid state).
    #[error("Lifecycle negotiation error: {0}")]
    Negotiation(String),

    /// The event-loop thread or its IPC session could not be set up.
    #[error("IPC session setup failed: {0}")]
    IpcSetup(String),

    /// Registration with the lifecycle-management service failed.
    #[error("Lifecycle registration failed: {0}")]
    RegisterLifecycle(String),

    /// Registration with the administration service failed.
    #[error("Admin service registration failed: {0}")]
    RegisterAdmin(String),

    /// Storage backend plugins could not be loaded.
    #[error("Plugin load failed: {0}")]
    PluginLoad(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file is not valid JSON.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// Whether this is a negotiation policy failure.
    ///
    /// Policy failures are returned synchronously and are not worth
    /// retrying; setup failures leave the session un-initialized and a
    /// later `init` runs the full sequence again.
    pub const fn is_policy(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::ShutdownNotPermitted
                | Self::ShutdownMaxCancelExceeded
                | Self::Negotiation(_)
        )
    }
}

/// Failure reported by an external collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// I/O error inside the collaborator.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Collaborator-specific failure.
    #[error("{0}")]
    Failed(String),
}

impl CollaboratorError {
    /// Create a failure from any message.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
