//! Session lifecycle controller of the persistence client library.
//!
//! The persistence client library is linked into many independent
//! application processes, and inside one process it may be initialized by
//! several users (threads, plugins, other shared libraries). This crate
//! provides the piece that turns all of those `init`/`deinit` calls into a
//! single logical session per process:
//!
//! - **Session controller** ([`PersistenceClient`]): reference-counted
//!   init/deinit, full setup on the first call, full teardown on the last
//! - **Artifact reclaimer** ([`artifact`]): removes shared memory and
//!   semaphore objects a crashed instance of the same application left behind
//! - **Event loop** ([`event_loop`]): one background thread owning the IPC
//!   session with the lifecycle and administration services
//! - **Command channel** ([`command`]): typed messages from foreground
//!   threads to the event loop
//! - **Shutdown negotiation** ([`negotiation`]): cancellable shutdown with a
//!   per-session cancel budget
//! - **Trust gate** ([`trust`]): optional check for a provisioned resource
//!   configuration table
//!
//! The IPC transport, the storage engine, the plugin loader, the backup
//! blacklist parser and the file cache are collaborators, reached through
//! the traits in [`collab`].
//!
//! # Example
//!
//! ```rust,ignore
//! use persist_client::{ClientConfig, Collaborators, LifecycleRequest, PersistenceClient, ShutdownMode};
//!
//! # fn example(collaborators: Collaborators) -> persist_client::Result<()> {
//! let client = PersistenceClient::new(ClientConfig::default(), collaborators)?;
//!
//! client.init("org.example.navi", ShutdownMode::Slow)?;
//! client.set_lifecycle(LifecycleRequest::Shutdown)?;
//! client.set_lifecycle(LifecycleRequest::ShutdownCancel)?;
//! client.deinit()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

// Stale shared memory cleanup
pub mod artifact;

// Collaborator contracts
pub mod collab;

// Command channel to the event loop
pub mod command;

// Configuration
pub mod config;

// Error types
pub mod error;

// Background event-loop thread
pub mod event_loop;

// Shutdown negotiation
pub mod negotiation;

// Session controller
mod session;

// Application trust check
pub mod trust;

pub use collab::{
    AdminAction, AsyncInitCallback, BlacklistLoader, Collaborators, FileCache, IpcConnector,
    IpcEvent, IpcLink, IpcSession, PluginLoader, StorageBackend,
};
pub use command::{ShutdownOrigin, ShutdownScope};
pub use config::{ClientConfig, TrustConfig};
pub use error::{ClientError, CollaboratorError, CollaboratorResult, Result};
pub use negotiation::{LifecycleRequest, Phase, ShutdownMode};
pub use session::{AppIdentity, PersistenceClient};
pub use trust::TrustState;

/// Version information for the client library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
