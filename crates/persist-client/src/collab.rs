//! Contracts of the external collaborators the session controller drives.
//!
//! The controller does not know the IPC wire format, the storage engine
//! layout or the plugin ABI. It talks to them through these traits, which
//! are selected at startup and bundled in [`Collaborators`].

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::CollaboratorResult;
use crate::command::ShutdownScope;
use crate::negotiation::ShutdownMode;

/// Request issued by the administration service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    /// Block storage access and write back all cached data
    Block,
    /// Write back cached data without blocking access
    WriteBack,
    /// Re-open storage access
    Unblock,
}

/// Event arriving from an external service over the IPC session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcEvent {
    /// The lifecycle-management service asks for shutdown preparation.
    LifecycleShutdown {
        /// Identifier to echo in the completion reply
        request_id: u32,
        /// Requested shutdown scope
        scope: ShutdownScope,
    },
    /// The administration service issued a request.
    Admin {
        /// Identifier to echo in the completion reply
        request_id: u32,
        /// Requested action
        action: AdminAction,
    },
}

/// Live IPC session with the lifecycle and administration services.
///
/// Owned by the event-loop thread; no other thread touches it.
pub trait IpcSession: Send {
    /// Register for lifecycle shutdown notifications.
    fn register_lifecycle(&mut self, mode: ShutdownMode) -> CollaboratorResult<()>;

    /// Unregister from lifecycle shutdown notifications.
    fn unregister_lifecycle(&mut self, mode: ShutdownMode) -> CollaboratorResult<()>;

    /// Register with the administration service.
    fn register_admin(&mut self) -> CollaboratorResult<()>;

    /// Unregister from the administration service.
    fn unregister_admin(&mut self) -> CollaboratorResult<()>;

    /// Report completion of a lifecycle shutdown request.
    fn complete_lifecycle(&mut self, request_id: u32, ok: bool) -> CollaboratorResult<()>;

    /// Report completion of an administration request.
    fn complete_admin(&mut self, request_id: u32, ok: bool) -> CollaboratorResult<()>;

    /// Close the session. Called once when the event loop exits.
    fn close(&mut self);
}

/// An opened IPC session plus its incoming event stream.
pub struct IpcLink {
    /// Session handle
    pub session: Box<dyn IpcSession>,
    /// External events; a closed stream is treated as "no more events"
    pub events: mpsc::UnboundedReceiver<IpcEvent>,
}

impl std::fmt::Debug for IpcLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcLink").finish_non_exhaustive()
    }
}

/// Opens IPC sessions. Called from the event-loop thread.
pub trait IpcConnector: Send + Sync {
    /// Open a session for the given application identity.
    fn connect(&self, app: &str) -> CollaboratorResult<IpcLink>;
}

/// Storage engine structures the controller sets up and releases.
pub trait StorageBackend: Send + Sync {
    /// Prepare the key handle registry.
    fn init_handle_registry(&self);

    /// Release the key and file handle trees.
    fn release_handle_trees(&self);

    /// Release the backup tree.
    fn release_backup_tree(&self);

    /// Release the change notification tree.
    fn release_notification_tree(&self);

    /// Block new storage operations (the pending-access gate).
    fn acquire_access_gate(&self);

    /// Let storage operations proceed again.
    fn release_access_gate(&self);

    /// Quiesce storage for a shutdown of the given scope.
    ///
    /// Called on the event-loop thread with the access gate held.
    fn prepare_shutdown(&self, scope: ShutdownScope) -> CollaboratorResult<()>;

    /// Write back cached data.
    fn flush(&self) -> CollaboratorResult<()>;
}

/// Completion callback handed to the plugin loader for plugins that
/// initialize asynchronously.
pub type AsyncInitCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// Loads the storage backend plugins.
pub trait PluginLoader: Send + Sync {
    /// Load all configured plugins.
    fn load_plugins(&self, on_async_init: AsyncInitCallback) -> CollaboratorResult<()>;
}

/// Loads the list of files excluded from backup creation.
pub trait BlacklistLoader: Send + Sync {
    /// Parse the blacklist file at `path`.
    fn load_blacklist(&self, path: &Path) -> CollaboratorResult<()>;
}

/// Optional file cache layer.
pub trait FileCache: Send + Sync {
    /// Initialize the cache for an application.
    fn init_cache(&self, app: &str) -> CollaboratorResult<()>;

    /// Tear the cache down.
    fn deinit_cache(&self) -> CollaboratorResult<()>;
}

/// The collaborators a session is built from.
#[derive(Clone)]
pub struct Collaborators {
    /// IPC session factory
    pub ipc: Arc<dyn IpcConnector>,
    /// Storage engine structures
    pub storage: Arc<dyn StorageBackend>,
    /// Plugin loader
    pub plugins: Arc<dyn PluginLoader>,
    /// Backup blacklist loader
    pub blacklist: Arc<dyn BlacklistLoader>,
    /// File cache, used when enabled in the configuration
    pub file_cache: Option<Arc<dyn FileCache>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("file_cache", &self.file_cache.is_some())
            .finish_non_exhaustive()
    }
}
