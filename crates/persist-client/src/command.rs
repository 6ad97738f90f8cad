//! Command channel to the event-loop thread.
//!
//! Foreground threads drive the event loop by moving [`Command`] values into
//! an unbounded channel. Delivery returns once the command is enqueued;
//! commands from one producer arrive in the order they were sent. Commands
//! that carry an [`Ack`] let the caller block until the event loop has
//! processed them.

use tokio::sync::{mpsc, oneshot};

use crate::negotiation::ShutdownMode;
use crate::{ClientError, CollaboratorResult, Result};

/// Shutdown preparation scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownScope {
    /// Unconditional shutdown issued by session teardown
    Full,
    /// Cancellable shutdown requested by the application
    Partial,
}

/// Who asked for a shutdown preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOrigin {
    /// The library itself (teardown or application negotiation)
    Internal,
    /// The lifecycle-management service; carries its request id
    Lifecycle(u32),
}

/// Acknowledgement slot filled by the event loop.
pub type Ack = oneshot::Sender<CollaboratorResult<()>>;

/// Message consumed by the event-loop thread.
#[derive(Debug)]
pub enum Command {
    /// Quiesce storage for shutdown.
    PrepareShutdown {
        /// Shutdown scope
        scope: ShutdownScope,
        /// Requester
        origin: ShutdownOrigin,
    },
    /// Re-open storage access after a cancelled shutdown.
    ReleaseAccessGate,
    /// Register for lifecycle notifications.
    RegisterLifecycle {
        /// Negotiated shutdown mode
        mode: ShutdownMode,
        /// Registration result
        ack: Ack,
    },
    /// Unregister from lifecycle notifications.
    UnregisterLifecycle {
        /// Mode used at registration
        mode: ShutdownMode,
        /// Unregistration result
        ack: Ack,
    },
    /// Register with the administration service.
    RegisterAdmin {
        /// Registration result
        ack: Ack,
    },
    /// Unregister from the administration service.
    UnregisterAdmin {
        /// Unregistration result
        ack: Ack,
    },
    /// Leave the event loop.
    Terminate,
}

impl Command {
    /// Short name for logging.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PrepareShutdown {
                scope: ShutdownScope::Full,
                ..
            } => "prepare-shutdown-full",
            Self::PrepareShutdown {
                scope: ShutdownScope::Partial,
                ..
            } => "prepare-shutdown-partial",
            Self::ReleaseAccessGate => "release-access-gate",
            Self::RegisterLifecycle { .. } => "register-lifecycle",
            Self::UnregisterLifecycle { .. } => "unregister-lifecycle",
            Self::RegisterAdmin { .. } => "register-admin",
            Self::UnregisterAdmin { .. } => "unregister-admin",
            Self::Terminate => "terminate",
        }
    }
}

/// Receiving end, owned by the event-loop thread.
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Sending end of the command channel.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

/// Create a command channel.
pub fn channel() -> (CommandSender, CommandReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandSender { tx }, rx)
}

impl CommandSender {
    /// Enqueue a command. Returns as soon as the command is queued.
    pub fn deliver(&self, command: Command) -> Result<()> {
        let name = command.name();
        self.tx.send(command).map_err(|_| {
            ClientError::IpcSetup(format!("event loop is not running, dropped {name}"))
        })?;
        tracing::trace!("Delivered {name} to event loop");
        Ok(())
    }

    /// Enqueue a command and block until the event loop acknowledges it.
    ///
    /// The outer result reports channel failures, the inner one the
    /// collaborator's answer. Must not be called from inside an async
    /// runtime.
    pub fn request<F>(&self, build: F) -> Result<CollaboratorResult<()>>
    where
        F: FnOnce(Ack) -> Command,
    {
        let (ack, reply) = oneshot::channel();
        self.deliver(build(ack))?;
        reply.blocking_recv().map_err(|_| {
            ClientError::IpcSetup("event loop exited without acknowledging".to_string())
        })
    }

    /// Whether the event loop has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
