//! Shutdown negotiation between the application and the library.
//!
//! An application that registered with a lifecycle shutdown mode may ask
//! the library to start quiescing storage ([`LifecycleRequest::Shutdown`])
//! and may call that back ([`LifecycleRequest::ShutdownCancel`]) a bounded
//! number of times per session.

use tracing::{info, warn};

use crate::command::{Command, CommandSender, ShutdownOrigin, ShutdownScope};
use crate::{ClientError, Result};

/// Shutdown mode negotiated at the first `init` of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownMode {
    /// No lifecycle participation; negotiation is disabled
    None,
    /// Normal (slow) shutdown notifications
    Slow,
    /// Fast shutdown notifications
    Fast,
}

impl ShutdownMode {
    /// Flag value used on the lifecycle bus.
    pub const fn flag(self) -> u32 {
        match self {
            Self::Slow => 1,
            Self::Fast => 2,
            Self::None => 4,
        }
    }
}

impl TryFrom<u32> for ShutdownMode {
    type Error = ClientError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Slow),
            2 => Ok(Self::Fast),
            4 => Ok(Self::None),
            other => Err(ClientError::Config(format!("unknown shutdown mode {other}"))),
        }
    }
}

/// Request accepted by the negotiation entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleRequest {
    /// Start a cancellable shutdown
    Shutdown,
    /// Cancel a requested shutdown
    ShutdownCancel,
}

impl TryFrom<u32> for LifecycleRequest {
    type Error = ClientError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(Self::Shutdown),
            0 => Ok(Self::ShutdownCancel),
            other => Err(ClientError::Negotiation(format!(
                "unknown lifecycle request {other}"
            ))),
        }
    }
}

/// Negotiation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No shutdown requested
    Idle,
    /// A partial shutdown was requested and not yet cancelled
    ShutdownRequested,
}

/// Per-session cancel budget and negotiation phase.
///
/// Lives behind its own lock so shutdown signalling never waits on a slow
/// `init` or `deinit`. Reset only when the session is torn down.
#[derive(Debug, Clone)]
pub struct CancelBudget {
    cancels: u32,
    max_cancel: u32,
    phase: Phase,
}

impl CancelBudget {
    /// Fresh budget allowing `max_cancel` cancellations.
    pub const fn new(max_cancel: u32) -> Self {
        Self {
            cancels: 0,
            max_cancel,
            phase: Phase::Idle,
        }
    }

    /// Cancellations granted so far in this session.
    pub const fn cancels(&self) -> u32 {
        self.cancels
    }

    /// Current phase.
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether further cancellations will be refused.
    pub const fn is_exhausted(&self) -> bool {
        self.cancels >= self.max_cancel
    }

    /// Forget all cancellations and return to `Idle`.
    pub fn reset(&mut self) {
        self.cancels = 0;
        self.phase = Phase::Idle;
    }

    /// Dispatch a request.
    pub fn apply(&mut self, request: LifecycleRequest, commands: &CommandSender) -> Result<()> {
        match request {
            LifecycleRequest::Shutdown => self.request_shutdown(commands),
            LifecycleRequest::ShutdownCancel => self.cancel_shutdown(commands),
        }
    }

    /// Ask the event loop to quiesce storage with a partial shutdown.
    pub fn request_shutdown(&mut self, commands: &CommandSender) -> Result<()> {
        if self.phase == Phase::ShutdownRequested {
            return Err(ClientError::Negotiation(
                "shutdown already requested".to_string(),
            ));
        }

        commands.deliver(Command::PrepareShutdown {
            scope: ShutdownScope::Partial,
            origin: ShutdownOrigin::Internal,
        })?;
        self.phase = Phase::ShutdownRequested;
        info!("Shutdown requested, cancels used {}/{}", self.cancels, self.max_cancel);
        Ok(())
    }

    /// Re-open storage access after a requested shutdown.
    ///
    /// The gate is released on the event loop, after any partial shutdown
    /// queued before it. Only cancellations of an actually requested
    /// shutdown count against the budget. Once the budget is used up the
    /// gate stays held.
    pub fn cancel_shutdown(&mut self, commands: &CommandSender) -> Result<()> {
        if self.is_exhausted() {
            warn!(
                "Shutdown cancel refused, budget of {} exhausted",
                self.max_cancel
            );
            return Err(ClientError::ShutdownMaxCancelExceeded);
        }

        commands.deliver(Command::ReleaseAccessGate)?;
        if self.phase == Phase::ShutdownRequested {
            self.cancels += 1;
            self.phase = Phase::Idle;
        }
        info!("Shutdown cancelled, cancels used {}/{}", self.cancels, self.max_cancel);
        Ok(())
    }
}
