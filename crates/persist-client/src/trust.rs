//! Application trust check.
//!
//! An application is trusted when its resource configuration table has
//! been provisioned. The answer is cached for the session; an untrusted
//! answer is re-checked on the next query so a table installed later is
//! picked up, a trusted answer is final.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::info;

use crate::config::TrustConfig;

/// Cached trust state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    /// Not evaluated yet
    Unknown,
    /// Resource configuration table present
    Trusted,
    /// Resource configuration table missing
    Untrusted,
}

impl TrustState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Trusted => 1,
            Self::Untrusted => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Trusted,
            2 => Self::Untrusted,
            _ => Self::Unknown,
        }
    }
}

/// Trust gate for one application identity.
///
/// Concurrent evaluations race benignly: every writer derives the same
/// value from the same filesystem state.
#[derive(Debug)]
pub struct TrustGate {
    rct_path: PathBuf,
    state: AtomicU8,
}

impl TrustGate {
    /// Create an unevaluated gate for `app`.
    pub fn new(config: &TrustConfig, app: &str) -> Self {
        Self {
            rct_path: config.rct_path(app),
            state: AtomicU8::new(TrustState::Unknown.as_u8()),
        }
    }

    /// Path whose existence makes the application trusted.
    pub fn rct_path(&self) -> &Path {
        &self.rct_path
    }

    /// Cached state without touching the filesystem.
    pub fn state(&self) -> TrustState {
        TrustState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Check the filesystem and cache the result.
    pub fn evaluate(&self) -> TrustState {
        let state = if self.rct_path.exists() {
            TrustState::Trusted
        } else {
            TrustState::Untrusted
        };
        self.state.store(state.as_u8(), Ordering::Release);
        info!(
            "App check: {} -> {}",
            self.rct_path.display(),
            if state == TrustState::Trusted {
                "trusted app"
            } else {
                "NOT trusted app"
            }
        );
        state
    }

    /// Whether the application is trusted, re-checking unless already pinned.
    pub fn is_trusted(&self) -> bool {
        if self.state() == TrustState::Trusted {
            return true;
        }
        self.evaluate() == TrustState::Trusted
    }
}
