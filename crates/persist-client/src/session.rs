//! Reference-counted session controller.
//!
//! Every application thread, plugin or shared library that uses the
//! persistence client calls [`PersistenceClient::init`] and
//! [`PersistenceClient::deinit`] in pairs. The controller folds all of them
//! into one logical session: the first `init` sets everything up, the last
//! matching `deinit` tears it down, all calls in between only move the
//! counter.
//!
//! Three locks are involved, always taken in this order:
//!
//! 1. the init lock (`state`), held across a whole `init`/`deinit` call
//!    including blocking setup and teardown;
//! 2. the registration lock (`active`), held across the critical
//!    initialization region and the teardown region, and briefly by
//!    negotiation calls;
//! 3. the stale event-loop slot (`stale`);
//! 4. the cancel budget lock (`budget`).
//!
//! The trust gate sits behind its own leaf lock that is never held across
//! a blocking call.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::artifact;
use crate::collab::{AsyncInitCallback, Collaborators, FileCache};
use crate::command::{Command, CommandSender, ShutdownOrigin, ShutdownScope};
use crate::config::ClientConfig;
use crate::event_loop::{EventLoop, JoinOutcome};
use crate::negotiation::{CancelBudget, LifecycleRequest, Phase, ShutdownMode};
use crate::trust::TrustGate;
use crate::{ClientError, Result};

/// Application identity, bounded to the configured maximum length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppIdentity(String);

impl AppIdentity {
    /// Build an identity from `app`, keeping at most `max_len - 1` bytes.
    ///
    /// The length includes one slot for the terminator used by C consumers
    /// of the identity. Truncation never splits a character.
    pub fn new(app: &str, max_len: usize) -> Self {
        let mut end = app.len().min(max_len.saturating_sub(1));
        while !app.is_char_boundary(end) {
            end -= 1;
        }
        Self(app[..end].to_string())
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AppIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counter state guarded by the init lock.
#[derive(Debug)]
struct SessionState {
    init_count: u32,
    app_identity: Option<AppIdentity>,
    shutdown_mode: ShutdownMode,
}

/// Resources of an initialized session, guarded by the registration lock.
#[derive(Debug)]
struct ActiveSession {
    identity: AppIdentity,
    mode: ShutdownMode,
    admin: bool,
    event_loop: EventLoop,
}

/// Event loop that outlived its join timeout.
#[derive(Debug)]
struct StaleLoop {
    event_loop: EventLoop,
    /// Handle registries are released once the loop is gone
    owns_trees: bool,
}

/// Session controller of the persistence client library.
///
/// Create one per process and share it (for example behind an `Arc` or a
/// `static`); all methods take `&self`.
///
/// `init`, `deinit` and the negotiation calls block, so they must not be
/// called from inside an async runtime.
pub struct PersistenceClient {
    config: ClientConfig,
    collaborators: Collaborators,
    state: Mutex<SessionState>,
    active: Mutex<Option<ActiveSession>>,
    stale: Mutex<Option<StaleLoop>>,
    budget: Mutex<CancelBudget>,
    trust: Mutex<Option<Arc<TrustGate>>>,
}

impl std::fmt::Debug for PersistenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceClient")
            .field("config", &self.config)
            .field("collaborators", &self.collaborators)
            .finish_non_exhaustive()
    }
}

impl PersistenceClient {
    /// Create an uninitialized controller.
    pub fn new(config: ClientConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let budget = CancelBudget::new(config.max_cancel);
        Ok(Self {
            config,
            collaborators,
            state: Mutex::new(SessionState {
                init_count: 0,
                app_identity: None,
                shutdown_mode: ShutdownMode::None,
            }),
            active: Mutex::new(None),
            stale: Mutex::new(None),
            budget: Mutex::new(budget),
            trust: Mutex::new(None),
        })
    }

    /// Configuration in use.
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Initialize the library for `app`.
    ///
    /// The first call of a session reclaims stale shared memory artifacts
    /// and performs the full initialization. A failure leaves the session
    /// uninitialized, so the next call starts over. Later calls only count.
    ///
    /// If the event loop of the previous session missed its join timeout,
    /// the first call joins it before anything else and fails with
    /// [`ClientError::IpcSetup`] while it is still running.
    pub fn init(&self, app: &str, mode: ShutdownMode) -> Result<()> {
        let mut state = self.state.lock();

        if state.init_count == 0 {
            info!("Init library - app: {app}, mode: {mode:?}, init counter: 0");

            self.reap_stale_loop()?;
            artifact::reclaim(&self.config.shm_dir, app);

            let identity = self.private_init(app, mode)?;
            state.app_identity = Some(identity);
            state.shutdown_mode = mode;
        } else {
            if mode != state.shutdown_mode {
                debug!(
                    "Ignoring shutdown mode {mode:?}, session uses {:?}",
                    state.shutdown_mode
                );
            }
            info!(
                "Init library - app: {}, only increment init counter: {}",
                display_identity(state.app_identity.as_ref()),
                state.init_count
            );
        }

        // Only after initialization finished, so no thread sees a count
        // above zero for a half-built session.
        state.init_count += 1;
        Ok(())
    }

    /// Deinitialize the library.
    ///
    /// The call matching the first `init` tears the session down and blocks
    /// until the event-loop thread has been joined. Teardown is best effort:
    /// failing steps are logged and the remaining steps still run.
    pub fn deinit(&self) -> Result<()> {
        let mut state = self.state.lock();

        match state.init_count {
            0 => {
                warn!("Deinit library - not initialized");
                Err(ClientError::NotInitialized)
            }
            1 => {
                info!(
                    "Deinit library - app: {}, init counter: 1",
                    display_identity(state.app_identity.as_ref())
                );
                self.private_deinit();
                state.init_count = 0;
                state.app_identity = None;
                state.shutdown_mode = ShutdownMode::None;
                Ok(())
            }
            count => {
                info!(
                    "Deinit library - app: {}, only decrement init counter: {count}",
                    display_identity(state.app_identity.as_ref())
                );
                state.init_count -= 1;
                Ok(())
            }
        }
    }

    /// Drive the shutdown negotiation.
    pub fn set_lifecycle(&self, request: LifecycleRequest) -> Result<()> {
        self.negotiate(|| Ok(request))
    }

    /// Drive the shutdown negotiation with a raw request value
    /// (1 = shutdown, 0 = cancel).
    pub fn set_lifecycle_raw(&self, request: u32) -> Result<()> {
        self.negotiate(|| LifecycleRequest::try_from(request))
    }

    /// Number of unmatched `init` calls.
    pub fn init_count(&self) -> u32 {
        self.state.lock().init_count
    }

    /// Identity of the current session.
    pub fn app_identity(&self) -> Option<AppIdentity> {
        self.state.lock().app_identity.clone()
    }

    /// Shutdown mode of the current session.
    pub fn shutdown_mode(&self) -> Option<ShutdownMode> {
        let state = self.state.lock();
        (state.init_count > 0).then_some(state.shutdown_mode)
    }

    /// Trust of the calling application; `None` without a session or when
    /// the application check is disabled.
    pub fn is_trusted(&self) -> Option<bool> {
        let gate = self.trust.lock().clone();
        gate.map(|gate| gate.is_trusted())
    }

    /// Current negotiation phase.
    pub fn negotiation_phase(&self) -> Phase {
        self.budget.lock().phase()
    }

    /// Shutdown cancellations granted in the current session.
    pub fn cancels_used(&self) -> u32 {
        self.budget.lock().cancels()
    }

    fn negotiate<F>(&self, request: F) -> Result<()>
    where
        F: FnOnce() -> Result<LifecycleRequest>,
    {
        let active = self.active.lock();
        let Some(session) = active.as_ref() else {
            warn!("Lifecycle set - not initialized");
            return Err(ClientError::NotInitialized);
        };

        if session.mode == ShutdownMode::None {
            warn!(
                "Lifecycle set - not allowed for {}, no shutdown mode registered",
                session.identity
            );
            return Err(ClientError::ShutdownNotPermitted);
        }

        let request = request()?;
        info!("Lifecycle set - {request:?} - {}", session.identity);

        self.budget
            .lock()
            .apply(request, session.event_loop.commands())
    }

    fn file_cache(&self) -> Option<&Arc<dyn FileCache>> {
        if self.config.file_cache {
            self.collaborators.file_cache.as_ref()
        } else {
            None
        }
    }

    fn private_init(&self, app: &str, mode: ShutdownMode) -> Result<AppIdentity> {
        // Registration lock: no teardown can finish while this runs.
        let mut active = self.active.lock();

        let trust = self.config.app_check.as_ref().map(|config| {
            let gate = TrustGate::new(config, app);
            gate.evaluate();
            Arc::new(gate)
        });

        if let Some(cache) = self.file_cache() {
            info!("Using the file cache");
            if let Err(e) = cache.init_cache(app) {
                warn!("File cache init failed: {e}");
            }
        }

        let blacklist = self.config.blacklist_path(app);
        if let Err(e) = self.collaborators.blacklist.load_blacklist(&blacklist) {
            info!("Init library - err access blacklist {}: {e}", blacklist.display());
        }

        let event_loop = match EventLoop::spawn(
            app,
            Arc::clone(&self.collaborators.ipc),
            Arc::clone(&self.collaborators.storage),
        ) {
            Ok(event_loop) => event_loop,
            Err(e) => {
                error!("Init library - failed to set up event loop: {e}");
                self.deinit_file_cache();
                return Err(e);
            }
        };

        let mut registered = Registrations::default();
        if let Err(e) = self.register(event_loop.commands(), mode, &mut registered) {
            self.rollback(event_loop, registered);
            return Err(e);
        }

        let on_async_init: AsyncInitCallback =
            Arc::new(|status: i32| debug!("Plugin async init finished: {status}"));
        if let Err(e) = self.collaborators.plugins.load_plugins(on_async_init) {
            warn!("Failed to load custom plugins: {e}");
            self.rollback(event_loop, registered);
            return Err(ClientError::PluginLoad(e.to_string()));
        }

        let storage = &self.collaborators.storage;
        storage.init_handle_registry();
        storage.release_access_gate();

        let identity = AppIdentity::new(app, self.config.max_app_id_len);
        *active = Some(ActiveSession {
            identity: identity.clone(),
            mode,
            admin: registered.admin,
            event_loop,
        });
        *self.trust.lock() = trust;
        Ok(identity)
    }

    fn register(
        &self,
        commands: &CommandSender,
        mode: ShutdownMode,
        registered: &mut Registrations,
    ) -> Result<()> {
        if mode != ShutdownMode::None {
            commands
                .request(|ack| Command::RegisterLifecycle { mode, ack })
                .and_then(|reply| reply.map_err(|e| ClientError::RegisterLifecycle(e.to_string())))
                .map_err(|e| {
                    error!("Init library - failed to register for lifecycle: {e}");
                    match e {
                        ClientError::RegisterLifecycle(_) => e,
                        other => ClientError::RegisterLifecycle(other.to_string()),
                    }
                })?;
            registered.lifecycle = Some(mode);
        }

        if self.config.admin_interface {
            info!("Admin interface is enabled");
            commands
                .request(|ack| Command::RegisterAdmin { ack })
                .and_then(|reply| reply.map_err(|e| ClientError::RegisterAdmin(e.to_string())))
                .map_err(|e| {
                    error!("Init library - failed to register with admin service: {e}");
                    match e {
                        ClientError::RegisterAdmin(_) => e,
                        other => ClientError::RegisterAdmin(other.to_string()),
                    }
                })?;
            registered.admin = true;
            info!("Init library - registered with admin service");
        }

        Ok(())
    }

    fn unregister(commands: &CommandSender, registered: Registrations) {
        if let Some(mode) = registered.lifecycle {
            match commands.request(|ack| Command::UnregisterLifecycle { mode, ack }) {
                Ok(Ok(())) => debug!("Unregistered from lifecycle service"),
                Ok(Err(e)) => error!("Failed to unregister from lifecycle service: {e}"),
                Err(e) => error!("Failed to unregister from lifecycle service: {e}"),
            }
        }

        if registered.admin {
            match commands.request(|ack| Command::UnregisterAdmin { ack }) {
                Ok(Ok(())) => info!("Unregistered from admin service"),
                Ok(Err(e)) => error!("Failed to unregister from admin service: {e}"),
                Err(e) => error!("Failed to unregister from admin service: {e}"),
            }
        }
    }

    /// Undo a partially completed initialization.
    fn rollback(&self, event_loop: EventLoop, registered: Registrations) {
        Self::unregister(event_loop.commands(), registered);
        if let Err(e) = event_loop.commands().deliver(Command::Terminate) {
            error!("Init rollback - failed to terminate event loop: {e}");
        }
        self.finish_join(event_loop, false);
        self.deinit_file_cache();
    }

    fn private_deinit(&self) {
        let mut active = self.active.lock();
        let Some(session) = active.take() else {
            warn!("Deinit library - no active session");
            return;
        };
        self.trust.lock().take();
        let ActiveSession {
            mode,
            admin,
            event_loop,
            ..
        } = session;
        let commands = event_loop.commands().clone();

        let registered = Registrations {
            lifecycle: (mode != ShutdownMode::None).then_some(mode),
            admin,
        };
        Self::unregister(&commands, registered);

        if let Err(e) = commands.deliver(Command::PrepareShutdown {
            scope: ShutdownScope::Full,
            origin: ShutdownOrigin::Internal,
        }) {
            error!("Deinit library - failed to send full shutdown: {e}");
        }
        if let Err(e) = commands.deliver(Command::Terminate) {
            error!("Deinit library - failed to send terminate: {e}");
        }
        self.finish_join(event_loop, true);

        drop(active);
        self.budget.lock().reset();

        self.deinit_file_cache();
    }

    /// Join `event_loop`, or park it in the stale slot if it misses the
    /// timeout. With `owns_trees` the handle registries are released once
    /// the thread is gone.
    fn finish_join(&self, event_loop: EventLoop, owns_trees: bool) {
        match event_loop.join(self.config.join_timeout()) {
            JoinOutcome::TimedOut(event_loop) => {
                error!("Event loop still running after teardown, deferring its join");
                *self.stale.lock() = Some(StaleLoop {
                    event_loop,
                    owns_trees,
                });
            }
            outcome => {
                log_join(&outcome);
                if owns_trees {
                    self.release_trees();
                }
            }
        }
    }

    /// Join an event loop left over from a previous session.
    fn reap_stale_loop(&self) -> Result<()> {
        let mut stale = self.stale.lock();
        let Some(StaleLoop {
            event_loop,
            owns_trees,
        }) = stale.take()
        else {
            return Ok(());
        };

        info!("Joining event loop of the previous session");
        match event_loop.join(self.config.join_timeout()) {
            JoinOutcome::TimedOut(event_loop) => {
                *stale = Some(StaleLoop {
                    event_loop,
                    owns_trees,
                });
                Err(ClientError::IpcSetup(
                    "event loop of the previous session is still running".to_string(),
                ))
            }
            outcome => {
                log_join(&outcome);
                if owns_trees {
                    self.release_trees();
                }
                Ok(())
            }
        }
    }

    fn release_trees(&self) {
        let storage = &self.collaborators.storage;
        storage.release_handle_trees();
        storage.release_backup_tree();
        storage.release_notification_tree();
    }

    fn deinit_file_cache(&self) {
        if let Some(cache) = self.file_cache()
            && let Err(e) = cache.deinit_cache()
        {
            warn!("File cache deinit failed: {e}");
        }
    }
}

impl Drop for PersistenceClient {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.init_count > 0 {
            warn!(
                "Controller dropped with {} outstanding init calls, tearing down",
                state.init_count
            );
            state.init_count = 0;
            self.private_deinit();
        }
        if let Err(e) = self.reap_stale_loop() {
            error!("Controller dropped, detaching event loop: {e}");
        }
    }
}

/// Services the session registered with.
#[derive(Debug, Default, Clone, Copy)]
struct Registrations {
    lifecycle: Option<ShutdownMode>,
    admin: bool,
}

fn log_join(outcome: &JoinOutcome) {
    match outcome {
        JoinOutcome::Joined => debug!("Event loop joined"),
        JoinOutcome::Panicked => error!("Event loop ended with a panic"),
        JoinOutcome::TimedOut(_) => warn!("Event loop still running"),
    }
}

fn display_identity(identity: Option<&AppIdentity>) -> &str {
    identity.map_or("<none>", AppIdentity::as_str)
}
