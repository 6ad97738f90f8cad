//! Background event-loop thread.
//!
//! One dedicated OS thread owns the IPC session with the lifecycle and
//! administration services. It runs a single-threaded tokio runtime and
//! waits on two sources at once: the [command channel](crate::command) fed
//! by foreground threads, and the event stream of the IPC session. Each
//! item is processed to completion before the next one is taken.
//! [`Command::Terminate`] ends the loop.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, info_span, warn};

use crate::collab::{AdminAction, IpcConnector, IpcEvent, IpcLink, IpcSession, StorageBackend};
use crate::command::{self, Command, CommandReceiver, CommandSender, ShutdownOrigin, ShutdownScope};
use crate::{ClientError, CollaboratorError, CollaboratorResult, Result};

/// Name of the event-loop thread.
pub const THREAD_NAME: &str = "pcl-mainloop";

/// How a join attempt ended.
#[derive(Debug)]
pub enum JoinOutcome {
    /// The thread finished and was joined
    Joined,
    /// The thread panicked; it has been joined
    Panicked,
    /// The thread did not finish in time; the handle is returned so the
    /// caller can join it later
    TimedOut(EventLoop),
}


/// Set once the event-loop thread is about to finish.
#[derive(Debug, Default)]
struct ExitSignal {
    done: Mutex<bool>,
    cond: Condvar,
}

impl ExitSignal {
    fn notify(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }

    /// Wait until the thread signalled exit. Returns `false` on timeout.
    fn wait(&self, timeout: Duration) -> bool {
        let mut done = self.done.lock();
        let _ = self
            .cond
            .wait_while_for(&mut done, |done| !*done, timeout);
        *done
    }
}

/// Signals exit when dropped, including on unwind.
struct ExitGuard(Arc<ExitSignal>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.notify();
    }
}

/// Handle to the running event-loop thread.
#[derive(Debug)]
pub struct EventLoop {
    commands: CommandSender,
    handle: JoinHandle<()>,
    exited: Arc<ExitSignal>,
}

impl EventLoop {
    /// Start the event-loop thread and wait until its IPC session is open.
    ///
    /// Fails with [`ClientError::IpcSetup`] if the thread cannot be spawned,
    /// the runtime cannot be built or the connector refuses the session.
    /// On failure the thread has already been joined.
    pub fn spawn(
        app: &str,
        connector: Arc<dyn IpcConnector>,
        storage: Arc<dyn StorageBackend>,
    ) -> Result<Self> {
        let (commands, receiver) = command::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let exited = Arc::new(ExitSignal::default());

        let app_name = app.to_string();
        let thread_exited = Arc::clone(&exited);
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let _guard = ExitGuard(thread_exited);
                run(&app_name, connector.as_ref(), storage.as_ref(), receiver, ready_tx);
            })
            .map_err(|e| ClientError::IpcSetup(format!("failed to spawn event loop: {e}")))?;

        match ready_rx.blocking_recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                handle,
                exited,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(ClientError::IpcSetup(e.to_string()))
            }
            Err(_) => {
                let _ = handle.join();
                Err(ClientError::IpcSetup(
                    "event loop exited during setup".to_string(),
                ))
            }
        }
    }

    /// Sender for commands to this loop.
    pub const fn commands(&self) -> &CommandSender {
        &self.commands
    }

    /// Join the thread.
    ///
    /// With a timeout the call waits at most that long for the loop to
    /// finish; a thread still running after that is handed back in
    /// [`JoinOutcome::TimedOut`]. Without a timeout the call blocks until
    /// the thread exits. Consumes the handle, so a thread is joined at most
    /// once.
    pub fn join(self, timeout: Option<Duration>) -> JoinOutcome {
        if let Some(timeout) = timeout
            && !self.exited.wait(timeout)
        {
            warn!(
                "Event loop did not finish within {}ms",
                timeout.as_millis()
            );
            return JoinOutcome::TimedOut(self);
        }

        match self.handle.join() {
            Ok(()) => JoinOutcome::Joined,
            Err(_) => {
                error!("Event loop thread panicked");
                JoinOutcome::Panicked
            }
        }
    }
}

/// Thread body.
fn run(
    app: &str,
    connector: &dyn IpcConnector,
    storage: &dyn StorageBackend,
    mut commands: CommandReceiver,
    ready: oneshot::Sender<CollaboratorResult<()>>,
) {
    let span = info_span!("pcl_event_loop", app = %app);
    let _enter = span.enter();

    let runtime = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build event loop runtime: {e}");
            let _ = ready.send(Err(CollaboratorError::Io(e)));
            return;
        }
    };

    let IpcLink {
        mut session,
        mut events,
    } = match connector.connect(app) {
        Ok(link) => link,
        Err(e) => {
            error!("Failed to open IPC session: {e}");
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        warn!("Spawner went away before the event loop was ready");
    }
    info!("Event loop running");

    runtime.block_on(dispatch(
        &mut *session,
        storage,
        &mut commands,
        &mut events,
    ));

    session.close();
    info!("Event loop terminated");
}

async fn dispatch(
    session: &mut dyn IpcSession,
    storage: &dyn StorageBackend,
    commands: &mut CommandReceiver,
    events: &mut mpsc::UnboundedReceiver<IpcEvent>,
) {
    let mut events_open = true;

    loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::Terminate) => {
                    debug!("Received terminate");
                    break;
                }
                Some(command) => handle_command(session, storage, command),
                None => {
                    warn!("Command channel closed without terminate");
                    break;
                }
            },

            event = events.recv(), if events_open => match event {
                Some(event) => handle_event(session, storage, event),
                None => {
                    debug!("IPC event stream closed");
                    events_open = false;
                }
            },
        }
    }
}

fn handle_command(session: &mut dyn IpcSession, storage: &dyn StorageBackend, command: Command) {
    debug!("Processing {}", command.name());

    match command {
        Command::PrepareShutdown { scope, origin } => {
            prepare_shutdown(session, storage, scope, origin);
        }
        Command::ReleaseAccessGate => storage.release_access_gate(),
        Command::RegisterLifecycle { mode, ack } => {
            reply(ack, "register lifecycle", session.register_lifecycle(mode));
        }
        Command::UnregisterLifecycle { mode, ack } => {
            reply(ack, "unregister lifecycle", session.unregister_lifecycle(mode));
        }
        Command::RegisterAdmin { ack } => {
            reply(ack, "register admin", session.register_admin());
        }
        Command::UnregisterAdmin { ack } => {
            reply(ack, "unregister admin", session.unregister_admin());
        }
        // Handled by the dispatcher.
        Command::Terminate => {}
    }
}

fn reply(ack: command::Ack, what: &str, result: CollaboratorResult<()>) {
    if let Err(e) = &result {
        warn!("{what} failed: {e}");
    }
    if ack.send(result).is_err() {
        debug!("{what}: requester no longer waiting");
    }
}

fn handle_event(session: &mut dyn IpcSession, storage: &dyn StorageBackend, event: IpcEvent) {
    match event {
        IpcEvent::LifecycleShutdown { request_id, scope } => {
            info!("Lifecycle shutdown request {request_id} ({scope:?})");
            prepare_shutdown(session, storage, scope, ShutdownOrigin::Lifecycle(request_id));
        }
        IpcEvent::Admin { request_id, action } => {
            info!("Admin request {request_id}: {action:?}");
            let result = match action {
                AdminAction::Block => {
                    storage.acquire_access_gate();
                    storage.flush()
                }
                AdminAction::WriteBack => storage.flush(),
                AdminAction::Unblock => {
                    storage.release_access_gate();
                    Ok(())
                }
            };
            if let Err(e) = &result {
                warn!("Admin request {request_id} failed: {e}");
            }
            if let Err(e) = session.complete_admin(request_id, result.is_ok()) {
                warn!("Failed to confirm admin request {request_id}: {e}");
            }
        }
    }
}

fn prepare_shutdown(
    session: &mut dyn IpcSession,
    storage: &dyn StorageBackend,
    scope: ShutdownScope,
    origin: ShutdownOrigin,
) {
    storage.acquire_access_gate();
    let result = storage.prepare_shutdown(scope);
    if let Err(e) = &result {
        warn!("Shutdown preparation ({scope:?}) failed: {e}");
    }

    if let ShutdownOrigin::Lifecycle(request_id) = origin
        && let Err(e) = session.complete_lifecycle(request_id, result.is_ok())
    {
        warn!("Failed to confirm lifecycle request {request_id}: {e}");
    }
}
