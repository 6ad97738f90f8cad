//! Recording collaborators shared by the integration tests.
//!
//! Every collaborator appends to one ordered call log so tests can assert
//! on the exact sequence of setup and teardown steps.

#![allow(dead_code)]
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use persist_client::{
    AsyncInitCallback, BlacklistLoader, ClientConfig, CollaboratorError, CollaboratorResult,
    Collaborators, FileCache, IpcConnector, IpcEvent, IpcLink, IpcSession, PersistenceClient,
    PluginLoader, ShutdownMode, ShutdownScope, StorageBackend,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Ordered log of collaborator calls.
#[derive(Debug, Default)]
pub struct CallLog {
    entries: Mutex<Vec<String>>,
}

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Failure switches shared between the connector and its sessions.
#[derive(Debug, Default)]
pub struct Faults {
    pub connect: AtomicBool,
    pub register_lifecycle: AtomicBool,
    pub register_admin: AtomicBool,
    pub unregister_lifecycle: AtomicBool,
    pub load_plugins: AtomicBool,
}

impl Faults {
    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, what: &str) -> CollaboratorResult<()> {
        if flag.load(Ordering::SeqCst) {
            Err(CollaboratorError::failed(format!("{what} refused")))
        } else {
            Ok(())
        }
    }
}

/// Number of IPC sessions open at once.
#[derive(Debug, Default)]
pub struct SessionGauge {
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl SessionGauge {
    fn open(&self) {
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
    }

    fn close(&self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct MockSession {
    log: Arc<CallLog>,
    faults: Arc<Faults>,
    gauge: Arc<SessionGauge>,
}

impl IpcSession for MockSession {
    fn register_lifecycle(&mut self, mode: ShutdownMode) -> CollaboratorResult<()> {
        self.log.push(format!("register_lifecycle:{mode:?}"));
        Faults::check(&self.faults.register_lifecycle, "lifecycle registration")
    }

    fn unregister_lifecycle(&mut self, mode: ShutdownMode) -> CollaboratorResult<()> {
        self.log.push(format!("unregister_lifecycle:{mode:?}"));
        Faults::check(&self.faults.unregister_lifecycle, "lifecycle unregistration")
    }

    fn register_admin(&mut self) -> CollaboratorResult<()> {
        self.log.push("register_admin");
        Faults::check(&self.faults.register_admin, "admin registration")
    }

    fn unregister_admin(&mut self) -> CollaboratorResult<()> {
        self.log.push("unregister_admin");
        Ok(())
    }

    fn complete_lifecycle(&mut self, request_id: u32, ok: bool) -> CollaboratorResult<()> {
        self.log.push(format!("complete_lifecycle:{request_id}:{ok}"));
        Ok(())
    }

    fn complete_admin(&mut self, request_id: u32, ok: bool) -> CollaboratorResult<()> {
        self.log.push(format!("complete_admin:{request_id}:{ok}"));
        Ok(())
    }

    fn close(&mut self) {
        self.log.push("close");
        self.gauge.close();
    }
}

pub struct MockIpc {
    log: Arc<CallLog>,
    faults: Arc<Faults>,
    pub gauge: Arc<SessionGauge>,
    events: Mutex<Option<mpsc::UnboundedSender<IpcEvent>>>,
}

impl MockIpc {
    /// Inject an event as if it came from an external service.
    pub fn send_event(&self, event: IpcEvent) {
        self.events
            .lock()
            .as_ref()
            .expect("no open IPC session")
            .send(event)
            .expect("event loop gone");
    }
}

impl IpcConnector for MockIpc {
    fn connect(&self, app: &str) -> CollaboratorResult<IpcLink> {
        self.log.push(format!("connect:{app}"));
        Faults::check(&self.faults.connect, "connect")?;

        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock() = Some(tx);
        self.gauge.open();
        Ok(IpcLink {
            session: Box::new(MockSession {
                log: Arc::clone(&self.log),
                faults: Arc::clone(&self.faults),
                gauge: Arc::clone(&self.gauge),
            }),
            events: rx,
        })
    }
}

pub struct MockStorage {
    log: Arc<CallLog>,
    full_shutdown_delay: Mutex<Option<Duration>>,
}

impl MockStorage {
    /// Make every full shutdown preparation take `delay`.
    pub fn delay_full_shutdown(&self, delay: Duration) {
        *self.full_shutdown_delay.lock() = Some(delay);
    }
}

impl StorageBackend for MockStorage {
    fn init_handle_registry(&self) {
        self.log.push("init_handle_registry");
    }

    fn release_handle_trees(&self) {
        self.log.push("release_handle_trees");
    }

    fn release_backup_tree(&self) {
        self.log.push("release_backup_tree");
    }

    fn release_notification_tree(&self) {
        self.log.push("release_notification_tree");
    }

    fn acquire_access_gate(&self) {
        self.log.push("gate_acquire");
    }

    fn release_access_gate(&self) {
        self.log.push("gate_release");
    }

    fn prepare_shutdown(&self, scope: ShutdownScope) -> CollaboratorResult<()> {
        let delay = *self.full_shutdown_delay.lock();
        if scope == ShutdownScope::Full
            && let Some(delay) = delay
        {
            std::thread::sleep(delay);
        }
        self.log.push(format!("prepare_shutdown:{scope:?}"));
        Ok(())
    }

    fn flush(&self) -> CollaboratorResult<()> {
        self.log.push("flush");
        Ok(())
    }
}

pub struct MockPlugins {
    log: Arc<CallLog>,
    faults: Arc<Faults>,
}

impl PluginLoader for MockPlugins {
    fn load_plugins(&self, on_async_init: AsyncInitCallback) -> CollaboratorResult<()> {
        self.log.push("load_plugins");
        Faults::check(&self.faults.load_plugins, "plugin load")?;
        on_async_init(0);
        Ok(())
    }
}

pub struct MockBlacklist {
    log: Arc<CallLog>,
    last_path: Mutex<Option<PathBuf>>,
}

impl MockBlacklist {
    pub fn last_path(&self) -> Option<PathBuf> {
        self.last_path.lock().clone()
    }
}

impl BlacklistLoader for MockBlacklist {
    fn load_blacklist(&self, path: &Path) -> CollaboratorResult<()> {
        self.log.push("load_blacklist");
        *self.last_path.lock() = Some(path.to_path_buf());
        std::fs::metadata(path)?;
        Ok(())
    }
}

pub struct MockCache {
    log: Arc<CallLog>,
}

impl FileCache for MockCache {
    fn init_cache(&self, app: &str) -> CollaboratorResult<()> {
        self.log.push(format!("init_cache:{app}"));
        Ok(())
    }

    fn deinit_cache(&self) -> CollaboratorResult<()> {
        self.log.push("deinit_cache");
        Ok(())
    }
}

/// A full set of recording collaborators plus scratch directories.
pub struct Harness {
    pub log: Arc<CallLog>,
    pub faults: Arc<Faults>,
    pub ipc: Arc<MockIpc>,
    pub storage: Arc<MockStorage>,
    pub blacklist: Arc<MockBlacklist>,
    collaborators: Collaborators,
    dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();

        let log = Arc::new(CallLog::default());
        let faults = Arc::new(Faults::default());

        let ipc = Arc::new(MockIpc {
            log: Arc::clone(&log),
            faults: Arc::clone(&faults),
            gauge: Arc::new(SessionGauge::default()),
            events: Mutex::new(None),
        });
        let storage = Arc::new(MockStorage {
            log: Arc::clone(&log),
            full_shutdown_delay: Mutex::new(None),
        });
        let blacklist = Arc::new(MockBlacklist {
            log: Arc::clone(&log),
            last_path: Mutex::new(None),
        });

        let collaborators = Collaborators {
            ipc: ipc.clone(),
            storage: storage.clone(),
            plugins: Arc::new(MockPlugins {
                log: Arc::clone(&log),
                faults: Arc::clone(&faults),
            }),
            blacklist: blacklist.clone(),
            file_cache: Some(Arc::new(MockCache {
                log: Arc::clone(&log),
            })),
        };

        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(dir.path().join("shm")).expect("shm dir");

        Self {
            log,
            faults,
            ipc,
            storage,
            blacklist,
            collaborators,
            dir,
        }
    }

    /// Scratch directory root.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Directory standing in for `/dev/shm`.
    pub fn shm_dir(&self) -> PathBuf {
        self.dir.path().join("shm")
    }

    /// Configuration pointing at the scratch directories.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::default()
            .with_shm_dir(self.shm_dir())
            .with_cache_prefix(self.dir.path().join("cache"))
            .with_join_timeout(Some(Duration::from_secs(10)))
    }

    pub fn collaborators(&self) -> Collaborators {
        self.collaborators.clone()
    }

    pub fn client(&self) -> PersistenceClient {
        self.client_with(self.config())
    }

    pub fn client_with(&self, config: ClientConfig) -> PersistenceClient {
        PersistenceClient::new(config, self.collaborators()).expect("client")
    }
}

/// Index of the last entry equal to one of `entries`.
pub fn last_of(log: &[String], entries: &[&str]) -> Option<usize> {
    log.iter().rposition(|e| entries.contains(&e.as_str()))
}

/// Route library logs through the test writer, once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
