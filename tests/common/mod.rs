#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use termhub::backend::{
    Backend, BackendError, BackendFactory, BackendResolver, ExitInfo, ProcessControl,
    ProcessHandle, SpawnRequest,
};
use termhub::environment::{Environment, EnvironmentCatalog, EnvironmentKind};
use termhub::manager::{ManagerSettings, SessionManager};
use termhub::store::MemoryStore;

/// One process started by [`FakeBackend`]. Records everything the manager
/// does to it and lets the test drive its output and exit.
pub struct FakeProcess {
    pub request: SpawnRequest,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    killed: AtomicBool,
    output_tx: mpsc::Sender<Bytes>,
    exit_tx: Mutex<Option<oneshot::Sender<ExitInfo>>>,
}

impl FakeProcess {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn written_text(&self) -> Vec<String> {
        self.writes()
            .into_iter()
            .map(|w| String::from_utf8_lossy(&w).into_owned())
            .collect()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().clone()
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    /// Produce output as if the process had printed `text`.
    pub async fn emit(&self, text: &str) {
        let _ = self
            .output_tx
            .send(Bytes::copy_from_slice(text.as_bytes()))
            .await;
    }

    /// Terminate the process on its own.
    pub fn exit(&self, exit: ExitInfo) {
        if let Some(tx) = self.exit_tx.lock().take() {
            let _ = tx.send(exit);
        }
    }
}

struct FakeControl(Arc<FakeProcess>);

impl ProcessControl for FakeControl {
    fn write(&self, data: &[u8]) -> Result<(), BackendError> {
        if self.0.is_killed() {
            return Err(BackendError::ProcessGone);
        }
        self.0.writes.lock().push(data.to_vec());
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.0.resizes.lock().push((cols, rows));
        Ok(())
    }

    fn kill(&self) {
        if !self.0.killed.swap(true, Ordering::SeqCst) {
            self.0.exit(ExitInfo {
                exit_code: 0,
                signal: Some("SIGHUP".to_string()),
            });
        }
    }

    fn pid(&self) -> Option<u32> {
        Some(4242)
    }
}

/// Backend that never starts a real process.
#[derive(Default)]
pub struct FakeBackend {
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    fail: AtomicBool,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.processes.lock().len()
    }

    pub fn process(&self, index: usize) -> Arc<FakeProcess> {
        self.processes.lock()[index].clone()
    }

    pub fn last(&self) -> Arc<FakeProcess> {
        self.processes
            .lock()
            .last()
            .cloned()
            .expect("no process spawned")
    }
}

impl Backend for FakeBackend {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Host
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, BackendError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BackendError::Misconfigured {
                id: "fake".to_string(),
                reason: "spawn disabled".to_string(),
            });
        }
        let (output_tx, output_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let process = Arc::new(FakeProcess {
            request: request.clone(),
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            output_tx,
            exit_tx: Mutex::new(Some(exit_tx)),
        });
        self.processes.lock().push(process.clone());
        Ok(ProcessHandle::new(
            Arc::new(FakeControl(process)),
            output_rx,
            exit_rx,
        ))
    }
}

/// Serves every environment with the same fake backend and counts builds.
pub struct FakeFactory {
    pub backend: Arc<FakeBackend>,
    pub builds: Mutex<Vec<String>>,
}

impl BackendFactory for FakeFactory {
    fn build(&self, environment: &Environment) -> Result<Arc<dyn Backend>, BackendError> {
        self.builds.lock().push(environment.id.clone());
        Ok(self.backend.clone())
    }
}

/// Short delays and no inactivity pause.
pub fn fast_settings() -> ManagerSettings {
    ManagerSettings {
        destroy_grace: Duration::from_secs(5),
        settle_delay: Duration::from_millis(10),
        restart_delay: Duration::from_millis(10),
        inactivity_timeout: None,
    }
}

pub struct TestHub {
    pub manager: SessionManager,
    pub backend: Arc<FakeBackend>,
    pub factory: Arc<FakeFactory>,
    pub store: Arc<MemoryStore>,
}

pub fn test_hub() -> TestHub {
    test_hub_with(fast_settings())
}

pub fn test_hub_with(settings: ManagerSettings) -> TestHub {
    let backend = FakeBackend::new();
    let factory = Arc::new(FakeFactory {
        backend: backend.clone(),
        builds: Mutex::new(Vec::new()),
    });
    let store = Arc::new(MemoryStore::new());
    let manager = SessionManager::new(
        BackendResolver::new(factory.clone()),
        EnvironmentCatalog::default(),
        store.clone(),
        settings,
    );
    TestHub {
        manager,
        backend,
        factory,
        store,
    }
}

pub async fn start_server(app: axum::Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
