use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use portable_pty::CommandBuilder;
use tokio::sync::{mpsc, oneshot};

use super::{
    Backend, BackendError, ExitInfo, LaunchSettings, ProcessControl, ProcessHandle, SpawnRequest,
    ENV_ALLOWLIST,
};
use crate::environment::EnvironmentKind;
use crate::pty::Pty;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 256;
const READ_BUFFER_SIZE: usize = 4096;

/// Spawns the assistant directly on the host inside a pseudo-terminal.
pub struct LocalPtyBackend {
    settings: LaunchSettings,
}

impl LocalPtyBackend {
    pub fn new(settings: LaunchSettings) -> Self {
        Self { settings }
    }
}

impl Backend for LocalPtyBackend {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Host
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<ProcessHandle, BackendError> {
        let argv = self.settings.argv(request);
        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.cwd(&request.working_dir);
        apply_environment(&mut cmd);
        for (key, value) in request.custom_env() {
            cmd.env(key, value);
        }

        tracing::debug!(program = %argv[0], cwd = %request.working_dir.display(), "spawning local process");
        spawn_on_pty(cmd, request)
    }
}

/// Replace the inherited environment with the allowlisted host variables
/// plus color-capable terminal settings.
pub(crate) fn apply_environment(cmd: &mut CommandBuilder) {
    cmd.env_clear();
    for key in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(key) {
            cmd.env(key, value);
        }
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
}

struct PtyControl {
    pty: Mutex<Pty>,
    input_tx: mpsc::Sender<Bytes>,
    exited: Arc<AtomicBool>,
}

impl ProcessControl for PtyControl {
    fn write(&self, data: &[u8]) -> Result<(), BackendError> {
        if self.exited.load(Ordering::Acquire) {
            return Err(BackendError::ProcessGone);
        }
        self.input_tx
            .try_send(Bytes::copy_from_slice(data))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => BackendError::InputFull,
                mpsc::error::TrySendError::Closed(_) => BackendError::ProcessGone,
            })
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), BackendError> {
        self.pty.lock().resize(rows, cols)?;
        Ok(())
    }

    fn kill(&self) {
        if self.exited.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut pty = self.pty.lock();
        // portable_pty calls setsid(), so the child leads its own process
        // group and the whole group receives the hangup.
        #[cfg(unix)]
        if let Some(pid) = pty.pid() {
            if pid != 0 && pid <= i32::MAX as u32 {
                unsafe {
                    libc::kill(-(pid as i32), libc::SIGHUP);
                }
            }
        }
        pty.kill();
    }

    fn pid(&self) -> Option<u32> {
        self.pty.lock().pid()
    }
}

/// Run `cmd` on a fresh pty and wire its reader, writer and exit status to
/// channels. Used by every pty-backed backend.
pub(crate) fn spawn_on_pty(
    cmd: CommandBuilder,
    request: &SpawnRequest,
) -> Result<ProcessHandle, BackendError> {
    let mut pty = Pty::spawn(cmd, request.rows, request.cols)?;
    let reader = pty.take_reader()?;
    let writer = pty.take_writer()?;
    let child = pty.take_child();

    let exited = Arc::new(AtomicBool::new(false));
    let (output_tx, output_rx) = mpsc::channel::<Bytes>(OUTPUT_CHANNEL_CAPACITY);
    let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
    let (exit_tx, exit_rx) = oneshot::channel::<ExitInfo>();

    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            read_loop(reader, output_tx)
        }));
        if let Err(e) = result {
            tracing::error!("pty reader task panicked: {:?}", e);
        }
    });

    tokio::task::spawn_blocking(move || {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            write_loop(writer, input_rx)
        }));
        if let Err(e) = result {
            tracing::error!("pty writer task panicked: {:?}", e);
        }
    });

    let exited_flag = exited.clone();
    match child {
        Some(mut child) => {
            tokio::task::spawn_blocking(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    match child.wait() {
                        Ok(status) => ExitInfo::from(status),
                        Err(e) => {
                            tracing::error!(?e, "error waiting for child");
                            ExitInfo::code(1)
                        }
                    }
                }));
                let info = result.unwrap_or_else(|e| {
                    tracing::error!("child exit monitor task panicked: {:?}", e);
                    ExitInfo::code(1)
                });
                exited_flag.store(true, Ordering::Release);
                let _ = exit_tx.send(info);
            });
        }
        None => {
            exited_flag.store(true, Ordering::Release);
            let _ = exit_tx.send(ExitInfo::code(1));
        }
    }

    let control = PtyControl {
        pty: Mutex::new(pty),
        input_tx,
        exited,
    };
    Ok(ProcessHandle::new(Arc::new(control), output_rx, exit_rx))
}

fn read_loop(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if output_tx
                    .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                    .is_err()
                {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO is how Linux reports a hung-up pty.
            Err(_) => break,
        }
    }
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = input_rx.blocking_recv() {
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            tracing::debug!(?e, "pty write failed, stopping writer");
            break;
        }
    }
}
