//! termhub - shared terminal sessions for an interactive coding assistant.
//!
//! `termhub serve` runs the HTTP/WebSocket server. The other subcommands
//! talk to a running server: `attach` opens a reconnecting terminal,
//! `create`, `list` and `stop` manage sessions over REST.

use clap::{Parser as ClapParser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use termhub::{
    api,
    backend::BackendResolver,
    backend::ClaudeOptions,
    broker::Utf8Chunker,
    client::{ClientStatus, CreateRequest, HubClient, TerminalClient},
    config::{self, Config},
    environment::EnvironmentCatalog,
    manager::SessionManager,
    protocol::{ClientMessage, ServerMessage},
    store::JsonFileStore,
    terminal,
};

/// Ctrl-] detaches from a session without stopping it.
const DETACH_KEY: u8 = 0x1d;

/// Pressed after reconnect attempts ran out to try again.
const RECONNECT_KEY: u8 = b'r';

/// How long open terminals get to flush their close frames on shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

#[derive(ClapParser, Debug)]
#[command(name = "termhub", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the session server
    Serve {
        /// Address to bind the HTTP/WebSocket API server
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Config file (default: <config dir>/termhub/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Authentication token for non-localhost bindings
        #[arg(long, env = "TERMHUB_TOKEN")]
        token: Option<String>,

        /// Where session records are persisted
        #[arg(long)]
        state_file: Option<PathBuf>,

        /// Allowed CORS origin (repeatable)
        #[arg(long = "cors-origin")]
        cors_origins: Vec<String>,

        /// Milliseconds an idle session survives before it is destroyed
        #[arg(long)]
        grace_period_ms: Option<u64>,
    },

    /// Attach this terminal to a session
    Attach {
        id: String,

        #[arg(long, default_value = "127.0.0.1:8080")]
        server: String,

        #[arg(long, env = "TERMHUB_TOKEN")]
        token: Option<String>,
    },

    /// Start a new session
    Create {
        /// Working directory for the assistant
        working_dir: PathBuf,

        /// Session id (default: random)
        #[arg(long)]
        id: Option<String>,

        /// Environment to run in
        #[arg(long)]
        environment: Option<String>,

        /// Text typed into the assistant once it has started
        #[arg(long)]
        input: Option<String>,

        /// Model passed to the assistant
        #[arg(long)]
        model: Option<String>,

        /// Tools the assistant may use without asking
        #[arg(long)]
        allowed_tools: Option<String>,

        /// Assistant permission mode
        #[arg(long)]
        permission_mode: Option<String>,

        /// Extra environment variable for the process (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        #[arg(long, default_value = "127.0.0.1:8080")]
        server: String,

        #[arg(long, env = "TERMHUB_TOKEN")]
        token: Option<String>,
    },

    /// List sessions
    List {
        #[arg(long, default_value = "127.0.0.1:8080")]
        server: String,

        #[arg(long, env = "TERMHUB_TOKEN")]
        token: Option<String>,
    },

    /// Destroy a session
    Stop {
        id: String,

        #[arg(long, default_value = "127.0.0.1:8080")]
        server: String,

        #[arg(long, env = "TERMHUB_TOKEN")]
        token: Option<String>,
    },
}

#[derive(Error, Debug)]
pub enum TermhubError {
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("state store error: {0}")]
    Store(#[from] termhub::store::StoreError),

    #[error("terminal error: {0}")]
    Terminal(#[from] terminal::TerminalError),

    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

fn is_loopback(addr: &SocketAddr) -> bool {
    addr.ip().is_loopback()
}

fn resolve_token(bind: &SocketAddr, user_token: Option<String>) -> Option<String> {
    if user_token.is_some() {
        return user_token;
    }
    if is_loopback(bind) {
        return None;
    }
    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    eprintln!("termhub: API token (required for non-localhost): {}", token);
    Some(token)
}

#[tokio::main]
async fn main() -> Result<(), TermhubError> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            config,
            token,
            state_file,
            cors_origins,
            grace_period_ms,
        } => {
            init_tracing();
            run_server(bind, config, token, state_file, cors_origins, grace_period_ms).await
        }
        Commands::Attach { id, server, token } => {
            init_tracing_stderr();
            run_attach(id, server, token).await
        }
        Commands::Create {
            working_dir,
            id,
            environment,
            input,
            model,
            allowed_tools,
            permission_mode,
            env,
            server,
            token,
        } => {
            init_tracing_stderr();
            let request = CreateRequest {
                id,
                working_dir: std::fs::canonicalize(&working_dir).unwrap_or(working_dir),
                environment_id: environment,
                initial_input: input,
                claude_options: ClaudeOptions {
                    model,
                    allowed_tools,
                    permission_mode,
                    ..Default::default()
                },
                custom_env_vars: env.into_iter().collect(),
            };
            run_create(request, server, token).await
        }
        Commands::List { server, token } => {
            init_tracing_stderr();
            run_list(server, token).await
        }
        Commands::Stop { id, server, token } => {
            init_tracing_stderr();
            run_stop(id, server, token).await
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termhub=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Client commands keep stdout for terminal output; logs go to stderr and
/// default to warnings only.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "termhub=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

// ── Server mode ────────────────────────────────────────────────────

async fn run_server(
    bind: Option<SocketAddr>,
    config_path: Option<PathBuf>,
    token: Option<String>,
    state_file: Option<PathBuf>,
    cors_origins: Vec<String>,
    grace_period_ms: Option<u64>,
) -> Result<(), TermhubError> {
    tracing::info!("termhub server starting");

    let config_path = config_path.unwrap_or_else(config::default_config_path);
    let mut config = Config::load_or_default(&config_path)?;
    config.apply_env();
    if grace_period_ms.is_some() {
        config.sessions.destroy_grace_ms = grace_period_ms;
    }

    let bind = bind.unwrap_or_else(|| config.bind());
    let token = resolve_token(&bind, token.or_else(|| config.server.token.clone()));
    if token.is_some() {
        tracing::info!("auth token configured");
    }

    let state_file = state_file.unwrap_or_else(|| config.state_file());
    let store = JsonFileStore::open(&state_file)?;
    tracing::info!(path = %state_file.display(), "session store opened");

    let settings = config.manager_settings();
    tracing::info!(
        grace = ?settings.destroy_grace,
        inactivity = ?settings.inactivity_timeout,
        command = %config.launch_settings().command,
        "session settings"
    );
    let manager = SessionManager::new(
        BackendResolver::with_settings(config.launch_settings()),
        EnvironmentCatalog::new(config.environments.clone()),
        Arc::new(store),
        settings,
    );

    let report = manager.reconcile_on_boot();
    tracing::info!(
        destroyed = report.destroyed.len(),
        paused = report.paused.len(),
        rearmed = report.rearmed.len(),
        "reconciled stored sessions"
    );

    let state = api::AppState::new(manager.clone());
    let shutdown = state.shutdown.clone();
    let app = api::router(state, api::RouterConfig { token, cors_origins });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "HTTP/WS server listening");

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    wait_for_signal().await;

    // Stop processes first so closing transports do not start idle timers.
    manager.shutdown();
    shutdown.shutdown();
    if !shutdown.wait_for_all_closed(SHUTDOWN_DRAIN).await {
        tracing::warn!(
            remaining = shutdown.active_count(),
            "connections still open at shutdown"
        );
    }

    let _ = server_shutdown_tx.send(());
    if let Err(e) = http_handle.await? {
        tracing::warn!(error = %e, "HTTP server error");
    }

    tracing::info!("termhub server exiting");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl+C"),
                    _ = term.recv() => tracing::info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received Ctrl+C");
}

// ── Client mode ────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum KeyboardInput {
    Detach,
    Reconnect,
    Forward(String),
    Ignore,
}

/// Decide what a chunk read from the local terminal means. While the client
/// has given up reconnecting only the detach and reconnect keys do anything.
fn keyboard_input(data: &[u8], exhausted: bool, chunker: &mut Utf8Chunker) -> KeyboardInput {
    if data.contains(&DETACH_KEY) {
        return KeyboardInput::Detach;
    }
    if exhausted {
        return if data.contains(&RECONNECT_KEY) {
            KeyboardInput::Reconnect
        } else {
            KeyboardInput::Ignore
        };
    }
    match chunker.push(data) {
        Some(text) => KeyboardInput::Forward(String::from_utf8_lossy(&text).into_owned()),
        None => KeyboardInput::Ignore,
    }
}

async fn run_attach(id: String, server: String, token: Option<String>) -> Result<(), TermhubError> {
    let hub = HubClient::new(server, token.clone());
    let (client, mut messages) = TerminalClient::spawn(hub.ws_url(&id), token);

    let status = client
        .wait_for_status(|s| matches!(s, ClientStatus::Connected | ClientStatus::Error))
        .await;
    if status == ClientStatus::Error {
        eprintln!("termhub attach: could not connect to session {}", id);
        std::process::exit(1);
    }

    let raw_guard = terminal::RawModeGuard::new()?;
    if let Ok((cols, rows)) = terminal::terminal_size() {
        client.send(ClientMessage::resize(cols, rows));
    }

    let (stdin_tx, mut stdin_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (winch_tx, mut winch_rx) = tokio::sync::mpsc::channel::<(u16, u16)>(4);
    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigwinch) = signal(SignalKind::window_change()) else {
            return;
        };
        while sigwinch.recv().await.is_some() {
            if let Ok(size) = terminal::terminal_size() {
                if winch_tx.send(size).await.is_err() {
                    break;
                }
            }
        }
    });
    #[cfg(not(unix))]
    drop(winch_tx);

    let mut status_rx = client.watch_status();
    let mut chunker = Utf8Chunker::new();
    let mut exhausted = false;
    let mut exit_code = 0;
    let mut reason = None;
    loop {
        tokio::select! {
            data = stdin_rx.recv() => {
                let Some(data) = data else { break };
                match keyboard_input(&data, exhausted, &mut chunker) {
                    KeyboardInput::Detach => {
                        reason = Some("detached".to_string());
                        break;
                    }
                    KeyboardInput::Reconnect => {
                        exhausted = false;
                        eprint!("\r\ntermhub: reconnecting...\r\n");
                        client.reconnect();
                    }
                    KeyboardInput::Forward(text) => client.send(ClientMessage::input(text)),
                    KeyboardInput::Ignore => {}
                }
            }
            msg = messages.recv() => {
                match msg {
                    Some(ServerMessage::Data { content }) => {
                        use std::io::Write;
                        let mut stdout = std::io::stdout().lock();
                        if stdout.write_all(content.as_bytes()).is_err() {
                            break;
                        }
                        let _ = stdout.flush();
                    }
                    Some(ServerMessage::Exit { exit_code: code, signal }) => {
                        exit_code = code as i32;
                        reason = Some(match signal {
                            Some(signal) => format!("process exited ({})", signal),
                            None => format!("process exited with code {}", code),
                        });
                        break;
                    }
                    Some(ServerMessage::Error { message }) => {
                        reason = Some(format!("server error: {}", message));
                        exit_code = 1;
                        break;
                    }
                    None => break,
                }
            }
            size = winch_rx.recv() => {
                if let Some((cols, rows)) = size {
                    client.send(ClientMessage::resize(cols, rows));
                }
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                if status == ClientStatus::Error && !exhausted {
                    exhausted = true;
                    eprint!(
                        "\r\ntermhub: connection lost, reconnect attempts exhausted. \
                         Press 'r' to reconnect or Ctrl-] to detach.\r\n"
                    );
                }
            }
        }
    }

    client.disconnect();
    drop(raw_guard);
    client.join().await;
    if let Some(reason) = reason {
        eprintln!("\r\ntermhub: {}", reason);
    }
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

async fn run_create(
    request: CreateRequest,
    server: String,
    token: Option<String>,
) -> Result<(), TermhubError> {
    let hub = HubClient::new(server, token);
    match hub.create_session_with(&request).await {
        Ok(session) => {
            println!("{}", session.id);
            Ok(())
        }
        Err(e) => {
            eprintln!("termhub create: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run_list(server: String, token: Option<String>) -> Result<(), TermhubError> {
    let hub = HubClient::new(server, token);
    let sessions = match hub.list_sessions().await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("termhub list: {}", e);
            std::process::exit(1);
        }
    };

    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!(
        "{:<38} {:<10} {:<8} {:<8} {:<12} {}",
        "ID", "STATE", "PID", "CLIENTS", "ENV", "DIR"
    );
    for s in &sessions {
        let pid = s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:<38} {:<10} {:<8} {:<8} {:<12} {}",
            s.id, s.session_state, pid, s.active_connections, s.environment_id, s.working_dir
        );
    }
    Ok(())
}

async fn run_stop(id: String, server: String, token: Option<String>) -> Result<(), TermhubError> {
    let hub = HubClient::new(server, token);
    if let Err(e) = hub.stop_session(&id).await {
        eprintln!("termhub stop: {}", e);
        std::process::exit(1);
    }
    println!("Session '{}' stopped.", id);
    Ok(())
}
