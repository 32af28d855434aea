use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::MaybeTlsStream;

use super::{Action, ClientEvent, ClientStatus, ReconnectMachine};
use crate::protocol::{parse_server_message, ClientMessage, ServerMessage};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const COMMAND_CAPACITY: usize = 256;
const MESSAGE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("token is not a valid header value")]
    InvalidToken,

    #[error("connection attempt timed out")]
    Timeout,
}

enum ClientCommand {
    Send(ClientMessage),
    Disconnect,
    Reconnect,
}

/// Handle to a background task that keeps one terminal connection alive.
///
/// Server messages arrive on the receiver returned by [`TerminalClient::spawn`];
/// payloads that fail to parse are logged and never delivered.
pub struct TerminalClient {
    cmd_tx: mpsc::Sender<ClientCommand>,
    status_rx: watch::Receiver<ClientStatus>,
    task: tokio::task::JoinHandle<()>,
}

impl TerminalClient {
    /// Start connecting to `url` (e.g. `ws://127.0.0.1:8080/ws/sessions/s1`).
    pub fn spawn(
        url: impl Into<String>,
        token: Option<String>,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (status_tx, status_rx) = watch::channel(ClientStatus::Connecting);
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_CAPACITY);
        let driver = Driver {
            url: url.into(),
            token,
            machine: ReconnectMachine::new(),
            socket: None,
            timer: None,
            status_tx,
            msg_tx,
        };
        let task = tokio::spawn(driver.run(cmd_rx));
        (
            Self {
                cmd_tx,
                status_rx,
                task,
            },
            msg_rx,
        )
    }

    pub fn status(&self) -> ClientStatus {
        *self.status_rx.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ClientStatus> {
        self.status_rx.clone()
    }

    /// Queue a message. Dropped with a log line when not connected.
    pub fn send(&self, msg: ClientMessage) {
        if self.status() != ClientStatus::Connected {
            tracing::warn!(status = %self.status(), "not connected, message dropped");
            return;
        }
        if self.cmd_tx.try_send(ClientCommand::Send(msg)).is_err() {
            tracing::warn!("client command queue full, message dropped");
        }
    }

    /// Close with the normal code and stop reconnecting.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.try_send(ClientCommand::Disconnect);
    }

    /// Start over with a fresh attempt counter.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.try_send(ClientCommand::Reconnect);
    }

    /// Wait for a status matching `pred`.
    pub async fn wait_for_status<F>(&self, pred: F) -> ClientStatus
    where
        F: Fn(ClientStatus) -> bool,
    {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow_and_update();
            if pred(status) {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Drop the command channel and wait for the driver to finish.
    pub async fn join(self) {
        let Self { cmd_tx, task, .. } = self;
        drop(cmd_tx);
        let _ = task.await;
    }
}

struct Driver {
    url: String,
    token: Option<String>,
    machine: ReconnectMachine,
    socket: Option<WsStream>,
    timer: Option<Pin<Box<Sleep>>>,
    status_tx: watch::Sender<ClientStatus>,
    msg_tx: mpsc::Sender<ServerMessage>,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ClientCommand>) {
        let mut action = Action::Connect;
        loop {
            action = self.apply(action).await;
            if action != Action::None {
                continue;
            }

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Send(msg)) => self.send(msg).await,
                        Some(ClientCommand::Disconnect) => {
                            action = self.machine.handle(ClientEvent::Disconnect);
                        }
                        Some(ClientCommand::Reconnect) => {
                            self.close_socket().await;
                            self.timer = None;
                            action = self.machine.handle(ClientEvent::Reconnect);
                        }
                        None => {
                            self.close_socket().await;
                            break;
                        }
                    }
                }

                frame = next_frame(&mut self.socket) => {
                    action = self.on_frame(frame).await;
                }

                _ = wait_timer(&mut self.timer) => {
                    self.timer = None;
                    action = self.machine.handle(ClientEvent::TimerFired);
                }
            }
        }
        tracing::debug!(url = %self.url, "terminal client stopped");
    }

    /// Carry out one action; returns the follow-up action, if any.
    async fn apply(&mut self, action: Action) -> Action {
        let next = match action {
            Action::None => Action::None,
            Action::Connect => {
                self.timer = None;
                self.publish_status();
                match self.open().await {
                    Ok(ws) => {
                        tracing::info!(url = %self.url, "terminal connected");
                        self.socket = Some(ws);
                        self.machine.handle(ClientEvent::Opened)
                    }
                    Err(e) => {
                        tracing::warn!(url = %self.url, error = %e, "connection attempt failed");
                        self.machine.handle(ClientEvent::Closed { normal: false })
                    }
                }
            }
            Action::ScheduleReconnect(delay) => {
                tracing::info!(
                    ?delay,
                    attempt = self.machine.attempt(),
                    "scheduling reconnect"
                );
                self.timer = Some(Box::pin(tokio::time::sleep(delay)));
                Action::None
            }
            Action::CloseNormal => {
                self.timer = None;
                self.close_socket().await;
                Action::None
            }
        };
        self.publish_status();
        if self.machine.status() == ClientStatus::Error && action != Action::None {
            tracing::error!(url = %self.url, "reconnect attempts exhausted");
        }
        next
    }

    fn publish_status(&self) {
        self.status_tx.send_if_modified(|current| {
            let status = self.machine.status();
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    async fn open(&self) -> Result<WsStream, ClientError> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ClientError::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClientError::Timeout)??;
        Ok(ws)
    }

    async fn send(&mut self, msg: ClientMessage) {
        let Some(ws) = self.socket.as_mut() else {
            tracing::warn!("not connected, message dropped");
            return;
        };
        if let Err(e) = ws.send(Message::Text(msg.to_json().into())).await {
            tracing::warn!(error = %e, "send failed");
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) -> Action {
        match frame {
            Some(Ok(Message::Text(text))) => {
                match parse_server_message(text.as_str()) {
                    Ok(msg) => {
                        if self.msg_tx.send(msg).await.is_err() {
                            tracing::debug!("message receiver dropped");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "ignoring malformed server message"),
                }
                Action::None
            }
            Some(Ok(Message::Close(frame))) => {
                let normal = frame
                    .as_ref()
                    .map(|f| f.code == CloseCode::Normal)
                    .unwrap_or(false);
                tracing::info!(code = ?frame.map(|f| f.code), "server closed connection");
                self.socket = None;
                self.machine.handle(ClientEvent::Closed { normal })
            }
            Some(Ok(_)) => Action::None,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "connection lost");
                self.socket = None;
                self.machine.handle(ClientEvent::Closed { normal: false })
            }
            None => {
                tracing::warn!("connection lost");
                self.socket = None;
                self.machine.handle(ClientEvent::Closed { normal: false })
            }
        }
    }

    async fn close_socket(&mut self) {
        if let Some(mut ws) = self.socket.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            };
            let _ = ws.close(Some(frame)).await;
        }
    }
}

async fn next_frame(
    socket: &mut Option<WsStream>,
) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}
