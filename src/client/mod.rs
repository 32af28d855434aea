//! Reconnecting terminal client.
//!
//! [`ReconnectMachine`] is the pure transition function; [`TerminalClient`]
//! drives it over a real websocket.
//!
//! ```text
//! connecting --open--> connected --abnormal close--> disconnected
//!                          ^                              | backoff timer
//!                          +----------open---------- reconnecting
//!                                                         | 6th failure
//!                                                       error
//! ```
//!
//! `disconnect()` moves any state to a manual `disconnected` that suppresses
//! automatic reconnection until `reconnect()`.

mod connection;
mod http;

pub use connection::{ClientError, TerminalClient};
pub use http::{CreateRequest, HubClient, SessionSummary};

use std::time::Duration;

use serde::Serialize;

/// Automatic retries before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

pub const BASE_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Reconnecting => "reconnecting",
            ClientStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The socket finished its handshake.
    Opened,
    /// The socket closed, or a connection attempt failed (`normal: false`).
    Closed { normal: bool },
    /// The backoff timer elapsed.
    TimerFired,
    /// Explicit `disconnect()`.
    Disconnect,
    /// Explicit `reconnect()`.
    Reconnect,
}

/// What the driver must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    Connect,
    ScheduleReconnect(Duration),
    /// Close the socket with the normal code and cancel any pending timer.
    CloseNormal,
}

/// Backoff before retry number `attempt` (0-based).
pub fn reconnect_delay(attempt: u32) -> Duration {
    BASE_RECONNECT_DELAY * 2u32.saturating_pow(attempt)
}

#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    status: ClientStatus,
    attempt: u32,
    manual: bool,
}

impl Default for ReconnectMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectMachine {
    /// A machine about to make its first connection attempt.
    pub fn new() -> Self {
        Self {
            status: ClientStatus::Connecting,
            attempt: 0,
            manual: false,
        }
    }

    pub fn status(&self) -> ClientStatus {
        self.status
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn handle(&mut self, event: ClientEvent) -> Action {
        match event {
            ClientEvent::Opened => {
                if self.manual {
                    return Action::CloseNormal;
                }
                self.status = ClientStatus::Connected;
                self.attempt = 0;
                Action::None
            }
            ClientEvent::Closed { normal } => {
                if self.manual
                    || matches!(self.status, ClientStatus::Error | ClientStatus::Disconnected)
                {
                    return Action::None;
                }
                if normal && self.status == ClientStatus::Connected {
                    self.status = ClientStatus::Disconnected;
                    return Action::None;
                }
                self.fail()
            }
            ClientEvent::TimerFired => {
                if self.manual || self.status != ClientStatus::Disconnected {
                    return Action::None;
                }
                self.status = ClientStatus::Reconnecting;
                Action::Connect
            }
            ClientEvent::Disconnect => {
                self.manual = true;
                self.status = ClientStatus::Disconnected;
                Action::CloseNormal
            }
            ClientEvent::Reconnect => {
                self.manual = false;
                self.attempt = 0;
                self.status = ClientStatus::Connecting;
                Action::Connect
            }
        }
    }

    fn fail(&mut self) -> Action {
        if self.attempt >= MAX_RECONNECT_ATTEMPTS {
            self.status = ClientStatus::Error;
            return Action::None;
        }
        let delay = reconnect_delay(self.attempt);
        self.attempt += 1;
        self.status = ClientStatus::Disconnected;
        Action::ScheduleReconnect(delay)
    }
}
