//! termhub - shared terminal sessions for an interactive coding assistant.
//!
//! Each session pairs a working directory with one long-lived assistant
//! process running in a pseudo-terminal, locally or inside a container.
//! Any number of websocket viewers can attach to a session; when the last
//! one leaves, the session idles and is destroyed after a grace period
//! unless someone reconnects.

pub mod activity;
pub mod api;
pub mod backend;
pub mod broker;
pub mod client;
pub mod config;
pub mod environment;
pub mod manager;
pub mod protocol;
pub mod pty;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod terminal;
pub mod tracker;
