use bytes::{Bytes, BytesMut};
use tokio::sync::broadcast;

use crate::backend::ExitInfo;

/// Per-session fan-out capacity. A subscriber that falls further behind
/// than this skips ahead and sees `RecvError::Lagged`.
pub const BROADCAST_CAPACITY: usize = 256;

/// What a session's single emitter publishes to attached transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    /// A chunk of process output, always valid UTF-8.
    Data(Bytes),
    Exit(ExitInfo),
}

/// Output fan-out for one session.
///
/// The broker outlives individual processes: a restart swaps the process but
/// keeps the broker, so attached transports carry on receiving output.
#[derive(Clone)]
pub struct Broker {
    tx: broadcast::Sender<OutputEvent>,
}

impl Broker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, data: Bytes) {
        // Ignore error - means no receivers
        let _ = self.tx.send(OutputEvent::Data(data));
    }

    pub fn publish_exit(&self, exit: ExitInfo) {
        let _ = self.tx.send(OutputEvent::Exit(exit));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits a byte stream into chunks that end on UTF-8 character boundaries.
///
/// A multi-byte sequence cut by a read boundary is held back and prefixed to
/// the next chunk. Invalid bytes are replaced with U+FFFD.
#[derive(Default)]
pub struct Utf8Chunker {
    pending: BytesMut,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the decodable prefix, if any.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // Safe: from_utf8 verified this prefix.
                    out.push_str(std::str::from_utf8(&self.pending[..valid]).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            let _ = self.pending.split_to(valid + bad);
                        }
                        None => {
                            let _ = self.pending.split_to(valid);
                            break;
                        }
                    }
                }
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(Bytes::from(out))
        }
    }

    /// Flush whatever is held back, replacing an incomplete tail.
    pub fn finish(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            return None;
        }
        let s = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(Bytes::from(s))
    }
}
