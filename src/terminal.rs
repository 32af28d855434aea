use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),

    #[error("failed to query terminal size: {0}")]
    Size(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode while attached to a session.
///
/// Keystrokes such as Ctrl+C must reach the remote process instead of the
/// local terminal. Dropping the guard restores cooked mode, even on panic.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current terminal size as `(cols, rows)`, the order the resize message uses.
pub fn terminal_size() -> Result<(u16, u16), TerminalError> {
    size().map_err(TerminalError::Size)
}
