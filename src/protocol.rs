//! Terminal transport messages.
//!
//! Every websocket text frame carries one JSON object with a `type`
//! discriminator. Server to client: `data`, `exit`, `error`. Client to
//! server: `input`, `resize`, `restart`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::ExitInfo;

/// Largest accepted terminal dimension.
pub const MAX_DIMENSION: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Data {
        content: String,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: u32,
        #[serde(default)]
        signal: Option<String>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: all fields are strings
        // and integers.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<ExitInfo> for ServerMessage {
    fn from(exit: ExitInfo) -> Self {
        ServerMessage::Exit {
            exit_code: exit.exit_code,
            signal: exit.signal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeData {
    pub cols: i64,
    pub rows: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Input { data: String },
    Resize { data: ResizeData },
    Restart,
}

impl ClientMessage {
    pub fn input(data: impl Into<String>) -> Self {
        ClientMessage::Input { data: data.into() }
    }

    pub fn resize(cols: u16, rows: u16) -> Self {
        ClientMessage::Resize {
            data: ResizeData {
                cols: cols.into(),
                rows: rows.into(),
            },
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid resize dimensions {cols}x{rows}")]
    InvalidResize { cols: i64, rows: i64 },
}

/// An inbound message that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Input(String),
    Resize { cols: u16, rows: u16 },
    Restart,
}

/// Parse and validate one inbound text frame.
pub fn parse_client_message(text: &str) -> Result<Command, ProtocolError> {
    match serde_json::from_str::<ClientMessage>(text)? {
        ClientMessage::Input { data } => Ok(Command::Input(data)),
        ClientMessage::Resize { data } => {
            let valid = |n: i64| n > 0 && n <= MAX_DIMENSION;
            if !valid(data.cols) || !valid(data.rows) {
                return Err(ProtocolError::InvalidResize {
                    cols: data.cols,
                    rows: data.rows,
                });
            }
            Ok(Command::Resize {
                cols: data.cols as u16,
                rows: data.rows as u16,
            })
        }
        ClientMessage::Restart => Ok(Command::Restart),
    }
}

/// Parse one outbound frame on the client side.
pub fn parse_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_messages_match_wire_shapes() {
        let data = ServerMessage::Data {
            content: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"type": "data", "content": "hi"})
        );

        let exit = ServerMessage::from(ExitInfo::code(2));
        assert_eq!(
            serde_json::to_value(&exit).unwrap(),
            json!({"type": "exit", "exitCode": 2, "signal": null})
        );

        assert_eq!(
            serde_json::to_value(ServerMessage::error("boom")).unwrap(),
            json!({"type": "error", "message": "boom"})
        );
    }

    #[test]
    fn parses_input() {
        assert_eq!(
            parse_client_message(r#"{"type":"input","data":"ls\n"}"#).unwrap(),
            Command::Input("ls\n".into())
        );
    }

    #[test]
    fn parses_resize() {
        assert_eq!(
            parse_client_message(r#"{"type":"resize","data":{"cols":120,"rows":40}}"#).unwrap(),
            Command::Resize {
                cols: 120,
                rows: 40
            }
        );
    }

    #[test]
    fn parses_restart() {
        assert_eq!(
            parse_client_message(r#"{"type":"restart"}"#).unwrap(),
            Command::Restart
        );
    }

    #[test]
    fn rejects_out_of_range_resize() {
        for body in [
            r#"{"type":"resize","data":{"cols":0,"rows":24}}"#,
            r#"{"type":"resize","data":{"cols":80,"rows":1001}}"#,
            r#"{"type":"resize","data":{"cols":-5,"rows":24}}"#,
        ] {
            assert!(
                matches!(
                    parse_client_message(body),
                    Err(ProtocolError::InvalidResize { .. })
                ),
                "accepted {}",
                body
            );
        }
    }

    #[test]
    fn rejects_fractional_resize() {
        assert!(matches!(
            parse_client_message(r#"{"type":"resize","data":{"cols":80.5,"rows":24}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_garbage_and_unknown_types() {
        assert!(parse_client_message("not json").is_err());
        assert!(parse_client_message(r#"{"type":"launch"}"#).is_err());
        assert!(parse_client_message(r#"{"data":"x"}"#).is_err());
    }

    #[test]
    fn client_message_serializes_for_sending() {
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&ClientMessage::resize(80, 24).to_json())
                .unwrap(),
            json!({"type": "resize", "data": {"cols": 80, "rows": 24}})
        );
    }

    #[test]
    fn server_exit_without_signal_parses() {
        assert_eq!(
            parse_server_message(r#"{"type":"exit","exitCode":0}"#).unwrap(),
            ServerMessage::Exit {
                exit_code: 0,
                signal: None
            }
        );
    }
}
