use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::broadcast;

use crate::broker::OutputEvent;
use crate::protocol::{parse_client_message, Command, ServerMessage};
use crate::session::Session;

use super::AppState;

type WsSink = SplitSink<WebSocket, Message>;

pub(super) async fn ws_session(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session_socket(socket, id, state))
}

async fn send(ws_tx: &mut WsSink, msg: &ServerMessage) -> bool {
    ws_tx.send(Message::Text(msg.to_json().into())).await.is_ok()
}

async fn close(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_session_socket(socket: WebSocket, id: String, state: AppState) {
    let (_shutdown_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let connection = match state.manager.open_connection(&id) {
        Ok(connection) => connection,
        Err(e) => {
            tracing::warn!(session = %id, error = %e, "rejecting terminal connection");
            let _ = send(&mut ws_tx, &ServerMessage::error(e.to_string())).await;
            close(&mut ws_tx, close_code::POLICY, "session unavailable").await;
            return;
        }
    };
    let session = connection.session().clone();
    // Attach after counting: no backlog, only output produced from here on.
    let mut output_rx = session.broker.subscribe();
    tracing::debug!(session = %id, "terminal connection attached");

    loop {
        tokio::select! {
            biased;

            result = output_rx.recv() => {
                match result {
                    Ok(OutputEvent::Data(chunk)) => {
                        let msg = ServerMessage::Data {
                            content: String::from_utf8_lossy(&chunk).into_owned(),
                        };
                        if !send(&mut ws_tx, &msg).await {
                            break;
                        }
                    }
                    Ok(OutputEvent::Exit(exit)) => {
                        let _ = send(&mut ws_tx, &ServerMessage::from(exit)).await;
                        close(&mut ws_tx, close_code::NORMAL, "process exited").await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(session = %id, skipped = n, "slow connection, output dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        close(&mut ws_tx, close_code::NORMAL, "session closed").await;
                        break;
                    }
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => handle_text(&state, &session, text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(session = %id, code = ?frame.map(|f| f.code), "client closed");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(session = %id, error = %e, "websocket receive error");
                        break;
                    }
                    None => break,
                }
            }

            _ = session.cancelled.cancelled() => {
                close(&mut ws_tx, close_code::NORMAL, "session closed").await;
                break;
            }

            _ = shutdown_rx.changed() => {
                close(&mut ws_tx, close_code::NORMAL, "server shutting down").await;
                break;
            }
        }
    }

    drop(connection);
}

/// Apply one client message to the session this connection attached to,
/// never to a session that has since replaced it under the same id.
fn handle_text(state: &AppState, session: &Session, text: &str) {
    let id = session.id.as_str();
    match parse_client_message(text) {
        Ok(Command::Input(data)) => {
            if let Err(e) = session.write(data.as_bytes()) {
                tracing::warn!(session = %id, error = %e, "write failed");
            }
        }
        Ok(Command::Resize { cols, rows }) => {
            if let Err(e) = session.resize(cols, rows) {
                tracing::warn!(session = %id, error = %e, "resize failed");
            }
        }
        Ok(Command::Restart) => {
            let current = state
                .manager
                .get(id)
                .is_some_and(|live| live.same_as(session));
            if !current {
                tracing::debug!(session = %id, "restart from a stale connection ignored");
                return;
            }
            let manager = state.manager.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                if let Err(e) = manager.restart(&id).await {
                    tracing::warn!(session = %id, error = %e, "restart requested by client failed");
                }
            });
        }
        Err(e) => {
            tracing::warn!(session = %id, error = %e, "dropping invalid message");
        }
    }
}
