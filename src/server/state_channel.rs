//! The JSON state/text WebSocket channel.
//!
//! Runs parallel to the binary mux channel. On open the server sends the
//! current session list plus update availability, then the main-browser
//! status. After that every inbound message is a command envelope:
//!
//! ```json
//! {"type":"command","id":1,"action":"session.create","payload":{...}}
//! ```
//!
//! and every command elicits exactly one response:
//!
//! ```json
//! {"type":"response","id":1,"success":true,"data":{...}}
//! ```
//!
//! Unknown actions respond with `success:false`. Session state changes
//! push a fresh `stateUpdate` to every connected channel.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::server::{AppState, UpdateInfo};
use crate::session::SessionInfoDto;

/// A command received from the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct WsCommand {
    /// Always `"command"`.
    #[serde(rename = "type")]
    pub message_type: String,
    /// Opaque correlation id, echoed in the response.
    pub id: Value,
    /// Dotted action name, e.g. `session.create`.
    pub action: String,
    /// Action-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// The response to one [`WsCommand`].
#[derive(Debug, Clone, Serialize)]
pub struct WsCommandResponse {
    /// Always `"response"`.
    #[serde(rename = "type")]
    pub message_type: &'static str,
    /// Correlation id from the command.
    pub id: Value,
    /// Whether the action succeeded.
    pub success: bool,
    /// Action-specific result.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure description when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WsCommandResponse {
    fn ok(id: Value, data: Option<Value>) -> Self {
        Self { message_type: "response", id, success: true, data, error: None }
    }

    fn err(id: Value, error: impl Into<String>) -> Self {
        Self { message_type: "response", id, success: false, data: None, error: Some(error.into()) }
    }
}

/// `stateUpdate` message: session list + update availability.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateUpdate<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    sessions: &'a [SessionInfoDto],
    #[serde(skip_serializing_if = "Option::is_none")]
    update: Option<UpdateInfo>,
}

/// Serialize the current `stateUpdate` message for `state`.
pub(crate) fn state_update_message(state: &AppState) -> String {
    let sessions = state.sessions.session_list();
    let message = StateUpdate {
        message_type: "stateUpdate",
        sessions: &sessions,
        update: state.update_info(),
    };
    serde_json::to_string(&message).expect("state update serialization cannot fail")
}

/// Serialize the `mainBrowser` status message.
fn main_browser_message(state: &AppState) -> String {
    json!({"type": "mainBrowser", "clientId": state.main_browser()}).to_string()
}

/// GET /ws/state — upgrade to the JSON state channel.
pub async fn state_ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.auth_ok(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_state_socket(socket, state))
}

async fn handle_state_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let registration = state.register_state_client(tx.clone());
    // The state channel's identity for main-browser designation.
    let channel_id = format!("state-{registration:08x}");
    log::info!("[state-ws] client connected: {channel_id}");

    // On open: current list + update availability, then main status.
    let _ = tx.send(state_update_message(&state));
    let _ = tx.send(main_browser_message(&state));

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            message = ws_rx.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(response) = handle_text(&state, &channel_id, &text).await {
                            let _ = tx.send(response);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("[state-ws] receive error: {e}");
                        break;
                    }
                }
            }
            () = state.shutdown.cancelled() => break,
        }
    }

    state.unregister_state_client(registration);
    // A vanishing main browser releases its designation implicitly.
    if state.release_main(&channel_id) {
        state.broadcast_text(&main_browser_message(&state));
    }
    drop(tx);
    writer.abort();
    log::info!("[state-ws] client disconnected: {channel_id}");
}

async fn handle_text(state: &Arc<AppState>, channel_id: &str, text: &str) -> Option<String> {
    let command: WsCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("[state-ws] unparseable message: {e}");
            return None;
        }
    };
    if command.message_type != "command" {
        log::warn!("[state-ws] unexpected message type {:?}", command.message_type);
        return None;
    }

    let response = dispatch_command(state, channel_id, command).await;
    Some(serde_json::to_string(&response).expect("response serialization cannot fail"))
}

/// Execute one command and build its response.
pub async fn dispatch_command(
    state: &Arc<AppState>,
    channel_id: &str,
    command: WsCommand,
) -> WsCommandResponse {
    let id = command.id.clone();
    let payload = command.payload;

    match command.action.as_str() {
        "session.create" => {
            let shell = payload["shell"].as_str().map(str::to_owned);
            let cols = payload["cols"].as_u64().unwrap_or(80) as u16;
            let rows = payload["rows"].as_u64().unwrap_or(24) as u16;
            let cwd = payload["cwd"].as_str().map(std::path::PathBuf::from);
            match state.sessions.create_session(shell, cols, rows, cwd).await {
                Ok(dto) => WsCommandResponse::ok(
                    id,
                    Some(serde_json::to_value(dto).expect("dto serialization cannot fail")),
                ),
                Err(e) => WsCommandResponse::err(id, e.to_string()),
            }
        }
        "session.close" => {
            let Some(session_id) = payload["sessionId"].as_str() else {
                return WsCommandResponse::err(id, "missing sessionId");
            };
            if state.sessions.close_session(session_id).await {
                WsCommandResponse::ok(id, None)
            } else {
                WsCommandResponse::err(id, format!("unknown session {session_id}"))
            }
        }
        "session.rename" => {
            let Some(session_id) = payload["sessionId"].as_str() else {
                return WsCommandResponse::err(id, "missing sessionId");
            };
            let name = payload["name"].as_str().map(str::to_owned);
            if state.sessions.rename_session(session_id, name).await {
                WsCommandResponse::ok(id, None)
            } else {
                WsCommandResponse::err(id, format!("rename failed for {session_id}"))
            }
        }
        "session.reorder" => {
            let ids: Option<Vec<String>> = payload["sessionIds"]
                .as_array()
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_owned)).collect());
            match ids {
                Some(ids) if state.sessions.reorder_sessions(&ids) => {
                    WsCommandResponse::ok(id, None)
                }
                Some(_) => WsCommandResponse::err(id, "reorder rejected: unknown session id"),
                None => WsCommandResponse::err(id, "missing sessionIds"),
            }
        }
        "settings.save" => {
            state.save_settings(payload["settings"].clone());
            WsCommandResponse::ok(id, None)
        }
        "browser.claimMain" => {
            let claimed = state.claim_main(channel_id);
            if claimed {
                state.broadcast_text(&main_browser_message(state));
            }
            WsCommandResponse::ok(id, Some(json!({ "isMain": claimed })))
        }
        "browser.releaseMain" => {
            let released = state.release_main(channel_id);
            if released {
                state.broadcast_text(&main_browser_message(state));
            }
            WsCommandResponse::ok(id, Some(json!({ "isMain": false })))
        }
        other => WsCommandResponse::err(id, format!("unknown action {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::manager::MuxConnectionManager;
    use crate::session::manager::{ManagerConfig, SessionManager};
    use tokio_util::sync::CancellationToken;

    fn app_state() -> Arc<AppState> {
        let sessions = SessionManager::new(ManagerConfig::default());
        let mux = MuxConnectionManager::new(&sessions);
        AppState::new(sessions, mux, CancellationToken::new(), None)
    }

    fn command(action: &str, payload: Value) -> WsCommand {
        WsCommand {
            message_type: "command".into(),
            id: json!(7),
            action: action.into(),
            payload,
        }
    }

    #[tokio::test]
    async fn test_unknown_action_fails() {
        let state = app_state();
        let response = dispatch_command(&state, "state-1", command("no.such.action", Value::Null)).await;
        assert!(!response.success);
        assert_eq!(response.id, json!(7));
        assert!(response.error.unwrap().contains("unknown action"));
    }

    #[tokio::test]
    async fn test_close_unknown_session_fails() {
        let state = app_state();
        let response = dispatch_command(
            &state,
            "state-1",
            command("session.close", json!({"sessionId": "ffffffff"})),
        )
        .await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_settings_save_succeeds() {
        let state = app_state();
        let response = dispatch_command(
            &state,
            "state-1",
            command("settings.save", json!({"settings": {"fontSize": 13}})),
        )
        .await;
        assert!(response.success);
        assert_eq!(state.settings()["fontSize"], 13);
    }

    #[tokio::test]
    async fn test_claim_and_release_main() {
        let state = app_state();
        let claimed = dispatch_command(&state, "state-1", command("browser.claimMain", Value::Null)).await;
        assert!(claimed.success);
        assert_eq!(claimed.data.unwrap()["isMain"], true);

        let rival = dispatch_command(&state, "state-2", command("browser.claimMain", Value::Null)).await;
        assert_eq!(rival.data.unwrap()["isMain"], false);

        let released = dispatch_command(&state, "state-1", command("browser.releaseMain", Value::Null)).await;
        assert!(released.success);
        assert_eq!(state.main_browser(), None);
    }

    #[tokio::test]
    async fn test_state_update_message_shape() {
        let state = app_state();
        let text = state_update_message(&state);
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "stateUpdate");
        assert!(value["sessions"].as_array().unwrap().is_empty());
        assert!(value.get("update").is_none());
    }

    #[tokio::test]
    async fn test_command_parse_round_trip() {
        let text = r#"{"type":"command","id":"a1","action":"session.reorder","payload":{"sessionIds":[]}}"#;
        let command: WsCommand = serde_json::from_str(text).unwrap();
        assert_eq!(command.action, "session.reorder");
        assert_eq!(command.id, json!("a1"));
    }
}
