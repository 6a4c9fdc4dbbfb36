//! Browser-facing HTTP/WebSocket server.
//!
//! Two WebSocket endpoints per browser client:
//!
//! - `/ws` — the binary mux channel ([`ws`]): terminal output in, input
//!   and hints out, one frame format for everything.
//! - `/ws/state` — the JSON state channel ([`state_channel`]): session
//!   list, command/response pairs, update notifications.
//!
//! When auth is enabled (an auth token is configured), both endpoints
//! validate the `mt_session` cookie before upgrading and answer 401
//! otherwise.

pub mod state_channel;
pub mod ws;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use axum::http::HeaderMap;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::mux::manager::MuxConnectionManager;
use crate::session::listeners::ListenerHandle;
use crate::session::manager::SessionManager;

/// Cookie carrying the browser's session token when auth is enabled.
const AUTH_COOKIE: &str = "mt_session";

/// An available update, pushed to browsers through the state channel.
///
/// Download and apply are external collaborators; the host only relays
/// availability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateInfo {
    /// Version string of the available update.
    pub version: String,
    /// Where to fetch it, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Shared server state behind every handler.
pub struct AppState {
    /// Session registry.
    pub sessions: Arc<SessionManager>,
    /// Browser fan-out.
    pub mux: Arc<MuxConnectionManager>,
    /// Host lifetime token; cancellation closes every connection with the
    /// ServerShutdown code.
    pub shutdown: CancellationToken,
    /// Auth token; `None` disables the cookie check.
    auth_token: Option<String>,
    /// Opaque settings blob persisted by `settings.save`.
    settings: StdMutex<serde_json::Value>,
    /// Which state-channel client is the designated main browser.
    main_browser: StdMutex<Option<String>>,
    /// Latest known update availability.
    update: StdMutex<Option<UpdateInfo>>,
    /// Connected state channels, keyed by an internal id.
    state_clients: StdMutex<HashMap<u64, UnboundedSender<String>>>,
    next_state_client: AtomicU64,
    /// Keeps the session state subscription alive.
    _state_sub: StdMutex<Option<ListenerHandle>>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Wire up the shared state and subscribe it to session changes.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionManager>,
        mux: Arc<MuxConnectionManager>,
        shutdown: CancellationToken,
        auth_token: Option<String>,
    ) -> Arc<Self> {
        let state = Arc::new(Self {
            sessions: Arc::clone(&sessions),
            mux,
            shutdown,
            auth_token,
            settings: StdMutex::new(serde_json::Value::Null),
            main_browser: StdMutex::new(None),
            update: StdMutex::new(None),
            state_clients: StdMutex::new(HashMap::new()),
            next_state_client: AtomicU64::new(1),
            _state_sub: StdMutex::new(None),
        });

        // Push a fresh session list to every state channel on any change.
        let weak: Weak<AppState> = Arc::downgrade(&state);
        let sub = sessions.on_state_changed(move |_: &()| {
            if let Some(state) = weak.upgrade() {
                state.broadcast_state_update();
            }
        });
        *state._state_sub.lock().expect("sub mutex poisoned") = Some(sub);

        state
    }

    /// Whether this request may proceed (cookie check when auth enabled).
    #[must_use]
    pub fn auth_ok(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.auth_token else {
            return true;
        };
        headers
            .get_all(axum::http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|cookies| cookies.split(';'))
            .filter_map(|cookie| cookie.trim().split_once('='))
            .any(|(name, value)| name == AUTH_COOKIE && value == expected)
    }

    /// Current settings blob.
    #[must_use]
    pub fn settings(&self) -> serde_json::Value {
        self.settings.lock().expect("settings mutex poisoned").clone()
    }

    /// Store the settings blob (REST persistence is out of scope).
    pub fn save_settings(&self, value: serde_json::Value) {
        *self.settings.lock().expect("settings mutex poisoned") = value;
    }

    /// Latest update availability.
    #[must_use]
    pub fn update_info(&self) -> Option<UpdateInfo> {
        self.update.lock().expect("update mutex poisoned").clone()
    }

    /// Record update availability and notify every state channel.
    pub fn set_update_info(&self, info: Option<UpdateInfo>) {
        *self.update.lock().expect("update mutex poisoned") = info;
        self.broadcast_state_update();
    }

    /// The designated main browser, if any.
    #[must_use]
    pub fn main_browser(&self) -> Option<String> {
        self.main_browser.lock().expect("main mutex poisoned").clone()
    }

    /// Try to claim main-browser status. First claimant wins; reclaiming
    /// your own designation succeeds.
    pub fn claim_main(&self, client_id: &str) -> bool {
        let mut main = self.main_browser.lock().expect("main mutex poisoned");
        match main.as_deref() {
            None => {
                *main = Some(client_id.to_owned());
                true
            }
            Some(current) => current == client_id,
        }
    }

    /// Release main-browser status if held by `client_id`.
    pub fn release_main(&self, client_id: &str) -> bool {
        let mut main = self.main_browser.lock().expect("main mutex poisoned");
        if main.as_deref() == Some(client_id) {
            *main = None;
            true
        } else {
            false
        }
    }

    /// Register a state channel's outbound sender; returns its id.
    pub fn register_state_client(&self, tx: UnboundedSender<String>) -> u64 {
        let id = self.next_state_client.fetch_add(1, Ordering::Relaxed);
        self.state_clients
            .lock()
            .expect("state clients mutex poisoned")
            .insert(id, tx);
        id
    }

    /// Remove a state channel on disconnect.
    pub fn unregister_state_client(&self, id: u64) {
        self.state_clients
            .lock()
            .expect("state clients mutex poisoned")
            .remove(&id);
    }

    /// Send a JSON text message to every connected state channel.
    pub fn broadcast_text(&self, text: &str) {
        let clients = self.state_clients.lock().expect("state clients mutex poisoned");
        for tx in clients.values() {
            let _ = tx.send(text.to_owned());
        }
    }

    /// Push the current session list + update availability everywhere.
    pub fn broadcast_state_update(&self) {
        let message = state_channel::state_update_message(self);
        self.broadcast_text(&message);
    }
}

/// Build the router for both WebSocket endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws::mux_ws_handler))
        .route("/ws/state", get(state_channel::state_ws_handler))
        .with_state(state)
}
