//! Registry of live sessions and their ttyhost clients.
//!
//! The manager owns every [`TtyHostClient`] keyed by session id, enforces
//! the hard session cap, and broadcasts state to listeners. A single
//! "state changed" event is sufficient for UIs; listeners poll the full
//! list. Output, session-closed and foreground events have their own
//! listener sets consumed by the mux fan-out.
//!
//! All ttyhost events funnel through one channel into a dispatch task;
//! a client whose read loop dies emits `Disconnected`, and the dispatch
//! task reaps the session.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use crate::constants::{
    CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, DISCOVERY_CONNECT_TIMEOUT, DISCOVERY_INFO_TIMEOUT,
    ENDPOINT_WAIT_INITIAL, ENDPOINT_WAIT_MAX, ENDPOINT_WAIT_TOTAL, MAX_SESSIONS, REQUEST_TIMEOUT,
    SHUTDOWN_CLOSE_TIMEOUT,
};
use crate::ipc::endpoint::{self, Endpoint};
use crate::session::client::{ClientState, TtyHostClient, TtyHostEvent};
use crate::session::host_process::{self, SpawnRequest};
use crate::session::listeners::{ListenerHandle, Listeners};
use crate::session::{generate_session_id, ForegroundProcess, Session, SessionInfoDto};
use crate::version;

/// Per-attempt connect window after a spawn.
const SPAWN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A PTY output event fanned out to mux subscribers.
#[derive(Debug, Clone)]
pub struct OutputEvent {
    /// Originating session.
    pub session_id: String,
    /// Terminal width the output was produced under.
    pub cols: u16,
    /// Terminal height the output was produced under.
    pub rows: u16,
    /// Shared output bytes.
    pub data: Bytes,
}

/// A foreground-process change fanned out to mux subscribers.
#[derive(Debug, Clone)]
pub struct ForegroundEvent {
    /// Originating session.
    pub session_id: String,
    /// New foreground process.
    pub foreground: ForegroundProcess,
}

/// How a discovered endpoint was categorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Compatible and responsive; registered.
    Connected,
    /// Version below the minimum; killed and removed.
    Incompatible(String),
    /// Connected but GetInfo failed; killed and removed.
    Unresponsive,
    /// Nothing listening; stale socket removed.
    NoProcess,
}

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Version the bundled ttyhost binary reports.
    pub expected_version: String,
    /// Oldest adoptable ttyhost version.
    pub min_compatible_version: String,
    /// Run shells as this user (privilege drop).
    pub as_user: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            expected_version: crate::VERSION.to_owned(),
            min_compatible_version: crate::constants::MIN_COMPATIBLE_PTY_VERSION.to_owned(),
            as_user: None,
        }
    }
}

/// Owner of all live sessions.
pub struct SessionManager {
    config: ManagerConfig,
    clients: StdMutex<HashMap<String, Arc<TtyHostClient>>>,
    sessions: StdMutex<HashMap<String, Session>>,
    orders: StdMutex<HashMap<String, u32>>,
    order_counter: AtomicU32,
    log_level: AtomicU8,
    event_tx: UnboundedSender<TtyHostEvent>,
    state_listeners: Listeners<()>,
    output_listeners: Listeners<OutputEvent>,
    closed_listeners: Listeners<String>,
    foreground_listeners: Listeners<ForegroundEvent>,
    dispatch_task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager and start its event dispatch task.
    #[must_use]
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<TtyHostEvent>();

        let manager = Arc::new(Self {
            config,
            clients: StdMutex::new(HashMap::new()),
            sessions: StdMutex::new(HashMap::new()),
            orders: StdMutex::new(HashMap::new()),
            order_counter: AtomicU32::new(0),
            log_level: AtomicU8::new(log_level_byte(log::max_level())),
            event_tx,
            state_listeners: Listeners::new(),
            output_listeners: Listeners::new(),
            closed_listeners: Listeners::new(),
            foreground_listeners: Listeners::new(),
            dispatch_task: StdMutex::new(None),
        });

        let weak: Weak<SessionManager> = Arc::downgrade(&manager);
        let task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.handle_event(event).await;
            }
        });
        *manager.dispatch_task.lock().expect("task mutex poisoned") = Some(task);

        manager
    }

    // ─── Listener surfaces ─────────────────────────────────────────────────

    /// Subscribe to coarse state changes; poll the session list on fire.
    pub fn on_state_changed(&self, cb: impl Fn(&()) + Send + Sync + 'static) -> ListenerHandle {
        self.state_listeners.subscribe(cb)
    }

    /// Subscribe to raw PTY output events.
    pub fn on_output(&self, cb: impl Fn(&OutputEvent) + Send + Sync + 'static) -> ListenerHandle {
        self.output_listeners.subscribe(cb)
    }

    /// Subscribe to session-closed events (payload: session id).
    pub fn on_session_closed(&self, cb: impl Fn(&String) + Send + Sync + 'static) -> ListenerHandle {
        self.closed_listeners.subscribe(cb)
    }

    /// Subscribe to foreground-process changes.
    pub fn on_foreground_changed(
        &self,
        cb: impl Fn(&ForegroundEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.foreground_listeners.subscribe(cb)
    }

    // ─── Queries ───────────────────────────────────────────────────────────

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.lock().expect("sessions mutex poisoned").len()
    }

    /// Snapshot of one session.
    #[must_use]
    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.sessions.lock().expect("sessions mutex poisoned").get(id).cloned()
    }

    /// Session list in display order, with the manager's fresh order view.
    #[must_use]
    pub fn session_list(&self) -> Vec<SessionInfoDto> {
        let sessions = self.sessions.lock().expect("sessions mutex poisoned");
        let orders = self.orders.lock().expect("orders mutex poisoned");
        let mut list: Vec<SessionInfoDto> = sessions
            .values()
            .map(|s| SessionInfoDto::from_session(s, orders.get(&s.id).copied().unwrap_or(u32::MAX)))
            .collect();
        list.sort_by_key(|dto| (dto.order, dto.id.clone()));
        list
    }

    /// Per-session upload staging directory, created on first use.
    pub fn drops_dir(&self, session_id: &str) -> Result<PathBuf> {
        let dir = drops_dir_path(session_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create drops dir: {}", dir.display()))?;
        Ok(dir)
    }

    // ─── Lifecycle operations ──────────────────────────────────────────────

    /// Spawn a ttyhost and register the resulting session.
    ///
    /// On any failure along the spawn→endpoint→connect→info path the
    /// spawned process is killed and the error returned.
    pub async fn create_session(
        &self,
        shell: Option<String>,
        cols: u16,
        rows: u16,
        cwd: Option<PathBuf>,
    ) -> Result<SessionInfoDto> {
        if self.session_count() >= MAX_SESSIONS {
            bail!("session limit reached ({MAX_SESSIONS})");
        }

        let session_id = loop {
            let id = generate_session_id();
            if !self.clients.lock().expect("clients mutex poisoned").contains_key(&id) {
                break id;
            }
        };

        endpoint::ensure_transport_dir()?;
        let mut spawned = host_process::spawn_ttyhost(&SpawnRequest {
            session_id: session_id.clone(),
            shell,
            cwd,
            cols,
            rows,
            as_user: self.config.as_user.clone(),
        })
        .await?;
        let pid = spawned.pid;

        // Kill the spawned process on every failure exit until registration
        // succeeds and the guard is defused.
        let kill_guard = scopeguard::guard(pid, |pid| {
            log::warn!("[session] killing ttyhost {pid} after failed session setup");
            host_process::kill_pid(pid);
        });

        let socket_path = self.wait_for_endpoint(&session_id, pid).await?;

        let client = Arc::new(TtyHostClient::new(session_id.clone(), self.event_tx.clone()));
        let mut connected = false;
        for attempt in 1..=CONNECT_ATTEMPTS {
            match client.connect(&socket_path, SPAWN_CONNECT_TIMEOUT).await {
                Ok(()) => {
                    connected = true;
                    break;
                }
                Err(e) => {
                    log::debug!(
                        "[session] {session_id}: connect attempt {attempt}/{CONNECT_ATTEMPTS} failed: {e}"
                    );
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
        if !connected {
            bail!("could not connect to ttyhost for session {session_id}");
        }

        let mut session = client.get_info(REQUEST_TIMEOUT).await?;
        session.id.clone_from(&session_id);

        let order = self.order_counter.fetch_add(1, Ordering::SeqCst);
        let order_byte = order.min(255) as u8;
        session.order = order_byte;

        self.clients
            .lock()
            .expect("clients mutex poisoned")
            .insert(session_id.clone(), Arc::clone(&client));
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .insert(session_id.clone(), session.clone());
        self.orders
            .lock()
            .expect("orders mutex poisoned")
            .insert(session_id.clone(), order);

        // Registered: the process now belongs to the session.
        let _pid = scopeguard::ScopeGuard::into_inner(kill_guard);

        // Reap the child when it eventually exits so it never lingers as a
        // zombie; the blocking thread is bounded by the session cap.
        if let Some(mut child) = spawned.child.take() {
            tokio::task::spawn_blocking(move || {
                let _ = child.wait();
            });
        }

        // Push current log level and assigned order; neither is fatal.
        let level = self.log_level.load(Ordering::Relaxed);
        if !client.set_log_level(level).await {
            log::warn!("[session] {session_id}: could not push log level");
        }
        if !client.set_order(order_byte).await {
            log::warn!("[session] {session_id}: could not push order");
        }

        self.state_listeners.emit(&());
        log::info!("[session] created {session_id} (pid {pid}, order {order})");
        Ok(SessionInfoDto::from_session(&session, order))
    }

    /// Wait for the session's endpoint to appear, backoff 50 ms doubling
    /// to 500 ms, bounded by an overall window.
    async fn wait_for_endpoint(&self, session_id: &str, pid: u32) -> Result<PathBuf> {
        let path = endpoint::socket_path(session_id, pid)?;
        let started = std::time::Instant::now();
        let mut delay = ENDPOINT_WAIT_INITIAL;
        loop {
            if path.exists() {
                return Ok(path);
            }
            if started.elapsed() >= ENDPOINT_WAIT_TOTAL {
                bail!("endpoint never appeared for session {session_id}: {}", path.display());
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(ENDPOINT_WAIT_MAX);
        }
    }

    /// Adopt orphaned ttyhosts left over from a previous mt run.
    ///
    /// Invoked once at startup, before the server accepts clients.
    pub async fn discover_existing_sessions(&self) {
        let dir = endpoint::transport_dir();
        let endpoints = match endpoint::enumerate_endpoints(&dir) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                log::warn!("[session] endpoint enumeration failed: {e}");
                return;
            }
        };

        let mut adopted = 0usize;
        let mut max_order: Option<u32> = None;
        for ep in endpoints {
            let outcome = self.adopt_endpoint(&ep).await;
            log::info!(
                "[session] discovery {} (pid {}): {:?}",
                ep.session_id,
                ep.pid,
                outcome
            );
            if outcome == DiscoveryOutcome::Connected {
                adopted += 1;
                let order = self
                    .orders
                    .lock()
                    .expect("orders mutex poisoned")
                    .get(&ep.session_id)
                    .copied();
                if let Some(order) = order {
                    max_order = Some(max_order.map_or(order, |m| m.max(order)));
                }
            }
        }

        // Avoid order collisions with adopted sessions.
        if let Some(max) = max_order {
            self.order_counter.store(max + 1, Ordering::SeqCst);
        }
        if adopted > 0 {
            self.state_listeners.emit(&());
        }
    }

    /// Probe one discovered endpoint and categorize it.
    pub async fn adopt_endpoint(&self, ep: &Endpoint) -> DiscoveryOutcome {
        let client = Arc::new(TtyHostClient::new(ep.session_id.clone(), self.event_tx.clone()));

        if client.connect(&ep.path, DISCOVERY_CONNECT_TIMEOUT).await.is_err() {
            // Named pipes are self-cleaning; socket files are not.
            let _ = std::fs::remove_file(&ep.path);
            return DiscoveryOutcome::NoProcess;
        }

        let session = match client.get_info(DISCOVERY_INFO_TIMEOUT).await {
            Ok(session) => session,
            Err(e) => {
                log::warn!("[session] discovery {}: getInfo failed: {e}", ep.session_id);
                client.dispose().await;
                kill_blocking(ep.pid).await;
                let _ = std::fs::remove_file(&ep.path);
                return DiscoveryOutcome::Unresponsive;
            }
        };

        if !version::is_compatible(
            &session.version,
            &self.config.expected_version,
            &self.config.min_compatible_version,
        ) {
            let found = session.version.clone();
            client.dispose().await;
            kill_blocking(ep.pid).await;
            let _ = std::fs::remove_file(&ep.path);
            return DiscoveryOutcome::Incompatible(found);
        }

        // Adopt: take the ttyhost's self-reported order.
        let order = u32::from(session.order);
        self.clients
            .lock()
            .expect("clients mutex poisoned")
            .insert(ep.session_id.clone(), client);
        self.sessions
            .lock()
            .expect("sessions mutex poisoned")
            .insert(ep.session_id.clone(), session);
        self.orders
            .lock()
            .expect("orders mutex poisoned")
            .insert(ep.session_id.clone(), order);
        DiscoveryOutcome::Connected
    }

    /// Close a session explicitly. Idempotent: false when not present.
    pub async fn close_session(&self, id: &str) -> bool {
        let client = self.clients.lock().expect("clients mutex poisoned").remove(id);
        let session = self.sessions.lock().expect("sessions mutex poisoned").remove(id);
        self.orders.lock().expect("orders mutex poisoned").remove(id);

        let Some(client) = client else {
            return false;
        };

        remove_drops_dir(id);

        if client.state() == ClientState::Ready && !client.close(REQUEST_TIMEOUT).await {
            // The ack did not come; make sure the process goes away.
            if let Some(session) = &session {
                kill_blocking(session.host_pid).await;
            }
        }
        client.dispose().await;

        self.closed_listeners.emit(&id.to_owned());
        self.state_listeners.emit(&());
        log::info!("[session] closed {id}");
        true
    }

    /// Rename a session (manual name); `None` clears it.
    pub async fn rename_session(&self, id: &str, name: Option<String>) -> bool {
        let Some(client) = self.client(id) else {
            return false;
        };
        if !client.set_name(name.as_deref()).await {
            return false;
        }
        if let Some(session) = self.sessions.lock().expect("sessions mutex poisoned").get_mut(id) {
            session.title.clone_from(&name);
            session.has_manual_name = name.is_some();
        }
        self.state_listeners.emit(&());
        true
    }

    /// Apply a new display order.
    ///
    /// Fails without side effects when any id is unknown. The local order
    /// map updates synchronously (UI-responsive); the per-ttyhost order
    /// bytes are persisted asynchronously, logging individual failures.
    pub fn reorder_sessions(self: &Arc<Self>, ids: &[String]) -> bool {
        {
            let sessions = self.sessions.lock().expect("sessions mutex poisoned");
            if ids.iter().any(|id| !sessions.contains_key(id)) {
                return false;
            }
        }

        {
            let mut orders = self.orders.lock().expect("orders mutex poisoned");
            for (position, id) in ids.iter().enumerate() {
                orders.insert(id.clone(), position as u32);
            }
        }
        self.order_counter.store(ids.len() as u32, Ordering::SeqCst);
        self.state_listeners.emit(&());

        let manager = Arc::clone(self);
        let ids: Vec<String> = ids.to_vec();
        tokio::spawn(async move {
            for (position, id) in ids.iter().enumerate() {
                let Some(client) = manager.client(id) else { continue };
                let byte = position.min(255) as u8;
                if !client.set_order(byte).await {
                    log::warn!("[session] {id}: could not persist order {byte}");
                }
            }
        });
        true
    }

    /// Forward raw input to a session. Missing sessions are ignored.
    pub async fn send_input(&self, id: &str, data: &[u8]) {
        if let Some(client) = self.client(id) {
            client.send_input(data).await;
        } else {
            log::debug!("[session] input for unknown session {id}");
        }
    }

    /// Resize a session's PTY.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        let Some(client) = self.client(id) else {
            return false;
        };
        let ok = client.resize(cols, rows).await;
        if ok {
            if let Some(session) = self.sessions.lock().expect("sessions mutex poisoned").get_mut(id)
            {
                session.cols = cols;
                session.rows = rows;
            }
        }
        ok
    }

    /// Fetch a session's scrollback from its ttyhost.
    pub async fn get_buffer(&self, id: &str) -> Option<Vec<u8>> {
        self.client(id)?.get_buffer().await
    }

    /// Push a log severity to every ttyhost and remember it for new ones.
    pub fn set_log_level(self: &Arc<Self>, level: u8) {
        self.log_level.store(level, Ordering::Relaxed);
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let clients: Vec<Arc<TtyHostClient>> = manager
                .clients
                .lock()
                .expect("clients mutex poisoned")
                .values()
                .map(Arc::clone)
                .collect();
            for client in clients {
                if !client.set_log_level(level).await {
                    log::warn!("[session] {}: could not push log level", client.session_id());
                }
            }
        });
    }

    /// Graceful shutdown: Close every ttyhost (2 s ack window each),
    /// dispose the clients, and kill whatever is still alive afterwards.
    pub async fn shutdown(&self) {
        let clients: Vec<Arc<TtyHostClient>> = self
            .clients
            .lock()
            .expect("clients mutex poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        let sessions: Vec<Session> = self
            .sessions
            .lock()
            .expect("sessions mutex poisoned")
            .drain()
            .map(|(_, s)| s)
            .collect();
        self.orders.lock().expect("orders mutex poisoned").clear();

        for client in &clients {
            if client.state() == ClientState::Ready {
                let _ = client.close(SHUTDOWN_CLOSE_TIMEOUT).await;
            }
            client.dispose().await;
        }

        // Grace period, then kill stragglers.
        tokio::time::sleep(Duration::from_millis(500)).await;
        for session in sessions {
            if host_process::pid_alive(session.host_pid) {
                log::warn!(
                    "[session] ttyhost {} (session {}) survived close; killing",
                    session.host_pid,
                    session.id
                );
                kill_blocking(session.host_pid).await;
            }
            remove_drops_dir(&session.id);
        }

        if let Some(task) = self.dispatch_task.lock().expect("task mutex poisoned").take() {
            task.abort();
        }
    }

    fn client(&self, id: &str) -> Option<Arc<TtyHostClient>> {
        self.clients.lock().expect("clients mutex poisoned").get(id).map(Arc::clone)
    }

    /// React to one ttyhost event on the dispatch task.
    async fn handle_event(&self, event: TtyHostEvent) {
        match event {
            TtyHostEvent::Output { session_id, cols, rows, data } => {
                if let Some(session) =
                    self.sessions.lock().expect("sessions mutex poisoned").get_mut(&session_id)
                {
                    session.cols = cols;
                    session.rows = rows;
                }
                self.output_listeners.emit(&OutputEvent {
                    session_id,
                    cols,
                    rows,
                    data: Bytes::from(data),
                });
            }
            TtyHostEvent::StateChanged { session_id, change } => {
                if let Some(session) =
                    self.sessions.lock().expect("sessions mutex poisoned").get_mut(&session_id)
                {
                    session.is_running = change.is_running;
                    session.exit_code = change.exit_code;
                }
                self.state_listeners.emit(&());
            }
            TtyHostEvent::ProcessEvent { session_id, payload } => {
                log::debug!("[session] {session_id}: process event: {payload}");
            }
            TtyHostEvent::ForegroundChanged { session_id, foreground } => {
                if let Some(session) =
                    self.sessions.lock().expect("sessions mutex poisoned").get_mut(&session_id)
                {
                    session.foreground = Some(foreground.clone());
                }
                self.foreground_listeners.emit(&ForegroundEvent { session_id, foreground });
            }
            TtyHostEvent::Disconnected { session_id } => {
                self.reap_session(&session_id).await;
            }
        }
    }

    /// Remove a session whose transport died.
    async fn reap_session(&self, id: &str) {
        let client = self.clients.lock().expect("clients mutex poisoned").remove(id);
        let existed = self.sessions.lock().expect("sessions mutex poisoned").remove(id).is_some();
        self.orders.lock().expect("orders mutex poisoned").remove(id);

        if let Some(client) = client {
            client.dispose().await;
        }
        if existed {
            remove_drops_dir(id);
            log::info!("[session] reaped {id}");
            self.closed_listeners.emit(&id.to_owned());
            self.state_listeners.emit(&());
        }
    }
}

/// The per-session drops directory: `<tempRoot>/mt-drops/<sessionId>`.
#[must_use]
pub fn drops_dir_path(session_id: &str) -> PathBuf {
    std::env::temp_dir().join("mt-drops").join(session_id)
}

fn remove_drops_dir(session_id: &str) {
    let dir = drops_dir_path(session_id);
    if dir.exists() {
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            log::warn!("[session] could not remove drops dir {}: {e}", dir.display());
        }
    }
}

/// Kill a pid without blocking the async runtime (the escalation sleeps).
async fn kill_blocking(pid: u32) {
    let _ = tokio::task::spawn_blocking(move || host_process::kill_pid(pid)).await;
}

/// Map the host's `log` level filter to the one-byte wire severity.
fn log_level_byte(level: log::LevelFilter) -> u8 {
    match level {
        log::LevelFilter::Off => 0,
        log::LevelFilter::Error => 1,
        log::LevelFilter::Warn => 2,
        log::LevelFilter::Info => 3,
        log::LevelFilter::Debug => 4,
        log::LevelFilter::Trace => 5,
    }
}
