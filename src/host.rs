//! Host process wiring and lifetime.
//!
//! Startup: discover orphaned ttyhosts, build the mux fan-out, serve the
//! two WebSocket endpoints. Shutdown is cooperative and strictly ordered:
//! the lifetime token cancels → the fan-out drains and exits → every mux
//! client is disposed (browsers get a ServerShutdown close) → every
//! ttyhost client is disposed (Close with a short ack window) → ttyhosts
//! that survive the grace period are killed.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::mux::manager::MuxConnectionManager;
use crate::server::{self, AppState};
use crate::session::host_process;
use crate::session::manager::{ManagerConfig, SessionManager};

/// Host configuration from the command line.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address the HTTP/WebSocket server binds.
    pub listen: SocketAddr,
    /// Browser auth token; `None` disables the cookie check.
    pub auth_token: Option<String>,
    /// Run shells as this user (privilege drop; requires mt to be
    /// privileged).
    pub as_user: Option<String>,
}

/// Run the host until a shutdown signal arrives.
pub async fn run(config: HostConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_watcher(shutdown.clone());

    // The expected ttyhost version is whatever the bundled binary
    // reports; fall back to our own version in development trees where
    // the probe cannot run.
    let expected_version = host_process::probe_version().unwrap_or_else(|e| {
        log::warn!("[host] could not probe ttyhost version: {e}");
        crate::VERSION.to_owned()
    });

    let sessions = SessionManager::new(ManagerConfig {
        expected_version,
        min_compatible_version: crate::constants::MIN_COMPATIBLE_PTY_VERSION.to_owned(),
        as_user: config.as_user.clone(),
    });
    sessions.discover_existing_sessions().await;
    log::info!("[host] discovery complete, {} session(s) adopted", sessions.session_count());

    let mux = MuxConnectionManager::new(&sessions);
    let state = AppState::new(
        Arc::clone(&sessions),
        Arc::clone(&mux),
        shutdown.clone(),
        config.auth_token.clone(),
    );

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("bind {}", config.listen))?;
    log::info!("[host] listening on http://{}", config.listen);

    let graceful = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await
        .context("serve")?;

    // Ordered teardown; see the module docs.
    log::info!("[host] shutting down");
    mux.shutdown().await;
    sessions.shutdown().await;
    log::info!("[host] shutdown complete");
    Ok(())
}

/// Cancel the lifetime token on SIGINT or SIGTERM.
fn spawn_signal_watcher(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    log::error!("[host] cannot install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        log::info!("[host] shutdown signal received");
        token.cancel();
    });
}
