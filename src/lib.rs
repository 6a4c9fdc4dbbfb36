// Library modules
pub mod constants;
pub mod host;
pub mod ipc;
pub mod mux;
pub mod pool;
pub mod server;
pub mod session;
pub mod ttyhost;
pub mod version;

// Re-export commonly used types
pub use pool::BufferPool;
pub use session::manager::SessionManager;
pub use session::{ForegroundProcess, Session, SessionInfoDto};

/// The current version of MidTerm, derived from Cargo.toml.
///
/// This is both the mt host version and the version the bundled `mthost`
/// binary reports; discovery uses it as the expected ttyhost version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
