//! mt — the MidTerm host process.
//!
//! Brokers every byte between browser clients and the per-session
//! `mthost` subprocesses. See the `midterm` library for the core.

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system
/// allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Browser-accessed terminal multiplexer host.
#[derive(Debug, Parser)]
#[command(name = "mt", version, about)]
struct Cli {
    /// Address for the HTTP/WebSocket server.
    #[arg(long, default_value = "127.0.0.1:7890")]
    listen: SocketAddr,

    /// Require this token in the browser's session cookie.
    #[arg(long)]
    auth_token: Option<String>,

    /// Run session shells as this user (requires running mt privileged).
    #[arg(long)]
    as_user: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    log::info!("mt {} starting", midterm::VERSION);
    midterm::host::run(midterm::host::HostConfig {
        listen: cli.listen,
        auth_token: cli.auth_token,
        as_user: cli.as_user,
    })
    .await
}
