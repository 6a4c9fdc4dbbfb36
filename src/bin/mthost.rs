//! mthost — the per-session ttyhost subprocess.
//!
//! Owns one pseudo-terminal, serves the IPC endpoint
//! `mthost-<session>-<pid>` and keeps the session alive across mt
//! restarts. Spawned by mt; not meant to be run by hand.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

/// Per-session PTY host for the MidTerm multiplexer.
#[derive(Debug, Parser)]
#[command(name = "mthost", version)]
struct Args {
    /// Session id assigned by mt (8 hex characters).
    #[arg(long)]
    session: String,

    /// Initial terminal width.
    #[arg(long)]
    cols: u16,

    /// Initial terminal height.
    #[arg(long)]
    rows: u16,

    /// Shell to run; defaults to $SHELL, then /bin/sh.
    #[arg(long)]
    shell: Option<String>,

    /// Working directory for the shell.
    #[arg(long)]
    cwd: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !midterm::session::is_valid_session_id(&args.session) {
        anyhow::bail!("malformed session id {:?}", args.session);
    }

    midterm::ttyhost::run(&midterm::ttyhost::TtyHostArgs {
        session_id: args.session,
        shell: args.shell,
        cwd: args.cwd,
        cols: args.cols,
        rows: args.rows,
    })
}
