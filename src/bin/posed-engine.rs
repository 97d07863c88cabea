//! Per-session animation compute worker.
//!
//! Spawned by a `posed` session with the command- and slot-channel fds
//! inherited; not meant to be launched by hand. Exit codes: 0 clean
//! shutdown, 1 animator initialization failure, 2 unexpected error, 3
//! parent channel lost.

use std::process::ExitCode;

use clap::Parser;
use posed::engine::{self, EngineConfig};

#[derive(Parser, Debug)]
#[command(name = "posed-engine", version, about)]
struct Args {
    /// Session id, used for log context.
    #[arg(long)]
    session: String,

    /// Animator kind; omit to bind through the first command instead.
    #[arg(long)]
    kind: Option<String>,

    /// Motion source reference; omit to bind through the first command.
    #[arg(long)]
    source: Option<String>,

    /// Target frame cadence.
    #[arg(long, default_value_t = posed::DEFAULT_FPS)]
    fps: u32,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let code = engine::run(EngineConfig {
        session_id: args.session,
        kind: args.kind,
        source: args.source,
        target_fps: args.fps,
    });
    ExitCode::from(code as u8)
}
