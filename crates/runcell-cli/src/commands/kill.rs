//! `runcell kill` — Send a signal to a container.

use clap::Args;
use nix::sys::signal::Signal;
use runcell_runtime::engine::Engine;
use runcell_runtime::signal;

/// Arguments for the `kill` command.
#[derive(Args, Debug)]
pub struct KillArgs {
    /// Container id.
    pub id: String,

    /// Signal name or number.
    #[arg(default_value = "SIGTERM", value_parser = parse_signal)]
    pub signal: Signal,

    /// Signal every process in the container's cgroup.
    #[arg(short, long)]
    pub all: bool,
}

fn parse_signal(input: &str) -> Result<Signal, String> {
    signal::parse(input).ok_or_else(|| format!("unknown signal '{input}'"))
}

/// Executes the `kill` command.
///
/// # Errors
///
/// Returns an error if the container has no process or delivery fails.
pub fn execute(engine: &Engine, args: &KillArgs) -> anyhow::Result<u8> {
    let id = super::parse_id(&args.id)?;
    engine.kill(&id, args.signal, args.all)?;
    Ok(0)
}
