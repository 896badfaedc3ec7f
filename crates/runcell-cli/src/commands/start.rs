//! `runcell start` — Release a created container into its program.

use clap::Args;
use runcell_runtime::engine::Engine;

/// Arguments for the `start` command.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Container id.
    pub id: String,
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the container is not `created` or its init is gone.
pub fn execute(engine: &Engine, args: &StartArgs) -> anyhow::Result<u8> {
    let id = super::parse_id(&args.id)?;
    let _ = engine.start(&id)?;
    Ok(0)
}
