//! `runcell state` — Print a container's OCI state document.

use clap::Args;
use runcell_runtime::engine::Engine;

/// Arguments for the `state` command.
#[derive(Args, Debug)]
pub struct StateArgs {
    /// Container id.
    pub id: String,
}

/// Executes the `state` command.
///
/// # Errors
///
/// Returns an error if the container does not exist.
pub fn execute(engine: &Engine, args: &StateArgs) -> anyhow::Result<u8> {
    let id = super::parse_id(&args.id)?;
    let state = engine.state(&id)?;
    println!("{}", serde_json::to_string_pretty(&state.oci_state())?);
    Ok(0)
}
