//! `runcell delete` — Delete a container.

use clap::Args;
use runcell_runtime::engine::Engine;

/// Arguments for the `delete` command.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Container id.
    pub id: String,

    /// Kill a running container before deleting it.
    #[arg(short, long)]
    pub force: bool,
}

/// Executes the `delete` command.
///
/// # Errors
///
/// Returns an error if the container does not exist, or is running and
/// `--force` was not given.
pub fn execute(engine: &Engine, args: &DeleteArgs) -> anyhow::Result<u8> {
    let id = super::parse_id(&args.id)?;
    engine.delete(&id, args.force)?;
    Ok(0)
}
