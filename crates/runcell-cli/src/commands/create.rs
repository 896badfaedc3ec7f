//! `runcell create` — Create a container and leave it waiting for `start`.

use std::path::PathBuf;

use clap::Args;
use runcell_runtime::engine::{CreateOptions, Engine};

/// Arguments for the `create` command.
#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Container id.
    pub id: String,

    /// Bundle directory holding `config.json`.
    #[command(flatten)]
    pub bundle: super::BundleArgs,

    /// File to write the container init's pid to.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

/// Executes the `create` command.
///
/// # Errors
///
/// Returns an error if the container cannot be created.
pub fn execute(engine: &Engine, args: &CreateArgs) -> anyhow::Result<u8> {
    let id = super::parse_id(&args.id)?;
    let options = CreateOptions {
        pid_file: args.pid_file.clone(),
    };
    let _ = engine.create(&id, args.bundle.dir(), &options)?;
    Ok(0)
}
