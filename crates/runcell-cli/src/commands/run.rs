//! `runcell run` — Create, start and wait for a container.

use std::path::PathBuf;

use clap::Args;
use runcell_runtime::engine::{CreateOptions, Engine};

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container id.
    pub id: String,

    /// Bundle directory holding `config.json`.
    #[command(flatten)]
    pub bundle: super::BundleArgs,

    /// File to write the container init's pid to.
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

/// Executes the `run` command.
///
/// Signals received while waiting are forwarded to the container. The
/// container's exit code becomes runcell's.
///
/// # Errors
///
/// Returns an error if the container cannot be created or started.
pub fn execute(engine: &Engine, args: &RunArgs) -> anyhow::Result<u8> {
    let id = super::parse_id(&args.id)?;
    let options = CreateOptions {
        pid_file: args.pid_file.clone(),
    };
    let code = engine.run(&id, args.bundle.dir(), &options)?;
    Ok(u8::try_from(code).unwrap_or(u8::MAX))
}
