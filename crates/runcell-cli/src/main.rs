//! # runcell
//!
//! Daemon-less OCI container runtime.
//! One invocation per lifecycle operation; container state lives under
//! the state root and every container is watched by its own monitor.

#![allow(clippy::print_stdout, clippy::print_stderr)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::panic))]

mod commands;
mod logging;
mod output;

use std::process::ExitCode;

use clap::Parser;

use crate::commands::Cli;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(output::USAGE_EXIT)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    if let Err(e) = logging::init(&cli.global) {
        eprintln!("runcell: {e:#}");
        return ExitCode::from(output::GENERIC_EXIT);
    }

    let id = cli.command.container_id().map(str::to_string);
    match commands::execute(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("{}", output::diagnostic(&e, id.as_deref()));
            ExitCode::from(output::exit_code(&e))
        }
    }
}
