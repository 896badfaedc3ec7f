//! `runcell list` — List containers.

use clap::{Args, ValueEnum};
use runcell_runtime::engine::Engine;

use crate::output::{self, ListEntry};

/// Output format for `list`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    /// Aligned columns.
    Table,
    /// JSON array.
    Json,
}

/// Arguments for the `list` command.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ListFormat::Table)]
    pub format: ListFormat,

    /// Print ids only.
    #[arg(short, long)]
    pub quiet: bool,
}

/// Executes the `list` command.
///
/// # Errors
///
/// Returns an error if the state root cannot be read.
pub fn execute(engine: &Engine, args: &ListArgs) -> anyhow::Result<u8> {
    let entries: Vec<ListEntry> = engine.list()?.iter().map(ListEntry::from).collect();
    if args.quiet {
        for entry in &entries {
            println!("{}", entry.id);
        }
        return Ok(0);
    }
    match args.format {
        ListFormat::Table => print!("{}", output::format_table(&entries)),
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
    }
    Ok(0)
}
