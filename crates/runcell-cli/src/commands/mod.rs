//! CLI command definitions and dispatch.

pub mod create;
pub mod delete;
pub mod kill;
pub mod list;
pub mod run;
pub mod start;
pub mod state;

use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

use runcell_common::config::RuntimeConfig;
use runcell_common::types::ContainerId;
use runcell_runtime::engine::Engine;

/// runcell — daemon-less OCI container runtime.
#[derive(Parser, Debug)]
#[command(name = "runcell", version, about, long_about = None)]
pub struct Cli {
    /// Options shared by every subcommand.
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Directory holding container state.
    #[arg(long, global = true, env = "RUNCELL_ROOT")]
    pub root: Option<PathBuf>,

    /// Mount point of the cgroup filesystem.
    #[arg(long, global = true, env = "RUNCELL_CGROUP_ROOT")]
    pub cgroup_root: Option<PathBuf>,

    /// Log at debug level, overriding `RUST_LOG`.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true)]
    pub log: Option<PathBuf>,

    /// Log line format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl GlobalArgs {
    /// Runtime configuration for the calling user with flag overrides.
    #[must_use]
    pub fn config(&self) -> RuntimeConfig {
        let mut config = RuntimeConfig::for_euid(nix::unistd::geteuid().as_raw());
        if let Some(root) = &self.root {
            config = config.with_state_root(root);
        }
        if let Some(cgroup_root) = &self.cgroup_root {
            config = config.with_cgroup_root(cgroup_root);
        }
        config
    }
}

/// Bundle location, given positionally or with `--bundle`.
#[derive(Args, Debug)]
pub struct BundleArgs {
    /// Bundle directory holding `config.json` [default: .]
    #[arg(value_name = "BUNDLE", conflicts_with = "bundle_flag")]
    pub bundle: Option<PathBuf>,

    /// Bundle directory, as a flag.
    #[arg(short = 'b', long = "bundle", value_name = "BUNDLE")]
    pub bundle_flag: Option<PathBuf>,
}

impl BundleArgs {
    /// The bundle directory; the current directory when none was given.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.bundle
            .as_deref()
            .or(self.bundle_flag.as_deref())
            .unwrap_or_else(|| Path::new("."))
    }
}

/// Log line format.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per line.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container from a bundle and leave it waiting for `start`.
    Create(create::CreateArgs),
    /// Run the user program of a created container.
    Start(start::StartArgs),
    /// Send a signal to a container.
    Kill(kill::KillArgs),
    /// Delete a container and release its resources.
    Delete(delete::DeleteArgs),
    /// Print a container's OCI state document.
    State(state::StateArgs),
    /// Create, start and wait for a container in the foreground.
    Run(run::RunArgs),
    /// List containers.
    List(list::ListArgs),
}

impl Command {
    /// Container the command acts on, for diagnostics.
    #[must_use]
    pub fn container_id(&self) -> Option<&str> {
        match self {
            Self::Create(args) => Some(&args.id),
            Self::Start(args) => Some(&args.id),
            Self::Kill(args) => Some(&args.id),
            Self::Delete(args) => Some(&args.id),
            Self::State(args) => Some(&args.id),
            Self::Run(args) => Some(&args.id),
            Self::List(_) => None,
        }
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// Returns the process exit code on success.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<u8> {
    let engine = Engine::new(cli.global.config());
    match cli.command {
        Command::Create(args) => create::execute(&engine, &args),
        Command::Start(args) => start::execute(&engine, &args),
        Command::Kill(args) => kill::execute(&engine, &args),
        Command::Delete(args) => delete::execute(&engine, &args),
        Command::State(args) => state::execute(&engine, &args),
        Command::Run(args) => run::execute(&engine, &args),
        Command::List(args) => list::execute(&engine, &args),
    }
}

/// Validates a container id argument.
fn parse_id(id: &str) -> anyhow::Result<ContainerId> {
    Ok(ContainerId::parse(id)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn kill_defaults_to_sigterm() {
        let cli = Cli::try_parse_from(["runcell", "kill", "web"]).unwrap();
        let Command::Kill(args) = cli.command else {
            panic!("expected kill");
        };
        assert_eq!(args.signal, nix::sys::signal::Signal::SIGTERM);
        assert!(!args.all);
    }

    #[test]
    fn unknown_signal_is_a_usage_error() {
        let err = Cli::try_parse_from(["runcell", "kill", "web", "NOPE"]).unwrap_err();
        assert!(err.use_stderr());
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "runcell", "state", "web", "--root", "/tmp/state", "--log-format", "json",
        ])
        .unwrap();
        assert_eq!(cli.global.log_format, LogFormat::Json);
        assert_eq!(cli.global.config().state_root, PathBuf::from("/tmp/state"));
        assert_eq!(cli.command.container_id(), Some("web"));
    }

    #[test]
    fn create_bundle_defaults_to_current_directory() {
        let cli = Cli::try_parse_from(["runcell", "create", "web"]).unwrap();
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.bundle.dir(), Path::new("."));
        assert!(args.pid_file.is_none());
    }

    #[test]
    fn create_takes_the_bundle_positionally() {
        let cli = Cli::try_parse_from(["runcell", "create", "web", "/b"]).unwrap();
        let Command::Create(args) = cli.command else {
            panic!("expected create");
        };
        assert_eq!(args.id, "web");
        assert_eq!(args.bundle.dir(), Path::new("/b"));
    }

    #[test]
    fn bundle_flag_is_still_accepted() {
        let cli = Cli::try_parse_from(["runcell", "run", "web", "--bundle", "/srv/b"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.bundle.dir(), Path::new("/srv/b"));

        let cli = Cli::try_parse_from(["runcell", "run", "web", "/a", "-b", "/b"]);
        assert!(cli.is_err());
    }
}
