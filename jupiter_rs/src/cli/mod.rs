//! Command-line interface: argument tree and dispatch.
//!
//! Exit codes: 0 success, 1 domain failure (including CI threshold
//! breaches), 2 bad usage, 3 connector/network error. Plugin CLI
//! contributions are mounted as `p:<plugin_id>:<verb>` external
//! subcommands.

pub mod dispatch;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "jupiter")]
#[command(about = "Project introspection: scan snapshots, quality metrics, dependency graphs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project root directory.
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Bypass cache reads and rewrite entries.
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Reuse cached analyses for unchanged files.
    #[arg(long, global = true)]
    pub incremental: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan the project into a report.
    Scan(ScanArgs),
    /// Scan and aggregate quality metrics.
    Analyze(AnalyzeArgs),
    /// Scan, analyze, and gate on configured CI thresholds.
    Ci,
    /// Snapshot history.
    Snapshots {
        #[command(subcommand)]
        command: SnapshotsCommand,
    },
    /// Read-only impact prediction.
    Simulate {
        #[command(subcommand)]
        command: SimulateCommand,
    },
    /// Watch the tree and re-scan on change.
    Watch,
    /// Execute a whitelisted command.
    Run(RunArgs),
    /// Start the HTTP+WebSocket API server.
    Server,
    /// Start the server and print the UI address.
    Gui,
    /// Licensing service interaction.
    Meeting {
        #[command(subcommand)]
        command: MeetingCommand,
    },
    /// Plugin management.
    Plugins {
        #[command(subcommand)]
        command: PluginsCommand,
    },
    /// Check for a newer Jupiter release.
    Update,
    /// Self-diagnostics: config, cache, snapshots, plugins, license.
    Autodiag,
    /// Plugin-contributed verbs: `p:<plugin_id>:<verb> [args...]`.
    #[command(external_subcommand)]
    External(Vec<String>),
}

#[derive(clap::Args, Debug, Default)]
pub struct ScanArgs {
    /// Include dotfiles and dot-directories.
    #[arg(long)]
    pub show_hidden: bool,
    /// Extra ignore globs.
    #[arg(long = "ignore")]
    pub ignore_globs: Vec<String>,
    /// Persist a snapshot of this scan.
    #[arg(long)]
    pub snapshot: bool,
    /// Label for the captured snapshot.
    #[arg(long)]
    pub label: Option<String>,
}

#[derive(clap::Args, Debug, Default)]
pub struct AnalyzeArgs {
    /// Entries per top-N list.
    #[arg(long, default_value_t = 10)]
    pub top: usize,
    #[arg(long)]
    pub show_hidden: bool,
    #[arg(long = "ignore")]
    pub ignore_globs: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotsCommand {
    /// List snapshot metadata, newest first.
    List,
    /// Show one snapshot (metadata + report).
    Show { id: String },
    /// Structured diff between two snapshots.
    Diff { id_a: String, id_b: String },
}

#[derive(Subcommand, Debug)]
pub enum SimulateCommand {
    /// Impact of removing a file or a function.
    Remove {
        /// Project-relative file path.
        target: String,
        /// Simulate removing just this function instead of the file.
        #[arg(long)]
        function: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Command line, quoted (`jupiter run "pytest -q"`).
    pub command: String,
    /// Collect dynamic call data for the execution.
    #[arg(long)]
    pub with_dynamic: bool,
}

#[derive(Subcommand, Debug)]
pub enum MeetingCommand {
    /// Poll the licensing service once and report the status.
    CheckLicense,
}

#[derive(Subcommand, Debug)]
pub enum PluginsCommand {
    /// List discovered plugins and their states.
    List,
    /// Manifest and registration details for one plugin.
    Info { id: String },
    /// Add the plugin to the enabled set.
    Enable { id: String },
    /// Remove the plugin from the enabled set.
    Disable { id: String },
    /// Install a plugin from a local directory.
    Install { path: PathBuf },
    /// Remove an installed plugin.
    Uninstall { id: String },
    /// Hot-reload a plugin on a running server.
    Reload { id: String },
    /// Write a minimal plugin skeleton.
    Scaffold { id: String },
    /// Sign a plugin directory with a key id.
    Sign {
        id: String,
        #[arg(long, default_value = "local")]
        key: String,
    },
    /// Verify a plugin's signature and report its trust level.
    Verify { id: String },
    /// Compare installed plugin versions against the update registry.
    CheckUpdates,
    /// Update plugins from the update registry.
    Update,
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
    fn parses_scan_with_globals() {
        let cli = Cli::parse_from([
            "jupiter",
            "scan",
            "--root",
            "/tmp/proj",
            "--json",
            "--no-cache",
            "--snapshot",
            "--label",
            "baseline",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/proj"));
        assert!(cli.json);
        assert!(cli.no_cache);
        match cli.command {
            Command::Scan(args) => {
                assert!(args.snapshot);
                assert_eq!(args.label.as_deref(), Some("baseline"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_snapshot_diff() {
        let cli = Cli::parse_from(["jupiter", "snapshots", "diff", "scan-1", "scan-2"]);
        match cli.command {
            Command::Snapshots {
                command: SnapshotsCommand::Diff { id_a, id_b },
            } => {
                assert_eq!(id_a, "scan-1");
                assert_eq!(id_b, "scan-2");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_simulate_remove_function() {
        let cli = Cli::parse_from([
            "jupiter", "simulate", "remove", "pkg/api.py", "--function", "get_user",
        ]);
        match cli.command {
            Command::Simulate {
                command: SimulateCommand::Remove { target, function },
            } => {
                assert_eq!(target, "pkg/api.py");
                assert_eq!(function.as_deref(), Some("get_user"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn external_subcommand_captures_plugin_verbs() {
        let cli = Cli::parse_from(["jupiter", "p:demo:report", "weekly"]);
        match cli.command {
            Command::External(parts) => {
                assert_eq!(parts[0], "p:demo:report");
                assert_eq!(parts[1], "weekly");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
