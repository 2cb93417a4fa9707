use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pgsteward")]
#[command(version)]
#[command(about = "Declarative lifecycle management for PostgreSQL instances", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Settings file (TOML)
    #[arg(long, env = "PGSTEWARD_SETTINGS", global = true)]
    pub settings: Option<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(short, long, global = true)]
    pub yes: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply instance manifests
    Apply(ApplyArgs),

    /// Show the actual state of an instance as JSON
    Get(InstanceArg),

    /// List instances
    List {
        /// Only instances of this PostgreSQL version
        #[arg(long)]
        pg_version: Option<String>,
    },

    /// Show the status of an instance
    Status(InstanceArg),

    /// Start an instance
    Start {
        #[command(flatten)]
        instance: InstanceArg,

        /// Run the server in the foreground
        #[arg(long)]
        foreground: bool,
    },

    /// Stop an instance
    Stop {
        #[command(flatten)]
        instance: InstanceArg,

        /// Shutdown mode
        #[arg(short, long, value_enum, default_value = "fast")]
        mode: StopModeArg,
    },

    /// Restart an instance
    Restart {
        #[command(flatten)]
        instance: InstanceArg,

        /// Shutdown mode
        #[arg(short, long, value_enum, default_value = "fast")]
        mode: StopModeArg,
    },

    /// Reload the configuration of an instance
    Reload(InstanceArg),

    /// Promote a standby instance
    Promote(InstanceArg),

    /// Delete an instance
    Drop(InstanceArg),

    /// Print shell exports for connecting to an instance
    Env(InstanceArg),

    /// Print the current server log of an instance
    Logs(InstanceArg),

    /// Run a PostgreSQL program in the environment of an instance
    Exec {
        #[command(flatten)]
        instance: InstanceArg,

        /// Program from the server binaries directory, then its arguments
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Upgrade a stopped instance to another major version
    Upgrade(UpgradeArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Parser)]
pub struct ApplyArgs {
    /// Manifest files (YAML, JSON or TOML)
    #[arg(short, long = "file", required = true, num_args = 1..)]
    pub files: Vec<PathBuf>,

    /// Number of manifests applied in parallel
    #[arg(short, long, default_value = "4")]
    pub jobs: usize,
}

#[derive(Parser)]
pub struct UpgradeArgs {
    #[command(flatten)]
    pub instance: InstanceArg,

    /// Target PostgreSQL version (defaults to the site default)
    #[arg(long)]
    pub pg_version: Option<String>,

    /// Name of the upgraded instance
    #[arg(long)]
    pub name: Option<String>,

    /// Port of the upgraded instance
    #[arg(long)]
    pub port: Option<u16>,

    /// Parallel jobs for pg_upgrade
    #[arg(short, long)]
    pub jobs: Option<u32>,
}

#[derive(Parser)]
pub struct InstanceArg {
    /// Instance identifier, as `[VERSION/]NAME`
    pub instance: String,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StopModeArg {
    Smart,
    Fast,
    Immediate,
}

impl From<StopModeArg> for pgkit::StopMode {
    fn from(mode: StopModeArg) -> Self {
        match mode {
            StopModeArg::Smart => Self::Smart,
            StopModeArg::Fast => Self::Fast,
            StopModeArg::Immediate => Self::Immediate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_files() {
        let cli = Cli::parse_from(["pgsteward", "apply", "-f", "a.yaml", "b.yaml", "-j", "2"]);
        match cli.command {
            Command::Apply(args) => {
                assert_eq!(args.files.len(), 2);
                assert_eq!(args.jobs, 2);
            }
            _ => panic!("expected apply"),
        }
    }

    #[test]
    fn test_parse_list_version_filter() {
        let cli = Cli::parse_from(["pgsteward", "list", "--pg-version", "15"]);
        match cli.command {
            Command::List { pg_version } => assert_eq!(pg_version.as_deref(), Some("15")),
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn test_parse_exec_keeps_program_flags() {
        let cli = Cli::parse_from(["pgsteward", "exec", "db1", "psql", "-c", "SELECT 1"]);
        match cli.command {
            Command::Exec { instance, command } => {
                assert_eq!(instance.instance, "db1");
                assert_eq!(command, ["psql", "-c", "SELECT 1"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_parse_upgrade() {
        let cli = Cli::parse_from(["pgsteward", "upgrade", "15/main", "--pg-version", "16", "-j", "4"]);
        match cli.command {
            Command::Upgrade(args) => {
                assert_eq!(args.instance.instance, "15/main");
                assert_eq!(args.pg_version.as_deref(), Some("16"));
                assert_eq!(args.jobs, Some(4));
                assert!(args.name.is_none());
            }
            _ => panic!("expected upgrade"),
        }
    }

    #[test]
    fn test_parse_stop_mode() {
        let cli = Cli::parse_from(["pgsteward", "-y", "stop", "15/main", "--mode", "immediate"]);
        assert!(cli.yes);
        match cli.command {
            Command::Stop { instance, mode } => {
                assert_eq!(instance.instance, "15/main");
                assert_eq!(pgkit::StopMode::from(mode), pgkit::StopMode::Immediate);
            }
            _ => panic!("expected stop"),
        }
    }
}
