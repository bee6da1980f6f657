use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;

#[derive(Debug, Parser)]
#[command(name = "gschedd", author, version, about = "GPU job scheduler daemon")]
#[command(styles=gsched::utils::STYLES)]
pub struct GSchedd {
    /// Defaults to running the scheduler loop
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// The configuration file to use
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Run the scheduler loop until interrupted
    Run,
    /// Run a single blocking scheduling pass and exit
    Once,
    /// Cancel a pending or running job
    Cancel {
        /// Job id
        id: u32,
    },
    /// Print the current GPU telemetry snapshot
    Gpus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        GSchedd::command().debug_assert();
    }

    #[test]
    fn test_parse_cancel() {
        let cli = GSchedd::parse_from(["gschedd", "-c", "/etc/gsched.toml", "cancel", "7"]);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/gsched.toml")));
        assert!(matches!(cli.command, Some(Commands::Cancel { id: 7 })));
    }

    #[test]
    fn test_default_command_is_none() {
        let cli = GSchedd::parse_from(["gschedd"]);
        assert!(cli.command.is_none());
    }
}
