use std::path::PathBuf;
use clap::{Parser, Subcommand};
use shared::types::RecordKind;

#[derive(Parser, Debug)]
#[command(version, about = "repokeep on-demand service and client")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Manage the background service
    Service {
        #[command(subcommand)]
        action: ServiceCmd,
    },
    /// Work with stored records (starts the service when needed)
    Records {
        /// Give up on a call after this many seconds
        #[arg(long, global = true, default_value_t = 30)]
        timeout: u64,

        #[command(subcommand)]
        action: RecordsCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum ServiceCmd {
    /// Run the service in the foreground
    Run {
        /// Path to configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Port to listen on (0 picks a free one)
        #[arg(long)]
        port: Option<u16>,

        /// Shut down after this many seconds without calls (0 = never)
        #[arg(long)]
        idle_timeout: Option<u64>,
    },
    /// Start the service if it is not running and print where it listens
    Start,
    /// Check service status (Exit 0 = running, 1 = stopped)
    Status,
    /// Ask the running service to shut down
    Stop,
}

#[derive(Subcommand, Debug)]
pub enum RecordsCmd {
    /// List records of one kind
    List { kind: RecordKind },
    /// Show one record
    Get { kind: RecordKind, name: String },
    /// Create or replace a record; DATA is a JSON document
    Put { kind: RecordKind, name: String, data: String },
    /// Delete a record
    Delete { kind: RecordKind, name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_service_run_overrides() {
        let args = Args::try_parse_from(["repokeepd", "service", "run", "--port", "0", "--idle-timeout", "900"]).unwrap();
        match args.cmd {
            Cmd::Service {
                action: ServiceCmd::Run { config, port, idle_timeout },
            } => {
                assert_eq!(config, None);
                assert_eq!(port, Some(0));
                assert_eq!(idle_timeout, Some(900));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_record_kind_is_validated() {
        assert!(Args::try_parse_from(["repokeepd", "records", "list", "profile"]).is_ok());
        assert!(Args::try_parse_from(["repokeepd", "records", "list", "widgets"]).is_err());
    }

    #[test]
    fn test_records_timeout_defaults_and_overrides() {
        let args = Args::try_parse_from(["repokeepd", "records", "get", "profile", "work"]).unwrap();
        assert!(matches!(args.cmd, Cmd::Records { timeout: 30, .. }));

        let args = Args::try_parse_from(["repokeepd", "records", "list", "profile", "--timeout", "5"]).unwrap();
        assert!(matches!(args.cmd, Cmd::Records { timeout: 5, .. }));
    }

    #[test]
    fn test_cli_is_consistent() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }
}
