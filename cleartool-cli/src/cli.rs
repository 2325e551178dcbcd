use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ctsh",
    author,
    version,
    about = "Run commands through a long-lived interactive cleartool session"
)]
pub struct Cli {
    /// JSON file with tool settings.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Tool executable to spawn.
    #[arg(long, global = true, value_name = "PATH")]
    pub executable: Option<String>,

    /// Seconds without output before a command is abandoned.
    #[arg(long, global = true, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// File with one regular expression per line; matching error messages are not reported.
    #[arg(long, global = true, value_name = "FILE")]
    pub suppression_file: Option<PathBuf>,

    /// Talk to an in-process mockup of the tool rooted at this directory.
    #[arg(long, global = true, value_name = "DIR")]
    pub mockup_root: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single command and print its output.
    Run {
        /// Working directory for the command.
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        #[arg(last = true, required = true)]
        args: Vec<String>,
    },

    /// Run every line of a file as one fail-fast batch.
    Batch {
        /// Blank lines and lines starting with `#` are skipped.
        file: PathBuf,
    },

    /// Read commands from stdin; Ctrl-C cancels the running one.
    Shell,

    /// Launch a command that opens its own window, without waiting for it.
    Launch {
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_cwd() {
        let cli = Cli::parse_from([
            "ctsh", "-vv", "--idle-timeout", "5", "run", "--cwd", "/vobs", "--", "ls", "-l",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.idle_timeout, Some(5));
        match cli.command {
            Commands::Run { cwd, args } => {
                assert_eq!(cwd, Some(PathBuf::from("/vobs")));
                assert_eq!(args, vec!["ls".to_string(), "-l".to_string()]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn run_requires_arguments() {
        assert!(Cli::try_parse_from(["ctsh", "run"]).is_err());
    }
}
