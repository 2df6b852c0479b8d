use clap::{Parser, Subcommand};
use eyre::eyre;
use std::time::Duration;

use crate::battery;

type Result<T> = color_eyre::eyre::Result<T>;

/// Black-box acceptance probes for a POSIX-style libc and syscall surface
#[derive(Parser)]
#[command(name = "posixprobe")]
#[command(about = "Black-box acceptance probes for a POSIX-style libc and syscall surface")]
#[command(version)]
pub struct Cli {
    /// Test groups to run (default: the full battery, in order)
    #[arg(long, value_delimiter = ',')]
    pub group: Vec<String>,

    /// Upper bound for joining a canceled thread (seconds)
    #[arg(long, default_value = "10")]
    pub join_timeout_secs: u64,

    #[command(subcommand)]
    pub mode: Option<Mode>,
}

/// Sub-behaviors entered via self-re-exec during choreography tests.
///
/// These are not user-facing commands; they are the replaced process
/// image's half of a cross-exec assertion, with the verdict carried back
/// through the exit status.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Assert descriptor state after image replacement: the first
    /// descriptor must be closed, the second still open
    Cloexec { closed_fd: i32, kept_fd: i32 },
    /// Exit immediately, reporting success
    Exit,
    /// Install a fault handler, then store through a non-canonical address
    Pagefault,
}

/// Validated runtime configuration for the harness
#[derive(Debug, Clone)]
pub struct Config {
    /// Selected group names; empty means the whole battery
    pub groups: Vec<String>,
    /// Bound within which a canceled thread must become joinable
    pub join_timeout: Duration,
    /// Re-exec entry point, if any
    pub mode: Option<Mode>,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        for name in &cli.group {
            if !battery::GROUPS.iter().any(|(known, _)| *known == name.as_str()) {
                return Err(eyre!(
                    "unknown test group '{}' (known groups: {})",
                    name,
                    battery::group_names().join(", ")
                ));
            }
        }

        Ok(Config {
            groups: cli.group,
            join_timeout: Duration::from_secs(cli.join_timeout_secs),
            mode: cli.mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_run_has_no_mode() {
        let cli = Cli::parse_from(["posixprobe"]);
        let config = Config::from_cli(cli).unwrap();
        assert!(config.mode.is_none());
        assert!(config.groups.is_empty());
        assert_eq!(config.join_timeout, Duration::from_secs(10));
    }

    #[test]
    fn cloexec_mode_carries_descriptors() {
        let cli = Cli::parse_from(["posixprobe", "cloexec", "7", "9"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(
            config.mode,
            Some(Mode::Cloexec {
                closed_fd: 7,
                kept_fd: 9
            })
        );
    }

    #[test]
    fn fault_mode_parses() {
        let cli = Cli::parse_from(["posixprobe", "pagefault"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.mode, Some(Mode::Pagefault));
    }

    #[test]
    fn group_selection_is_validated() {
        let cli = Cli::parse_from(["posixprobe", "--group", "pipes,signals"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.groups, vec!["pipes", "signals"]);

        let cli = Cli::parse_from(["posixprobe", "--group", "bogus"]);
        assert!(Config::from_cli(cli).is_err());
    }
}
