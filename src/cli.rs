//! Command-line surface for the vacuum binary (C11): `clap`'s derive API, the same
//! kebab-case-long-flag/`-v`-short-verbosity convention the library's own teacher uses for its
//! CLI surfaces.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use pstore_core::vacuum::VacuumOptions;

/// Garbage-collects a pstore data store by copying its live set into a fresh file.
#[derive(Parser, Debug)]
#[command(name = "pstore-vacuum", version, about)]
pub struct Args {
    /// Path to the store file to vacuum.
    pub path: PathBuf,

    /// Keep running, repeating the vacuum cycle until a shutdown signal arrives.
    #[arg(long)]
    pub daemon: bool,

    /// How long the copy task waits before its first pass, in daemon mode.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    pub initial_delay: Duration,

    /// How often the watch task polls for external modification.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "500ms")]
    pub poll_interval: Duration,

    /// Increase log verbosity; repeat for more (`-v`, `-vv`, ...). Overridden by `RUST_LOG` if
    /// set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl From<&Args> for VacuumOptions {
    fn from(args: &Args) -> Self {
        VacuumOptions {
            initial_delay: args.initial_delay,
            poll_interval: args.poll_interval,
            daemon: args.daemon,
        }
    }
}

/// Maps `-v` counts onto a default `tracing` filter directive, used only when `RUST_LOG` isn't
/// already set.
pub fn default_filter_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_minimal_invocation() {
        let args = Args::parse_from(["pstore-vacuum", "/tmp/store.db"]);
        assert_eq!(args.path, PathBuf::from("/tmp/store.db"));
        assert!(!args.daemon);
        assert_eq!(args.initial_delay, Duration::from_secs(10));
        assert_eq!(args.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn parses_daemon_mode_with_overridden_intervals() {
        let args = Args::parse_from([
            "pstore-vacuum",
            "/tmp/store.db",
            "--daemon",
            "--initial-delay",
            "2s",
            "--poll-interval",
            "100ms",
            "-vv",
        ]);
        assert!(args.daemon);
        assert_eq!(args.initial_delay, Duration::from_secs(2));
        assert_eq!(args.poll_interval, Duration::from_millis(100));
        assert_eq!(args.verbose, 2);
    }
}
