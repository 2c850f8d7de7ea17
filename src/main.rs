//! `pstore-vacuum`: the standalone vacuum (compaction) tool for a pstore data store (C11).
//!
//! Runs the vacuum engine (`pstore_core::vacuum::VacuumEngine`) either once or, with `--daemon`,
//! forever until a shutdown signal arrives. Exit code 0 on clean shutdown; non-zero on
//! configuration or I/O error (§6).

mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Args;

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let options = pstore_core::vacuum::VacuumOptions::from(&args);
    let engine = pstore_core::vacuum::VacuumEngine::new(&args.path, options);

    match engine.run() {
        Ok(()) => {
            tracing::info!(path = %args.path.display(), "vacuum finished");
        }
        Err(err) => {
            tracing::error!(error = %err, path = %args.path.display(), "vacuum failed");
            std::process::exit(1);
        }
    }
}

fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli::default_filter_for_verbosity(verbose)));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
