//! spoold - the spool local resource scheduler daemon.
//!
//! A single binary: it loads the INI configuration, grabs the startup
//! lock, writes its pid, starts one scheduler per configured family and
//! serves the client socket until SIGTERM/SIGINT.
//!
//! Exit codes: 0 on clean stop, EEXIST (17) when another instance holds
//! the lock file, 1 on misconfiguration (including a missing
//! `DAEMON_PID_FILEPATH` for a daemonized start), ENXIO when no device
//! is available.

mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;

use spool::config::Settings;
use spool::daemon::{Daemon, DaemonOptions};
use spool::logging;

use error::exit_code_of;

/// Environment variable naming the pidfile; mandatory for a daemonized
/// start.
const PIDFILE_ENV: &str = "DAEMON_PID_FILEPATH";

const DEFAULT_CONFIG_PATH: &str = "/etc/spool.conf";

#[derive(Parser)]
#[command(name = "spoold")]
#[command(version = spool::VERSION)]
#[command(about = "Local resource scheduler for removable-media object storage", long_about = None)]
struct Cli {
    /// Stay interactive: run in the foreground without a pidfile.
    #[arg(short = 'i', long = "interactive")]
    interactive: bool,

    /// Increase verbosity (-v: debug, -vv: trace).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path.
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match logging::init_logging(
        std::path::Path::new(logging::default_log_dir()),
        logging::default_log_file(),
        cli.verbose,
    ) {
        Ok(guard) => Some(guard),
        Err(err) => {
            // A read-only log directory must not prevent an interactive
            // run; stderr still works.
            eprintln!("spoold: cannot initialize file logging: {err}");
            None
        }
    };

    let settings = match Settings::load_from(&cli.config) {
        Ok(settings) => settings,
        Err(err) => {
            error!(config = %cli.config.display(), %err, "invalid configuration");
            return ExitCode::from(1);
        }
    };

    let pidfile = match std::env::var_os(PIDFILE_ENV) {
        Some(path) => Some(PathBuf::from(path)),
        None if cli.interactive => None,
        None => {
            error!(
                "{PIDFILE_ENV} is not set; it is mandatory for a daemonized start"
            );
            return ExitCode::from(1);
        }
    };

    let opts = DaemonOptions {
        interactive: cli.interactive,
        pidfile,
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "cannot start runtime");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(Daemon::new(settings, opts).run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "daemon failed");
            ExitCode::from(exit_code_of(&err))
        }
    }
}
