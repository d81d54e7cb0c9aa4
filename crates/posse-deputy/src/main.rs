//! Posse deputy binary.
//!
//! Starts the supervision engine on the configured bus. The deputy id
//! must be unique in the fleet; on startup, if another deputy with the
//! same id is detected, the newly started deputy self-terminates
//! (exit codes 1 and 2).

use clap::Parser;
use posse_deputy::bus::{BusUrl, DEFAULT_BUS_URL};
use posse_deputy::deputy::{DeputyOptions, ProcmanDeputy};
use posse_deputy::exit_codes::ExitCode;
use posse_deputy::logging::init_logging;
use std::path::{Path, PathBuf};

/// Posse deputy - supervises local commands on behalf of remote sheriffs
#[derive(Parser)]
#[command(name = "posse-deputy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Deputy id, unique across the fleet (default: system hostname)
    #[arg(short = 'i', long = "id")]
    id: Option<String>,

    /// Bus url, udpm://ADDR:PORT[?ttl=N]
    #[arg(short = 'u', long = "bus-url", default_value = DEFAULT_BUS_URL, env = "POSSE_BUS_URL")]
    bus_url: String,

    /// Append stdout and stderr to this file instead of the console
    #[arg(short = 'l', long = "log-file")]
    log_file: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).as_i32());
}

fn run(cli: Cli) -> ExitCode {
    // Make sibling executables resolvable from exec strings.
    prepend_exe_dir_to_path();

    if let Some(path) = &cli.log_file {
        if let Err(e) = redirect_output_to(path) {
            eprintln!("couldn't open logfile {}: {e}", path.display());
            return ExitCode::OsError;
        }
    }

    init_logging(cli.verbose);

    let bus_url: BusUrl = match cli.bus_url.parse() {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = %e, "bad bus url");
            return ExitCode::OsError;
        }
    };

    let options = DeputyOptions {
        deputy_id: cli.id,
        bus_url,
        verbose: cli.verbose > 0,
        wire_posix_signals: true,
    };

    let deputy = match ProcmanDeputy::new(options) {
        Ok(deputy) => deputy,
        Err(e) => {
            tracing::error!(error = %e, "deputy initialization failed");
            return ExitCode::OsError;
        }
    };

    ProcmanDeputy::run(&deputy)
}

fn prepend_exe_dir_to_path() {
    let Ok(exe) = std::env::current_exe() else {
        return;
    };
    let Some(dir) = exe.parent() else {
        return;
    };
    let current = std::env::var("PATH").unwrap_or_default();
    let new_path = format!("{}:{current}", dir.display());
    println!("setting PATH to {new_path}");
    std::env::set_var("PATH", &new_path);
}

/// Send stdout and stderr to an append-mode log file.
fn redirect_output_to(path: &Path) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    unsafe {
        if libc::dup2(file.as_raw_fd(), libc::STDOUT_FILENO) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
