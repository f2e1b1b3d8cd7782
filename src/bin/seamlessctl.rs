//! seamlessctl - operator CLI for a running seamless supervisor
//!
//! Reads the supervisor pid from its pidfile and delivers the trigger
//! signals: SIGUSR2 for a worker rotation, SIGTERM for a graceful exit.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use seamless::config;

#[derive(Parser)]
#[command(name = "seamlessctl")]
#[command(about = "Control a running seamless supervisor")]
struct Args {
    /// Pidfile written by the supervisor
    #[arg(long, default_value = config::DEFAULT_PIDFILE)]
    pidfile: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rotate the worker: hand the listening socket to a replacement
    Handoff,

    /// Ask the supervisor to exit; the current worker keeps serving
    Stop,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let contents = std::fs::read_to_string(&args.pidfile)
        .map_err(|e| format!("failed to read pidfile {}: {}", args.pidfile.display(), e))?;
    let pid: i32 = contents
        .trim()
        .parse()
        .map_err(|e| format!("invalid pid in {}: {}", args.pidfile.display(), e))?;

    let signal = match args.command {
        Command::Handoff => Signal::SIGUSR2,
        Command::Stop => Signal::SIGTERM,
    };

    kill(Pid::from_raw(pid), signal)
        .map_err(|e| format!("failed to signal supervisor {}: {}", pid, e))?;
    log::info!("sent {} to supervisor {}", signal, pid);

    Ok(())
}
