mod cli;
mod config;
mod core;
mod device;
mod error;
mod sink;
mod sniffer;

use clap::Parser;
use log::{debug, warn};
use std::{
    io,
    process,
    sync::{
        atomic::AtomicBool,
        Arc,
    },
};

use crate::cli::CliArgs;
use crate::config::{pipe_path, RelayConfig, SnifferConfig};
use crate::core::bootstrap::{choose_device, connect, follow_device, open_pipe};
use crate::core::relay_loop::{RelayLoop, SessionStats};
use crate::core::signal::setup_ctrlc_handler;
use crate::core::summary::print_final_summary;
use crate::error::{Result, SnifferError};
use crate::sniffer::SnifferSession;

fn main() {
    // Parse CLI args
    let args = CliArgs::parse();
    init_logging(args.verbose);

    // Shared shutdown flag
    let running = Arc::new(AtomicBool::new(true));
    let force_exit = Arc::new(AtomicBool::new(false));
    if let Err(e) = setup_ctrlc_handler(Arc::clone(&running), Arc::clone(&force_exit)) {
        warn!("Failed to set Ctrl+C handler: {}", e);
    }

    let code = match run(&args, &running, &force_exit) {
        Ok(stats) => {
            if let Err(e) = print_final_summary(&stats, &mut io::stdout()) {
                debug!("Could not print summary: {}", e);
            }
            0
        }
        Err(SnifferError::Setup { port, source }) => {
            println!("Unable to open serial port '{}'", port);
            debug!("Serial open error: {}", source);
            -1
        }
        Err(SnifferError::Interrupted) => {
            println!("\nInterrupted, sniffer and pipe closed");
            -1
        }
        Err(e) => {
            eprintln!("\nError: {}", e);
            -1
        }
    };

    process::exit(code);
}

fn init_logging(verbose: bool) {
    let level = if verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_target(false)
        .init();
}

/// Connect, pick a device, open the pipe, follow, relay. Every resource is
/// owned here or by the relay loop and released on drop.
fn run(args: &CliArgs, running: &AtomicBool, force_exit: &AtomicBool) -> Result<SessionStats> {
    let config = SnifferConfig::from_args(args);
    let mut session = connect(&config)?;

    if args.verbose {
        println!(
            "Sniffer Firmware Version: {}",
            session
                .firmware_version()
                .unwrap_or_else(|| "unknown".to_string())
        );
    }

    let mut stdout = io::stdout();
    let device = {
        let mut stdin = io::stdin().lock();
        choose_device(
            &mut session,
            config.scan_time,
            running,
            force_exit,
            &mut stdin,
            &mut stdout,
        )?
    };

    let sink = open_pipe(&pipe_path(args), running, &mut stdout)?;
    follow_device(&mut session, &device, &mut stdout)?;

    RelayLoop::new(session, sink, RelayConfig::default()).run(running, &mut stdout)
}
