//! # beamctl supervisor
//!
//! Wires the instrument together from a bootstrap file, connects every
//! device, optionally runs a measurement script and pumps the event
//! loop until the script ends or Ctrl-C arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use beamctl_core::bootstrap::Bootstrap;
use beamctl_core::script::interpreter::InterpreterEvent;

#[derive(Debug, Parser)]
#[command(name = "beamctl", about = "SAXS beamline instrument control")]
struct Args {
    /// Bootstrap configuration file (TOML).
    #[arg(short, long, default_value = "beamctl.toml")]
    config: PathBuf,

    /// Measurement script to run after startup.
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Seconds to wait for every device to become ready.
    #[arg(long, default_value_t = 30.0)]
    startup_timeout: f64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "starting beamctl");

    let bootstrap = Bootstrap::load(&args.config)?;
    let mut instrument = bootstrap.build()?;

    instrument
        .devices
        .wait_all_ready(Duration::from_secs_f64(args.startup_timeout))?;
    info!("all devices ready");

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
        })?;
    }

    let mut script_running = false;
    if let Some(script_path) = &args.script {
        let text = std::fs::read_to_string(script_path)?;
        instrument.run_script(&text)?;
        script_running = true;
        info!(script = %script_path.display(), "script started");
    }

    let mut exit_code = 0;
    loop {
        if interrupted.swap(false, Ordering::SeqCst) {
            warn!("interrupted, stopping everything");
            instrument.panic();
            exit_code = 130;
            break;
        }
        for event in instrument.tick() {
            match event {
                InterpreterEvent::Started => info!("script running"),
                InterpreterEvent::Advance(line) => {
                    info!(line = line + 1, "advancing");
                }
                InterpreterEvent::Message(message) => info!("{message}"),
                InterpreterEvent::Progress {
                    message,
                    current,
                    total,
                } => {
                    if total > 0 {
                        info!("{message} [{current}/{total}]");
                    } else {
                        info!("{message}");
                    }
                }
                InterpreterEvent::Finished { success, message } => {
                    if success {
                        info!("script finished");
                    } else {
                        error!("script failed: {message}");
                        exit_code = 1;
                    }
                    script_running = false;
                }
            }
        }
        if args.script.is_some() && !script_running {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    instrument.shutdown();
    info!("beamctl shut down");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}
