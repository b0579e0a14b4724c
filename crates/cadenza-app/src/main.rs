//! # Cadenza
//!
//! A minimal host shell around the playback engine: one engine instance,
//! one output stream, and a line-oriented transport console.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use cadenza_audio::{AudioOutput, SymphoniaRegistry, TransportController};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadenza=debug".into()),
        )
        .init();

    info!("Starting Cadenza v{}", env!("CARGO_PKG_VERSION"));

    // Explicit composition root: everything lives and dies with this scope,
    // no process-wide singletons.
    let controller = TransportController::new(Arc::new(SymphoniaRegistry));
    let output =
        AudioOutput::new(controller.clone()).context("failed to open audio output")?;

    info!(
        "Rendering on '{}' at {}Hz",
        output.device_name(),
        output.sample_rate()
    );

    if let Some(path) = std::env::args().nth(1) {
        controller
            .load_file(Path::new(&path))
            .with_context(|| format!("failed to load {path}"))?;
    }

    run_console(&controller)?;

    drop(output);
    Ok(())
}

/// Read transport commands from stdin until `quit` or end of input.
fn run_console(controller: &TransportController) -> Result<()> {
    let stdin = io::stdin();
    println!("commands: load <path> | play | pause | stop | seek <secs> | state | quit");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("load") => {
                let Some(path) = parts.next() else {
                    println!("usage: load <path>");
                    continue;
                };
                match controller.load_file(Path::new(path)) {
                    Ok(()) => println!("loaded {path}"),
                    Err(e) => println!("load failed: {e}"),
                }
            }
            Some("play") => controller.request_play(),
            Some("pause") => controller.request_pause(),
            Some("stop") => controller.request_stop(),
            Some("seek") => match parts.next().and_then(|s| s.parse::<f64>().ok()) {
                Some(seconds) if seconds >= 0.0 => controller.set_position(seconds),
                _ => println!("usage: seek <seconds>"),
            },
            Some("state") => {
                println!(
                    "{:?} at {:.2}s",
                    controller.current_state(),
                    controller.position()
                );
            }
            Some("quit" | "exit") => break,
            Some(other) => println!("unknown command: {other}"),
            None => {}
        }
    }

    Ok(())
}
