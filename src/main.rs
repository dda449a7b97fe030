// src/main.rs - Engine bring-up and CLI
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use resind::config::Settings;
use resind::engine::Engine;
use resind::error::EngineError;
use resind::event::Command;
use resind::motor::bus::MotorBus;
use resind::projector::Projector;

/// SLA print-engine daemon.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Settings file; built-in defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .init();

    tracing::info!("resind {} starting", env!("CARGO_PKG_VERSION"));

    let settings = match &cli.config {
        Some(path) => match Settings::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::error!("cannot load settings: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };

    let result = if settings.hardware_present() {
        match Engine::with_hardware(settings, cli.config.clone()) {
            Ok(engine) => serve(engine).await,
            Err(e) => Err(e),
        }
    } else if cfg!(debug_assertions) {
        tracing::warn!("running without hardware (loopback bus, stub projector)");
        match Engine::without_hardware(settings) {
            Ok(engine) => serve(engine).await,
            Err(e) => Err(e),
        }
    } else {
        // Release builds must not come up against a pretend printer
        Err(EngineError::HardwareNeeded)
    };

    match result {
        Ok(()) => {
            tracing::info!("clean exit");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("engine failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the engine, turning ctrl-c into a clean Exit so the loop tears the
/// hardware down itself.
async fn serve<B: MotorBus, P: Projector>(mut engine: Engine<B, P>) -> Result<(), EngineError> {
    let sender = engine.command_sender();
    let exit = async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = sender.send(Ok(Command::Exit)).await;
        }
        // If the loop never drains the Exit, end the process anyway
        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
    };
    tokio::select! {
        result = engine.run() => result,
        _ = exit => Ok(()),
    }
}
