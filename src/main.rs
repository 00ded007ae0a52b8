mod config;
mod errors;
mod file_tracker;
mod logging;
mod motion;
mod pipeline;
mod policy;
mod recorder;
mod settings;
mod shared;
mod transcode;
mod upload;

use std::process::ExitCode;
use std::sync::Arc;

use errors::AgentError;
use pipeline::Pipeline;
use settings::SettingsProvider;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("edgecamd: fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AgentError> {
    let config = config::AgentConfig::from_env()?;
    let _logging_guards = logging::init(&config.log_dir, &config.log_level);

    tracing::info!(target: "settings", "starting edgecamd");

    let settings = Arc::new(SettingsProvider::new(&config).await?);
    let pipeline = Pipeline::new(&config, settings)?;

    if !pipeline.start() {
        tracing::error!(target: "recorder", "recorder was already running at startup");
        return Ok(());
    }

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!(target: "recorder", "shutdown signal received, draining pipeline");
        }
        _ = pipeline.wait_for_unrecoverable_fault() => {
            tracing::error!(target: "recorder", "unrecoverable recorder fault, draining pipeline");
        }
    }

    pipeline.shutdown().await;

    tracing::info!(target: "recorder", "edgecamd exiting");
    Ok(())
}

/// Waits for either Ctrl-C or, on Unix, SIGTERM — whichever arrives first.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
