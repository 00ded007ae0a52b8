use std::collections::HashMap;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::shared::paths::ensure_dir;

/// Guards that must be kept alive for the process lifetime to ensure logs are flushed.
pub struct LoggingGuards {
    _guards: Vec<WorkerGuard>,
}

/// Multi-target writer that routes a component's logs to its own daily-rolling file,
/// falling back to a shared `system.log` for anything untagged.
struct ComponentWriter {
    writers: HashMap<&'static str, tracing_appender::non_blocking::NonBlocking>,
    system_writer: tracing_appender::non_blocking::NonBlocking,
}

impl<'a> MakeWriter<'a> for ComponentWriter {
    type Writer = Box<dyn std::io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        Box::new(self.system_writer.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        let target = meta.target();
        for (component, writer) in &self.writers {
            if target == *component || target.starts_with(&format!("{component}::")) {
                return Box::new(writer.clone());
            }
        }
        Box::new(self.system_writer.clone())
    }
}

/// One log file per pipeline component, matching the `target:` tags used on every
/// `tracing` call site in the pipeline.
const COMPONENTS: &[&str] = &["settings", "recorder", "motion", "transcode", "upload"];

/// Initialize structured logging: console output filtered by `RUST_LOG`/`log_level`,
/// plus per-component rolling log files under `log_dir`.
pub fn init(log_dir: &Path, log_level: &str) -> LoggingGuards {
    ensure_dir(log_dir).expect("failed to create log directory");

    let mut guards = Vec::new();
    let mut writers = HashMap::new();

    for component in COMPONENTS {
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, format!("{component}.log"));
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        writers.insert(*component, non_blocking);
        guards.push(guard);
    }

    let system_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "system.log");
    let (system_writer, system_guard) = tracing_appender::non_blocking(system_appender);
    guards.push(system_guard);

    let component_writer = ComponentWriter { writers, system_writer };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(component_writer)
                .with_ansi(false)
                .with_target(true),
        );

    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to install global tracing subscriber");

    tracing::info!(target: "system", "logging initialized at {:?}", log_dir);

    LoggingGuards { _guards: guards }
}
