use thiserror::Error;

use crate::config::ConfigError;
use crate::motion::MotionError;
use crate::recorder::RecorderError;
use crate::settings::SettingsError;
use crate::transcode::TranscodeError;

/// Top-level error type for agent construction and fatal startup paths.
///
/// Runtime per-clip errors (motion, transcode, upload) are handled inline by the
/// pipeline and never surface here; only errors that should abort process startup do.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

/// Errors that can occur while analyzing or transcoding a single clip. Never fatal
/// to the pipeline; the orchestrator logs these with the clip path and moves on.
#[derive(Error, Debug)]
pub enum ClipError {
    #[error(transparent)]
    Motion(#[from] MotionError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),
}
