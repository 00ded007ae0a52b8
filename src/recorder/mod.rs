mod camera;
mod capture;
mod raw_clip;
mod state;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

use camera::{CameraBackend, OpenCvBackend};
pub use raw_clip::RawClip;
use state::{AtomicRunState, RunState};

use crate::settings::SettingsProvider;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("camera {0} could not be opened")]
    CameraUnavailable(i32),
    #[error("failed to open clip writer at {0}")]
    WriterUnavailable(PathBuf),
    #[error("clip produced zero frames")]
    EmptyClip,
    #[error("scratch directory unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("camera error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Everything that can reach the caller through `on_error`: camera-level
/// faults raised by the capture loop itself, and errors forwarded from
/// `on_clip` (the downstream analyze/transcode/upload pipeline).
#[derive(Debug)]
pub enum RecorderFault {
    Camera(RecorderError),
    ClipProcessing(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for RecorderFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecorderFault::Camera(err) => write!(f, "camera fault: {err}"),
            RecorderFault::ClipProcessing(err) => write!(f, "clip processing failed: {err}"),
        }
    }
}

impl RecorderFault {
    /// True for faults raised before the clip loop is entered, which the
    /// capture thread always exits on unconditionally (regardless of what
    /// `on_error` returns) — the camera will not produce another clip until a
    /// fresh `start()`. `WriterUnavailable`/`EmptyClip`/`ClipProcessing` are
    /// per-clip hiccups the loop already retries past, so they don't count.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            RecorderFault::Camera(RecorderError::CameraUnavailable(_))
                | RecorderFault::Camera(RecorderError::OpenCv(_))
                | RecorderFault::Camera(RecorderError::Io(_))
        )
    }
}

type OnClip = Box<dyn Fn(RawClip) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send>;
type OnFault = Box<dyn Fn(RecorderFault) -> bool + Send>;

/// Owns the camera for the process lifetime of a `start()`/`stop()` cycle.
/// The camera handle itself never crosses the async runtime; it lives on a
/// dedicated OS thread, since OpenCV's capture+write is synchronous end to end.
pub struct Recorder {
    camera_index: i32,
    scratch_dir: PathBuf,
    settings: Arc<SettingsProvider>,
    run_state: Arc<AtomicRunState>,
    backend: Arc<dyn CameraBackend>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    pub fn new(camera_index: i32, scratch_dir: PathBuf, settings: Arc<SettingsProvider>) -> Self {
        Self::with_backend(camera_index, scratch_dir, settings, Arc::new(OpenCvBackend))
    }

    /// Test seam: constructs a `Recorder` against a fake `CameraBackend`
    /// instead of real hardware.
    pub(crate) fn with_backend(
        camera_index: i32,
        scratch_dir: PathBuf,
        settings: Arc<SettingsProvider>,
        backend: Arc<dyn CameraBackend>,
    ) -> Self {
        Self {
            camera_index,
            scratch_dir,
            settings,
            run_state: Arc::new(AtomicRunState::new()),
            backend,
            handle: Mutex::new(None),
        }
    }

    /// Returns `false` if a recording is already in progress. `on_clip` is
    /// invoked synchronously on the capture thread for every finished clip;
    /// its error is forwarded to `on_error` alongside camera-level faults.
    /// `on_error` returning `true` stops the loop.
    pub fn start<F, G>(&self, on_clip: F, on_error: G) -> bool
    where
        F: Fn(RawClip) -> Result<(), Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
        G: Fn(RecorderFault) -> bool + Send + 'static,
    {
        if !self.run_state.try_start() {
            return false;
        }

        let camera_index = self.camera_index;
        let scratch_dir = self.scratch_dir.clone();
        let settings = self.settings.clone();
        let run_state = self.run_state.clone();
        let backend = self.backend.clone();
        let on_clip: OnClip = Box::new(on_clip);
        let on_error: OnFault = Box::new(on_error);

        let handle = std::thread::spawn(move || {
            capture::run(camera_index, scratch_dir, settings, run_state, backend, on_clip, on_error);
        });

        *self.handle.lock().expect("recorder handle lock poisoned") = Some(handle);
        true
    }

    /// Idempotent. Requests termination and returns promptly; the background
    /// thread finishes the in-flight clip write before releasing the camera.
    pub fn stop(&self) {
        self.run_state.request_stop();
    }

    pub fn is_running(&self) -> bool {
        matches!(self.run_state.load(), RunState::Running | RunState::Stopping)
    }

    /// Hands over the background thread's `JoinHandle`, if one exists. The
    /// handle blocks on join, so the caller is expected to wait for it from
    /// somewhere off the async executor (e.g. `spawn_blocking`), never
    /// directly on a runtime worker thread.
    pub fn take_join_handle(&self) -> Option<JoinHandle<()>> {
        self.handle.lock().expect("recorder handle lock poisoned").take()
    }
}
