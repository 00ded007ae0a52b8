use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opencv::prelude::*;
use opencv::videoio;

use super::camera::CameraBackend;
use super::raw_clip::RawClip;
use super::state::AtomicRunState;
use super::{OnClip, OnFault, RecorderError, RecorderFault};
use crate::settings::SettingsProvider;
use crate::shared::paths::{ensure_dir, raw_clip_filename};

/// Retry pause between empty/failed camera reads (roughly one 15fps frame
/// period) so a transient glitch doesn't spin the thread hot.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(67);
const FALLBACK_WIDTH: i32 = 640;
const FALLBACK_HEIGHT: i32 = 480;

/// Runs on a dedicated OS thread for the lifetime of one `start()` call. Opens
/// the camera once, then loops producing clips until `stop()` flips the run
/// state or the camera fails unrecoverably.
pub fn run(
    camera_index: i32,
    scratch_dir: PathBuf,
    settings: Arc<SettingsProvider>,
    run_state: Arc<AtomicRunState>,
    backend: Arc<dyn CameraBackend>,
    on_clip: OnClip,
    on_fault: OnFault,
) {
    let mut camera = match backend.open_camera(camera_index) {
        Ok(camera) => camera,
        Err(err) => {
            tracing::error!(target: "recorder", "failed to construct camera handle: {err}");
            on_fault(RecorderFault::Camera(err));
            run_state.finish_stop();
            return;
        }
    };

    match camera.opened() {
        Ok(true) => {}
        _ => {
            tracing::error!(target: "recorder", "camera {camera_index} could not be opened");
            on_fault(RecorderFault::Camera(RecorderError::CameraUnavailable(camera_index)));
            run_state.finish_stop();
            return;
        }
    }

    if let Err(err) = ensure_dir(&scratch_dir) {
        tracing::error!(target: "recorder", "scratch dir unavailable: {err}");
        on_fault(RecorderFault::Camera(RecorderError::Io(err)));
        run_state.finish_stop();
        return;
    }

    let (native_width, native_height) = resolve_frame_size(camera.frame_size());

    let mut clip_index: u64 = 0;
    'clips: while matches!(run_state.load(), super::state::RunState::Running) {
        let policy = settings.snapshot();
        let duration_budget = Duration::from_secs(policy.clamped_clip_duration_secs() as u64);
        let frame_period = Duration::from_secs_f64(1.0 / policy.capture_frame_rate.max(1.0));

        let started_at = Utc::now();
        let clip_start = Instant::now();
        let filename = raw_clip_filename(started_at.timestamp(), clip_index, policy.capture_extension());
        let path = scratch_dir.join(filename);

        let fourcc = fourcc_for(&policy.capture_codec);
        let mut writer = match backend.open_writer(&path, fourcc, policy.capture_frame_rate.max(1.0), (native_width, native_height)) {
            Ok(writer) if writer.opened().unwrap_or(false) => writer,
            _ => {
                tracing::warn!(target: "recorder", "failed to open clip writer at {}", path.display());
                let cancel = on_fault(RecorderFault::Camera(RecorderError::WriterUnavailable(path)));
                if cancel {
                    break 'clips;
                }
                clip_index += 1;
                continue 'clips;
            }
        };

        let mut frame = Mat::default();
        let mut frame_count: u64 = 0;
        let mut next_frame_at = Instant::now();

        while clip_start.elapsed() < duration_budget && matches!(run_state.load(), super::state::RunState::Running) {
            let now = Instant::now();
            if now < next_frame_at {
                std::thread::sleep(next_frame_at - now);
            }

            match camera.read_frame(&mut frame) {
                Ok(true) if !frame.empty() => {
                    if writer.write_frame(&frame).is_ok() {
                        frame_count += 1;
                        next_frame_at += frame_period;
                    }
                }
                _ => {
                    std::thread::sleep(READ_RETRY_BACKOFF);
                }
            }
        }

        let _ = writer.close();

        if frame_count == 0 {
            tracing::warn!(target: "recorder", "clip {clip_index} produced zero frames, discarding");
            let _ = std::fs::remove_file(&path);
            let cancel = on_fault(RecorderFault::Camera(RecorderError::EmptyClip));
            if cancel {
                break 'clips;
            }
            clip_index += 1;
            continue 'clips;
        }

        let clip = RawClip {
            path,
            capture_codec: policy.capture_codec.clone(),
            started_at,
            duration: clip_start.elapsed(),
            frame_count,
            frame_rate: policy.capture_frame_rate,
        };

        if let Err(err) = on_clip(clip) {
            let cancel = on_fault(RecorderFault::ClipProcessing(err));
            if cancel {
                break 'clips;
            }
        }

        clip_index += 1;
    }

    drop(camera);
    run_state.finish_stop();
    tracing::info!(target: "recorder", "camera released, recorder idle");
}

fn resolve_frame_size(reported: (i32, i32)) -> (i32, i32) {
    if reported.0 > 0 && reported.1 > 0 {
        reported
    } else {
        (FALLBACK_WIDTH, FALLBACK_HEIGHT)
    }
}

fn fourcc_for(capture_codec: &str) -> i32 {
    match capture_codec.to_ascii_lowercase().as_str() {
        "mjpeg" | "mjpg" => videoio::VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap_or(0),
        "h264" | "x264" => videoio::VideoWriter::fourcc('a', 'v', 'c', '1').unwrap_or(0),
        "yuyv" | "raw" => videoio::VideoWriter::fourcc('I', 'Y', 'U', 'V').unwrap_or(0),
        _ => videoio::VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use opencv::core::{Scalar, CV_8UC3};

    use super::super::camera::{Camera, ClipWriter};
    use super::super::state::RunState;
    use super::*;
    use crate::policy::{MotionTuning, PolicySnapshot, Resolution};

    #[test]
    fn fourcc_falls_back_to_mjpg_for_unknown_codec() {
        assert_eq!(fourcc_for("mjpeg"), fourcc_for("unknown-codec"));
    }

    #[test]
    fn fourcc_distinguishes_h264_from_mjpeg() {
        assert_ne!(fourcc_for("h264"), fourcc_for("mjpeg"));
    }

    fn sample_frame() -> Mat {
        Mat::new_rows_cols_with_default(4, 4, CV_8UC3, Scalar::all(0.0)).expect("build sample frame")
    }

    fn sample_policy(frame_rate: f64) -> PolicySnapshot {
        PolicySnapshot {
            clip_duration_secs: 30,
            motion_only: false,
            motion: MotionTuning {
                min_area: 1000.0,
                max_frames_to_check: 300,
                warm_up_frames: 30,
                min_width: 20,
                min_height: 20,
                min_aspect: 0.3,
                max_aspect: 3.0,
                mog_history: 500,
                mog_var_thresh: 16.0,
            },
            capture_codec: "mjpeg".into(),
            capture_frame_rate: frame_rate,
            output_format: "mp4".into(),
            output_codec: "libx264".into(),
            output_bitrate: "500k".into(),
            grayscale: false,
            downscale: Resolution::default(),
            upload_buffer_size: 16,
            upload_retry_buffer_size: 16,
            retry_minutes: 1,
            max_retries: 3,
        }
    }

    struct FakeCamera {
        frame_available: bool,
    }

    impl Camera for FakeCamera {
        fn opened(&self) -> Result<bool, opencv::Error> {
            Ok(true)
        }

        fn frame_size(&mut self) -> (i32, i32) {
            (0, 0)
        }

        fn read_frame(&mut self, frame: &mut Mat) -> Result<bool, opencv::Error> {
            if !self.frame_available {
                return Ok(false);
            }
            *frame = sample_frame();
            Ok(true)
        }
    }

    struct FakeWriter {
        opened: bool,
    }

    impl ClipWriter for FakeWriter {
        fn opened(&self) -> Result<bool, opencv::Error> {
            Ok(self.opened)
        }

        fn write_frame(&mut self, _frame: &Mat) -> Result<(), opencv::Error> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), opencv::Error> {
            Ok(())
        }
    }

    struct FakeBackend {
        frame_available: bool,
        writer_opens: bool,
    }

    impl CameraBackend for FakeBackend {
        fn open_camera(&self, _camera_index: i32) -> Result<Box<dyn Camera>, RecorderError> {
            Ok(Box::new(FakeCamera { frame_available: self.frame_available }))
        }

        fn open_writer(&self, _path: &std::path::Path, _fourcc: i32, _fps: f64, _size: (i32, i32)) -> Result<Box<dyn ClipWriter>, RecorderError> {
            Ok(Box::new(FakeWriter { opened: self.writer_opens }))
        }
    }

    #[test]
    fn frame_size_falls_back_when_camera_reports_zero() {
        assert_eq!(resolve_frame_size((0, 0)), (FALLBACK_WIDTH, FALLBACK_HEIGHT));
        assert_eq!(resolve_frame_size((1920, 1080)), (1920, 1080));
    }

    /// Mid-clip stop: flipping run_state to Stopping while the clip loop is
    /// mid-flight must make `run` return promptly with whatever frames were
    /// captured so far, instead of waiting out the full clip-duration budget.
    #[test]
    fn run_exits_promptly_when_stop_is_requested_mid_clip() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let settings = Arc::new(crate::settings::SettingsProvider::from_snapshot(sample_policy(200.0)));
        let run_state = Arc::new(AtomicRunState::new());
        assert!(run_state.try_start());

        let backend: Arc<dyn CameraBackend> = Arc::new(FakeBackend { frame_available: true, writer_opens: true });
        let clips_seen = Arc::new(AtomicUsize::new(0));
        let clips_seen_cb = clips_seen.clone();
        let last_frame_count = Arc::new(StdMutex::new(0u64));
        let last_frame_count_cb = last_frame_count.clone();

        let on_clip: OnClip = Box::new(move |clip: RawClip| {
            clips_seen_cb.fetch_add(1, Ordering::SeqCst);
            *last_frame_count_cb.lock().unwrap() = clip.frame_count;
            Ok(())
        });
        let on_fault: OnFault = Box::new(|_fault| false);

        let run_state_for_thread = run_state.clone();
        let handle = std::thread::spawn(move || {
            run(0, scratch.path().to_path_buf(), settings, run_state_for_thread, backend, on_clip, on_fault);
        });

        std::thread::sleep(Duration::from_millis(100));
        assert!(run_state.request_stop());
        handle.join().expect("capture thread panicked");

        assert!(matches!(run_state.load(), RunState::Idle));
        assert_eq!(clips_seen.load(Ordering::SeqCst), 1);
        assert!(*last_frame_count.lock().unwrap() > 0, "expected at least one frame before stop was observed");
    }

    /// Zero-frame clips must be discarded (never handed to `on_clip`) and
    /// reported through `on_fault` as `EmptyClip`.
    #[test]
    fn run_discards_zero_frame_clip_and_reports_fault() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let settings = Arc::new(crate::settings::SettingsProvider::from_snapshot(sample_policy(30.0)));
        let run_state = Arc::new(AtomicRunState::new());
        assert!(run_state.try_start());

        let backend: Arc<dyn CameraBackend> = Arc::new(FakeBackend { frame_available: false, writer_opens: true });
        let clips_seen = Arc::new(AtomicUsize::new(0));
        let clips_seen_cb = clips_seen.clone();
        let saw_empty_clip_fault = Arc::new(AtomicUsize::new(0));
        let saw_empty_clip_fault_cb = saw_empty_clip_fault.clone();

        let on_clip: OnClip = Box::new(move |_clip: RawClip| {
            clips_seen_cb.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let run_state_for_fault = run_state.clone();
        let on_fault: OnFault = Box::new(move |fault| {
            if matches!(fault, RecorderFault::Camera(RecorderError::EmptyClip)) {
                saw_empty_clip_fault_cb.fetch_add(1, Ordering::SeqCst);
            }
            run_state_for_fault.request_stop();
            false
        });

        let run_state_for_thread = run_state.clone();
        let handle = std::thread::spawn(move || {
            run(0, scratch.path().to_path_buf(), settings, run_state_for_thread, backend, on_clip, on_fault);
        });

        handle.join().expect("capture thread panicked");

        assert_eq!(clips_seen.load(Ordering::SeqCst), 0);
        assert_eq!(saw_empty_clip_fault.load(Ordering::SeqCst), 1);
    }

    /// A writer that refuses to open is reported as `WriterUnavailable` and
    /// the loop moves on to the next clip attempt rather than wedging.
    #[test]
    fn run_reports_writer_unavailable_and_continues() {
        let scratch = tempfile::tempdir().expect("tempdir");
        let settings = Arc::new(crate::settings::SettingsProvider::from_snapshot(sample_policy(30.0)));
        let run_state = Arc::new(AtomicRunState::new());
        assert!(run_state.try_start());

        let backend: Arc<dyn CameraBackend> = Arc::new(FakeBackend { frame_available: true, writer_opens: false });
        let on_clip: OnClip = Box::new(|_clip: RawClip| Ok(()));
        let saw_writer_fault = Arc::new(AtomicUsize::new(0));
        let saw_writer_fault_cb = saw_writer_fault.clone();
        let run_state_for_fault = run_state.clone();
        let on_fault: OnFault = Box::new(move |fault| {
            if matches!(fault, RecorderFault::Camera(RecorderError::WriterUnavailable(_))) {
                saw_writer_fault_cb.fetch_add(1, Ordering::SeqCst);
            }
            run_state_for_fault.request_stop();
            false
        });

        let run_state_for_thread = run_state.clone();
        let handle = std::thread::spawn(move || {
            run(0, scratch.path().to_path_buf(), settings, run_state_for_thread, backend, on_clip, on_fault);
        });

        handle.join().expect("capture thread panicked");
        assert_eq!(saw_writer_fault.load(Ordering::SeqCst), 1);
    }
}
