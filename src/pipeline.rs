use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::errors::{AgentError, ClipError};
use crate::file_tracker;
use crate::motion;
use crate::recorder::{RawClip, Recorder, RecorderFault};
use crate::settings::SettingsProvider;
use crate::transcode;
use crate::upload::{JobCallback, UploadClient, UploadJob, UploadQueue};

/// Drain budget handed to the upload queue at shutdown, before scaling by
/// pending-job count.
const UPLOAD_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Wires the four long-lived workers together: Recorder, Upload consumer,
/// retry dispatcher, and the per-clip analyze/transcode tasks spawned for
/// every RawClip.
pub struct Pipeline {
    recorder: Recorder,
    upload: Arc<UploadQueue>,
    settings: Arc<SettingsProvider>,
    shutdown_tx: broadcast::Sender<()>,
    clip_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    upload_tasks: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
    fault_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
    fault_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Pipeline {
    pub fn new(config: &AgentConfig, settings: Arc<SettingsProvider>) -> Result<Self, AgentError> {
        file_tracker::sweep(&config.scratch_dir);

        let client = UploadClient::new(config).map_err(|err| {
            tracing::error!(target: "upload", "failed to build upload client: {err}");
            AgentError::Config(crate::config::ConfigError::InvalidValue {
                name: "SERVER_URL",
                value: config.server_url.clone(),
            })
        })?;
        let upload = UploadQueue::new(settings.clone(), client);
        let recorder = Recorder::new(config.camera_index(), config.scratch_dir.clone(), settings.clone());
        let (shutdown_tx, _) = broadcast::channel(4);
        let (fault_tx, fault_rx) = oneshot::channel();

        Ok(Self {
            recorder,
            upload,
            settings,
            shutdown_tx,
            clip_tasks: Arc::new(Mutex::new(Vec::new())),
            upload_tasks: Mutex::new(None),
            fault_tx: Arc::new(Mutex::new(Some(fault_tx))),
            fault_rx: Mutex::new(Some(fault_rx)),
        })
    }

    /// Starts every worker. Returns false if the recorder was already
    /// running (`Recorder::start`'s own idle check).
    pub fn start(&self) -> bool {
        let on_success: JobCallback = Arc::new(|job: UploadJob| file_tracker::delete(&job.path));
        let on_failure: JobCallback = Arc::new(|job: UploadJob| file_tracker::delete(&job.path));
        let upload_tasks = self.upload.start(self.shutdown_tx.subscribe(), on_success, on_failure, UPLOAD_DRAIN_TIMEOUT);
        *self.upload_tasks.lock().expect("upload tasks lock poisoned") = Some(upload_tasks);

        let upload = self.upload.clone();
        let settings = self.settings.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let clip_tasks = self.clip_tasks.clone();
        let runtime = tokio::runtime::Handle::current();
        let fault_tx = self.fault_tx.clone();

        self.recorder.start(
            move |clip: RawClip| -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                let upload = upload.clone();
                let settings = settings.clone();
                let shutdown_rx = shutdown_tx.subscribe();
                let clip_tasks = clip_tasks.clone();
                let handle = runtime.spawn(async move {
                    process_clip(clip, upload, settings, shutdown_rx).await;
                });
                clip_tasks.lock().expect("clip tasks lock poisoned").push(handle);
                Ok(())
            },
            move |fault: RecorderFault| -> bool {
                tracing::error!(target: "recorder", "{fault}");
                if fault.is_unrecoverable() {
                    if let Some(tx) = fault_tx.lock().expect("fault signal lock poisoned").take() {
                        let _ = tx.send(());
                    }
                }
                false
            },
        )
    }

    /// Resolves once the recorder reports a fault it cannot recover from on
    /// its own (e.g. the camera could not be opened at all). Resolves
    /// immediately if `start()` was never called or the fault already fired
    /// in a prior `select!` race; never resolves if no such fault has
    /// occurred or already been consumed by a previous call.
    pub async fn wait_for_unrecoverable_fault(&self) {
        let rx = self.fault_rx.lock().expect("fault signal lock poisoned").take();
        match rx {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    pub fn is_running(&self) -> bool {
        self.recorder.is_running()
    }

    /// Requests the recorder to stop, releases the camera, broadcasts
    /// shutdown to every worker, and awaits all in-flight per-clip and
    /// upload tasks before returning.
    pub async fn shutdown(&self) {
        self.recorder.stop();
        if let Some(handle) = self.recorder.take_join_handle() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        let _ = self.shutdown_tx.send(());

        let clip_tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.clip_tasks.lock().expect("clip tasks lock poisoned");
            std::mem::take(&mut *guard)
        };
        for task in clip_tasks {
            let _ = task.await;
        }

        let upload_tasks = self.upload_tasks.lock().expect("upload tasks lock poisoned").take();
        if let Some((consumer, dispatcher)) = upload_tasks {
            let _ = consumer.await;
            let _ = dispatcher.await;
        }
    }
}

/// Runs the analyze → (motion-only gate) → transcode → offer chain for a
/// single raw clip. Checks shutdown before each costly step and always
/// leaves exactly one of {uploaded, deleted} true for the file it owns at
/// that point.
async fn process_clip(
    raw: RawClip,
    upload: Arc<UploadQueue>,
    settings: Arc<SettingsProvider>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if shutdown_signalled(&mut shutdown) {
        file_tracker::delete(&raw.path);
        return;
    }

    let policy = settings.snapshot();

    let motion_present = match motion::detect(&raw.path, &policy) {
        Ok(present) => present,
        Err(err) => {
            let err = ClipError::from(err);
            tracing::warn!(target: "motion", "analysis failed for {}: {err}, treating as motion present", raw.path.display());
            true
        }
    };

    if policy.motion_only && !motion_present {
        tracing::debug!(target: "motion", "no motion in {}, discarding", raw.path.display());
        file_tracker::delete(&raw.path);
        return;
    }

    if shutdown_signalled(&mut shutdown) {
        file_tracker::delete(&raw.path);
        return;
    }

    let raw_path = raw.path.clone();
    let started_at = raw.started_at;
    let encoded = match transcode::process(raw, policy).await {
        Ok(encoded) => encoded,
        Err(err) => {
            let err = ClipError::from(err);
            tracing::error!(target: "transcode", "failed to transcode {}: {err}", raw_path.display());
            file_tracker::delete(&raw_path);
            return;
        }
    };

    file_tracker::delete(&raw_path);

    let job = UploadJob::new(encoded.path.clone(), motion_present, encoded.duration, started_at, encoded.format);
    if !upload.offer(job) {
        tracing::warn!(target: "upload", "primary queue full, dropping {}", encoded.path.display());
        file_tracker::delete(&encoded.path);
    }
}

fn shutdown_signalled(rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}
