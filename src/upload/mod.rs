mod client;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub use client::UploadClient;

use crate::settings::SettingsProvider;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to read clip for upload: {0}")]
    ReadFailed(std::io::Error),
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upload attempt exceeded its deadline")]
    Timeout,
    #[error("server rejected upload with status {0}")]
    Rejected(reqwest::StatusCode),
}

impl UploadError {
    /// Network failures, 5xx, and timeouts are retry-eligible; a read
    /// failure or a 4xx response is not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            UploadError::ReadFailed(_) => false,
            UploadError::Timeout => true,
            UploadError::Request(_) => true,
            UploadError::Rejected(status) => status.is_server_error(),
        }
    }
}

/// A clip queued for upload. `attempt` starts at 0 and only ever increases.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub path: PathBuf,
    pub has_motion: bool,
    pub duration: Duration,
    pub recorded_at: DateTime<Utc>,
    pub format: String,
    pub attempt: u32,
}

impl UploadJob {
    pub fn new(path: PathBuf, has_motion: bool, duration: Duration, recorded_at: DateTime<Utc>, format: String) -> Self {
        Self { path, has_motion, duration, recorded_at, format, attempt: 0 }
    }
}

struct ScheduledRetry {
    job: UploadJob,
    next_attempt_at: Instant,
}

pub type JobCallback = Arc<dyn Fn(UploadJob) + Send + Sync>;

/// The two-queue upload pipeline: a bounded primary FIFO backed by a
/// `tokio::sync::mpsc` channel (so `offer` is `try_send`, genuinely
/// non-blocking), and a scanned retry reservoir for jobs awaiting their next
/// attempt time.
pub struct UploadQueue {
    sender: mpsc::Sender<UploadJob>,
    receiver: Mutex<Option<mpsc::Receiver<UploadJob>>>,
    reservoir: Mutex<VecDeque<ScheduledRetry>>,
    reservoir_capacity: usize,
    client: Arc<UploadClient>,
    settings: Arc<SettingsProvider>,
}

impl UploadQueue {
    /// Queue capacities are fixed from the policy snapshot in force at
    /// construction time; like clip-duration and codec, buffer sizes take
    /// effect at the next natural boundary (process start), not mid-flight.
    pub fn new(settings: Arc<SettingsProvider>, client: UploadClient) -> Arc<Self> {
        let policy = settings.snapshot();
        let (sender, receiver) = mpsc::channel(policy.upload_buffer_size.max(1));
        Arc::new(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            reservoir: Mutex::new(VecDeque::new()),
            reservoir_capacity: policy.upload_retry_buffer_size.max(1),
            client: Arc::new(client),
            settings,
        })
    }

    /// Non-blocking. Returns false when the primary queue is full; the
    /// caller is responsible for cleaning up the file in that case.
    pub fn offer(&self, job: UploadJob) -> bool {
        self.sender.try_send(job).is_ok()
    }

    /// Spawns the consumer and retry-dispatcher tasks. Returns both join
    /// handles so the caller can await them during shutdown.
    pub fn start(
        self: &Arc<Self>,
        shutdown: broadcast::Receiver<()>,
        on_success: JobCallback,
        on_permanent_failure: JobCallback,
        drain_timeout: Duration,
    ) -> (JoinHandle<()>, JoinHandle<()>) {
        let receiver = self.receiver.lock().expect("upload receiver lock poisoned").take().expect("start() called twice");

        let consumer_queue = self.clone();
        let consumer_success = on_success.clone();
        let consumer_failure = on_permanent_failure.clone();
        let consumer_shutdown = shutdown.resubscribe();
        let consumer = tokio::spawn(async move {
            consumer_queue
                .run_consumer(receiver, consumer_shutdown, consumer_success, consumer_failure, drain_timeout)
                .await;
        });

        let dispatcher_queue = self.clone();
        let dispatcher = tokio::spawn(async move {
            dispatcher_queue.run_retry_dispatcher(shutdown, on_success, on_permanent_failure).await;
        });

        (consumer, dispatcher)
    }

    async fn run_consumer(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<UploadJob>,
        mut shutdown: broadcast::Receiver<()>,
        on_success: JobCallback,
        on_failure: JobCallback,
        drain_timeout: Duration,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!(target: "upload", "shutdown received, entering drain");
                    break;
                }
                job = receiver.recv() => {
                    match job {
                        Some(job) => self.handle_job(job, &on_success, &on_failure).await,
                        None => return,
                    }
                }
            }
        }

        let pending = receiver.len() as u32;
        let budget = drain_timeout.max(drain_timeout * pending);
        let deadline = Instant::now() + budget;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Some(job)) => self.handle_job(job, &on_success, &on_failure).await,
                _ => break,
            }
        }

        let orphaned = receiver.len();
        if orphaned > 0 {
            tracing::warn!(target: "upload", "drain budget expired with {orphaned} jobs still queued, orphaning their files");
        }

        let leftover: Vec<ScheduledRetry> =
            self.reservoir.lock().expect("reservoir lock poisoned").drain(..).collect();
        for scheduled in leftover {
            on_failure(scheduled.job);
        }
    }

    async fn run_retry_dispatcher(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
        on_success: JobCallback,
        on_failure: JobCallback,
    ) {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                _ = tick.tick() => {
                    let (due, rejected) = self.take_due_jobs();
                    for job in rejected {
                        on_failure(job);
                    }
                    for job in due {
                        self.handle_job(job, &on_success, &on_failure).await;
                    }
                }
            }
        }

        // Mirrors the consumer's own final sweep: a due retry can still be
        // mid-`handle_job` when the shutdown signal lands, and `schedule_retry`
        // may re-insert it into the reservoir after the consumer's sweep has
        // already run. Draining here too, after this task's loop has fully
        // stopped touching in-flight jobs, ensures that job is still caught
        // rather than left in the reservoir with neither task left to service it.
        let leftover: Vec<ScheduledRetry> =
            self.reservoir.lock().expect("reservoir lock poisoned").drain(..).collect();
        for scheduled in leftover {
            on_failure(scheduled.job);
        }
    }

    async fn handle_job(self: &Arc<Self>, mut job: UploadJob, on_success: &JobCallback, on_failure: &JobCallback) {
        match self.client.upload(&job).await {
            Ok(()) => on_success(job),
            Err(err) => {
                let max_retries = self.settings.snapshot().max_retries;
                if !err.is_recoverable() || job.attempt >= max_retries {
                    tracing::warn!(target: "upload", "permanent failure for {}: {err}", job.path.display());
                    on_failure(job);
                    return;
                }
                job.attempt += 1;
                if !self.schedule_retry(job.clone()) {
                    tracing::warn!(target: "upload", "retry reservoir full, failing {} permanently", job.path.display());
                    on_failure(job);
                }
            }
        }
    }

    fn schedule_retry(&self, job: UploadJob) -> bool {
        let policy = self.settings.snapshot();
        let jitter_secs: f64 = rand::thread_rng().gen_range(0.0..16.0);
        let delay = Duration::from_secs(policy.retry_minutes as u64 * 60) + Duration::from_secs_f64(jitter_secs);

        let mut reservoir = self.reservoir.lock().expect("reservoir lock poisoned");
        if reservoir.len() >= self.reservoir_capacity {
            return false;
        }
        reservoir.push_back(ScheduledRetry { job, next_attempt_at: Instant::now() + delay });
        true
    }

    /// Removes every job whose retry time has passed. Jobs not yet due are
    /// re-inserted, subject to the same capacity check as a fresh schedule;
    /// rejection there is reported back as a permanent failure.
    fn take_due_jobs(&self) -> (Vec<UploadJob>, Vec<UploadJob>) {
        let now = Instant::now();
        let mut reservoir = self.reservoir.lock().expect("reservoir lock poisoned");
        let mut due = Vec::new();
        let mut rejected = Vec::new();
        let mut remaining = VecDeque::new();

        for scheduled in reservoir.drain(..) {
            if scheduled.next_attempt_at <= now {
                due.push(scheduled.job);
            } else if remaining.len() < self.reservoir_capacity {
                remaining.push_back(scheduled);
            } else {
                rejected.push(scheduled.job);
            }
        }

        *reservoir = remaining;
        (due, rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_job(attempt: u32) -> UploadJob {
        let mut job = UploadJob::new(PathBuf::from("/tmp/clip_1_0.mp4"), true, Duration::from_secs(30), Utc::now(), "mp4".into());
        job.attempt = attempt;
        job
    }

    fn sample_policy(max_retries: u32) -> crate::policy::PolicySnapshot {
        crate::policy::PolicySnapshot {
            clip_duration_secs: 30,
            motion_only: false,
            motion: crate::policy::MotionTuning {
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
            capture_frame_rate: 15.0,
            output_format: "mp4".into(),
            output_codec: "libx264".into(),
            output_bitrate: "500k".into(),
            grayscale: false,
            downscale: crate::policy::Resolution::default(),
            upload_buffer_size: 16,
            upload_retry_buffer_size: 16,
            retry_minutes: 1,
            max_retries,
        }
    }

    fn counting_callback() -> (JobCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let callback: JobCallback = Arc::new(move |_job: UploadJob| {
            counted.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn upload_job_starts_at_attempt_zero() {
        let job = UploadJob::new(PathBuf::from("/tmp/x.mp4"), false, Duration::from_secs(10), Utc::now(), "mp4".into());
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn recoverable_classification_matches_status_family() {
        assert!(!UploadError::ReadFailed(std::io::Error::new(std::io::ErrorKind::NotFound, "x")).is_recoverable());
        assert!(UploadError::Timeout.is_recoverable());
        assert!(UploadError::Rejected(reqwest::StatusCode::INTERNAL_SERVER_ERROR).is_recoverable());
        assert!(!UploadError::Rejected(reqwest::StatusCode::BAD_REQUEST).is_recoverable());
    }

    #[tokio::test]
    async fn offer_is_non_blocking_and_fails_when_full() {
        let (sender, _receiver) = mpsc::channel::<UploadJob>(1);
        assert!(sender.try_send(sample_job(0)).is_ok());
        assert!(sender.try_send(sample_job(0)).is_err(), "second offer into a full buffer-size-1 queue must fail");
    }

    #[tokio::test]
    async fn handle_job_fails_permanently_on_first_recoverable_error_when_max_retries_is_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clip_path = dir.path().join("clip.mp4");
        std::fs::write(&clip_path, b"sample-bytes").expect("write sample clip");

        let settings = Arc::new(SettingsProvider::from_snapshot(sample_policy(0)));
        let mut config = crate::config::test_config();
        config.server_url = "http://127.0.0.1:1".into();
        let client = UploadClient::new(&config).expect("build upload client");
        let queue = UploadQueue::new(settings, client);

        let job = UploadJob::new(clip_path, true, Duration::from_secs(30), Utc::now(), "mp4".into());
        let (on_success, successes) = counting_callback();
        let (on_failure, failures) = counting_callback();

        queue.handle_job(job, &on_success, &on_failure).await;

        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1, "max_retries=0 must fail permanently on the very first recoverable error");
        assert!(queue.reservoir.lock().unwrap().is_empty(), "a zero-retry-budget job must never be scheduled for retry");
    }

    #[tokio::test]
    async fn dispatcher_drains_reservoir_on_shutdown_instead_of_orphaning_a_scheduled_retry() {
        let settings = Arc::new(SettingsProvider::from_snapshot(sample_policy(3)));
        let mut config = crate::config::test_config();
        config.server_url = "http://127.0.0.1:1".into();
        let client = UploadClient::new(&config).expect("build upload client");
        let queue = UploadQueue::new(settings, client);

        queue
            .reservoir
            .lock()
            .unwrap()
            .push_back(ScheduledRetry { job: sample_job(1), next_attempt_at: Instant::now() + Duration::from_secs(3600) });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let (on_success, successes) = counting_callback();
        let (on_failure, failures) = counting_callback();

        let dispatcher_queue = queue.clone();
        let handle = tokio::spawn(async move {
            dispatcher_queue.run_retry_dispatcher(shutdown_rx, on_success, on_failure).await;
        });

        shutdown_tx.send(()).expect("broadcast shutdown");
        handle.await.expect("dispatcher task panicked");

        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(
            failures.load(Ordering::SeqCst),
            1,
            "a job still sitting in the reservoir at shutdown must be failed permanently, not orphaned"
        );
        assert!(queue.reservoir.lock().unwrap().is_empty());
    }

    #[test]
    fn reservoir_rejects_past_capacity() {
        let counter = Arc::new(AtomicUsize::new(0));
        let _ = counter.fetch_add(1, Ordering::Relaxed);
        let mut reservoir: VecDeque<ScheduledRetry> = VecDeque::new();
        let capacity = 2;
        for i in 0..3 {
            if reservoir.len() < capacity {
                reservoir.push_back(ScheduledRetry { job: sample_job(i), next_attempt_at: Instant::now() });
            }
        }
        assert_eq!(reservoir.len(), capacity);
    }
}
