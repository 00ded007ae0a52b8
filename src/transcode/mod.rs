use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use thiserror::Error;

use crate::policy::PolicySnapshot;
use crate::recorder::RawClip;
use crate::shared::paths::encoded_clip_path;

/// Enables `-progress pipe:1` on ffmpeg invocations. Kept as a named constant,
/// matching the source contract's Windows-only pipe-handling caveat, even
/// though the agent only ships for Linux/macOS and this is always `true` here.
const FFMPEG_PROGRESS_PIPE: bool = true;

/// Fallback chain walked when the requested output codec isn't available
/// locally. Order matters: the first available entry wins.
const CODEC_FALLBACKS: &[(&str, &[&str])] = &[
    ("libx264", &["libx265", "mpeg4"]),
    ("libx265", &["libx264", "mpeg4"]),
    ("libvpx-vp9", &["libvpx", "libx264"]),
    ("libvpx", &["libvpx-vp9", "libx264"]),
    ("mpeg4", &["libx264"]),
];

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("ffmpeg not found on PATH")]
    FfmpegNotFound,
    #[error("no available encoder for '{0}' and no fallback chain covers it")]
    NoFallback(String),
    #[error("ffmpeg failed to encode {path}: {stderr}")]
    EncodeFailed { path: PathBuf, stderr: String },
    #[error("ffprobe failed to inspect {0}")]
    ProbeFailed(PathBuf),
    #[error("background task was cancelled: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A clip after transcoding to the policy's output format/codec.
#[derive(Debug, Clone)]
pub struct EncodedClip {
    pub path: PathBuf,
    pub codec_used: String,
    pub format: String,
    pub duration: Duration,
}

/// Transcodes a raw capture into the policy's target format. On error the
/// raw clip is left untouched — the caller owns its cleanup. `ffmpeg`/`ffprobe`
/// run on the blocking pool so the subprocess wait is a real suspension point
/// for the async supervisor.
pub async fn process(raw: RawClip, policy: PolicySnapshot) -> Result<EncodedClip, TranscodeError> {
    tokio::task::spawn_blocking(move || process_blocking(raw, policy)).await?
}

fn process_blocking(raw: RawClip, policy: PolicySnapshot) -> Result<EncodedClip, TranscodeError> {
    let encoders = available_encoders()?;
    let codec = select_codec(&policy.output_codec, &encoders)?;
    let output_path = encoded_clip_path(&raw.path, &policy.output_format);
    let filters = build_filter_chain(&policy, &codec);

    let mut args: Vec<String> = vec![
        "-y".into(),
        "-i".into(),
        raw.path.to_string_lossy().into_owned(),
        "-an".into(),
        "-c:v".into(),
        codec.clone(),
        "-b:v".into(),
        policy.output_bitrate.clone(),
    ];

    if let Some(filters) = &filters {
        args.push("-vf".into());
        args.push(filters.clone());
    }

    if codec == "libx264" {
        args.push("-preset".into());
        args.push("ultrafast".into());
        args.push("-profile:v".into());
        args.push("baseline".into());
    }

    if FFMPEG_PROGRESS_PIPE {
        args.push("-progress".into());
        args.push("pipe:1".into());
    }

    args.push(output_path.to_string_lossy().into_owned());

    let output = Command::new("ffmpeg")
        .args(&args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|_| TranscodeError::FfmpegNotFound)?;

    if !output.status.success() {
        return Err(TranscodeError::EncodeFailed {
            path: raw.path.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    let duration = probe_duration(&output_path).unwrap_or(raw.duration);

    Ok(EncodedClip { path: output_path, codec_used: codec, format: policy.output_format, duration })
}

fn available_encoders() -> Result<HashSet<String>, TranscodeError> {
    let output = Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map_err(|_| TranscodeError::FfmpegNotFound)?;

    let text = String::from_utf8_lossy(&output.stdout);
    let mut names = HashSet::new();
    for line in text.lines() {
        let mut columns = line.split_whitespace();
        let flags = columns.next().unwrap_or_default();
        if flags.len() >= 2 && flags.starts_with('V') {
            if let Some(name) = columns.next() {
                names.insert(name.to_string());
            }
        }
    }
    Ok(names)
}

fn select_codec(requested: &str, available: &HashSet<String>) -> Result<String, TranscodeError> {
    if available.contains(requested) {
        return Ok(requested.to_string());
    }

    let chain = CODEC_FALLBACKS
        .iter()
        .find(|(codec, _)| *codec == requested)
        .map(|(_, fallbacks)| *fallbacks)
        .unwrap_or(&[]);

    chain
        .iter()
        .find(|candidate| available.contains(**candidate))
        .map(|candidate| candidate.to_string())
        .ok_or_else(|| TranscodeError::NoFallback(requested.to_string()))
}

fn build_filter_chain(policy: &PolicySnapshot, codec: &str) -> Option<String> {
    let mut filters = Vec::new();

    if policy.grayscale {
        if codec == "libx264" {
            filters.push("hue=s=0".to_string());
        } else {
            filters.push("format=gray".to_string());
        }
    }

    if !policy.downscale.is_empty() {
        filters.push(format!("scale={}:{}", policy.downscale.width, policy.downscale.height));
    }

    if filters.is_empty() {
        None
    } else {
        Some(filters.join(","))
    }
}

fn probe_duration(path: &std::path::Path) -> Option<Duration> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(path)
        .output()
        .ok()?;

    let seconds: f64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    if seconds > 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}
