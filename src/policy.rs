use serde::Deserialize;

/// Motion-detector tuning. Non-positive values fall back to the defaults in
/// [`MotionTuning::normalized`].
#[derive(Debug, Clone, Deserialize)]
pub struct MotionTuning {
    #[serde(default)]
    pub min_area: f64,
    #[serde(default)]
    pub max_frames_to_check: u32,
    #[serde(default)]
    pub warm_up_frames: u32,
    #[serde(default)]
    pub min_width: i32,
    #[serde(default)]
    pub min_height: i32,
    #[serde(default)]
    pub min_aspect: f64,
    #[serde(default)]
    pub max_aspect: f64,
    #[serde(default)]
    pub mog_history: i32,
    #[serde(default)]
    pub mog_var_thresh: f64,
}

impl MotionTuning {
    /// Applies safety-net defaults to any non-positive field.
    pub fn normalized(&self) -> MotionTuning {
        MotionTuning {
            min_area: positive_or(self.min_area, 1000.0),
            max_frames_to_check: positive_or_u32(self.max_frames_to_check, 300),
            warm_up_frames: positive_or_u32(self.warm_up_frames, 30),
            min_width: positive_or_i32(self.min_width, 20),
            min_height: positive_or_i32(self.min_height, 20),
            min_aspect: positive_or(self.min_aspect, 0.3),
            max_aspect: positive_or(self.max_aspect, 3.0),
            mog_history: positive_or_i32(self.mog_history, 500),
            mog_var_thresh: positive_or(self.mog_var_thresh, 16.0),
        }
    }
}

fn positive_or(value: f64, default: f64) -> f64 {
    if value > 0.0 {
        value
    } else {
        default
    }
}

fn positive_or_u32(value: u32, default: u32) -> u32 {
    if value > 0 {
        value
    } else {
        default
    }
}

fn positive_or_i32(value: i32, default: i32) -> i32 {
    if value > 0 {
        value
    } else {
        default
    }
}

/// A downscale target resolution. An empty/zero resolution means "no downscale".
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
pub struct Resolution {
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

impl Resolution {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Immutable snapshot of server-controlled policy.
/// Every field is deserialized straight from the `/api/client/settings` JSON payload.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySnapshot {
    pub clip_duration_secs: u32,
    pub motion_only: bool,
    pub motion: MotionTuning,
    pub capture_codec: String,
    pub capture_frame_rate: f64,
    pub output_format: String,
    pub output_codec: String,
    pub output_bitrate: String,
    pub grayscale: bool,
    #[serde(default)]
    pub downscale: Resolution,
    pub upload_buffer_size: usize,
    pub upload_retry_buffer_size: usize,
    pub retry_minutes: u32,
    pub max_retries: u32,
}

impl PolicySnapshot {
    /// Clamps `clip_duration_secs` into the documented 30-1800s policy range.
    pub fn clamped_clip_duration_secs(&self) -> u32 {
        self.clip_duration_secs.clamp(30, 1800)
    }

    /// File extension for the capture codec's raw container (matroska is a safe,
    /// broadly-supported raw-capture container for any input codec).
    pub fn capture_extension(&self) -> &'static str {
        "mkv"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motion_tuning_normalizes_non_positive_fields_to_defaults() {
        let raw = MotionTuning {
            min_area: 0.0,
            max_frames_to_check: 0,
            warm_up_frames: 0,
            min_width: -1,
            min_height: 0,
            min_aspect: 0.0,
            max_aspect: 0.0,
            mog_history: 0,
            mog_var_thresh: 0.0,
        };
        let normalized = raw.normalized();
        assert_eq!(normalized.min_area, 1000.0);
        assert_eq!(normalized.max_frames_to_check, 300);
        assert_eq!(normalized.warm_up_frames, 30);
        assert_eq!(normalized.min_width, 20);
        assert_eq!(normalized.min_height, 20);
        assert_eq!(normalized.min_aspect, 0.3);
        assert_eq!(normalized.max_aspect, 3.0);
        assert_eq!(normalized.mog_history, 500);
        assert_eq!(normalized.mog_var_thresh, 16.0);
    }

    #[test]
    fn motion_tuning_preserves_positive_overrides() {
        let raw = MotionTuning {
            min_area: 2500.0,
            max_frames_to_check: 120,
            warm_up_frames: 10,
            min_width: 40,
            min_height: 40,
            min_aspect: 0.5,
            max_aspect: 2.0,
            mog_history: 200,
            mog_var_thresh: 25.0,
        };
        let normalized = raw.normalized();
        assert_eq!(normalized.min_area, 2500.0);
        assert_eq!(normalized.max_frames_to_check, 120);
    }

    #[test]
    fn clip_duration_clamps_to_policy_range() {
        let snapshot = sample_snapshot(10);
        assert_eq!(snapshot.clamped_clip_duration_secs(), 30);
        let snapshot = sample_snapshot(5000);
        assert_eq!(snapshot.clamped_clip_duration_secs(), 1800);
        let snapshot = sample_snapshot(60);
        assert_eq!(snapshot.clamped_clip_duration_secs(), 60);
    }

    #[test]
    fn empty_resolution_detected() {
        assert!(Resolution::default().is_empty());
        assert!(Resolution { width: 640, height: 0 }.is_empty());
        assert!(!Resolution { width: 640, height: 480 }.is_empty());
    }

    fn sample_snapshot(duration: u32) -> PolicySnapshot {
        PolicySnapshot {
            clip_duration_secs: duration,
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
            capture_frame_rate: 15.0,
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
}
