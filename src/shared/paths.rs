use std::path::{Path, PathBuf};

/// Ensure a directory exists, creating it (and parents) if necessary.
pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Build a raw clip filename: `clip_<unix>_<index>.<ext>`.
pub fn raw_clip_filename(unix_timestamp: i64, index: u64, extension: &str) -> String {
    format!("clip_{}_{}.{}", unix_timestamp, index, extension.trim_start_matches('.'))
}

/// Build the encoded output path for a raw clip: `<raw-basename>.<format>`.
pub fn encoded_clip_path(raw_path: &Path, format: &str) -> PathBuf {
    let format = format.trim_start_matches('.');
    raw_path.with_extension(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_clip_filename_strips_leading_dot_from_extension() {
        assert_eq!(raw_clip_filename(1_700_000_000, 3, ".avi"), "clip_1700000000_3.avi");
        assert_eq!(raw_clip_filename(1_700_000_000, 3, "avi"), "clip_1700000000_3.avi");
    }

    #[test]
    fn encoded_clip_path_replaces_extension() {
        let raw = PathBuf::from("/tmp/clip_1_0.avi");
        assert_eq!(encoded_clip_path(&raw, "mp4"), PathBuf::from("/tmp/clip_1_0.mp4"));
        assert_eq!(encoded_clip_path(&raw, ".mkv"), PathBuf::from("/tmp/clip_1_0.mkv"));
    }
}
