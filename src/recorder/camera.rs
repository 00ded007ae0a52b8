use std::path::Path;

use opencv::core::{Mat, Size};
use opencv::prelude::*;
use opencv::videoio;

use super::RecorderError;

/// A single, already-open camera handle. Mirrors the subset of
/// `opencv::videoio::VideoCapture` the clip loop actually uses, so the loop
/// can run against a fake in tests without touching real hardware.
pub trait Camera: Send {
    fn opened(&self) -> Result<bool, opencv::Error>;
    fn frame_size(&mut self) -> (i32, i32);
    fn read_frame(&mut self, frame: &mut Mat) -> Result<bool, opencv::Error>;
}

/// A single, already-open clip writer. Mirrors the subset of
/// `opencv::videoio::VideoWriter` the clip loop actually uses.
pub trait ClipWriter: Send {
    fn opened(&self) -> Result<bool, opencv::Error>;
    fn write_frame(&mut self, frame: &Mat) -> Result<(), opencv::Error>;
    fn close(&mut self) -> Result<(), opencv::Error>;
}

/// Opens cameras and clip writers. `OpenCvBackend` is the only implementation
/// used outside tests; a fake substitutes for it in `capture`'s unit tests.
pub trait CameraBackend: Send + Sync {
    fn open_camera(&self, camera_index: i32) -> Result<Box<dyn Camera>, RecorderError>;
    fn open_writer(&self, path: &Path, fourcc: i32, fps: f64, size: (i32, i32)) -> Result<Box<dyn ClipWriter>, RecorderError>;
}

pub struct OpenCvBackend;

impl CameraBackend for OpenCvBackend {
    fn open_camera(&self, camera_index: i32) -> Result<Box<dyn Camera>, RecorderError> {
        let camera = videoio::VideoCapture::new(camera_index, videoio::CAP_ANY)?;
        Ok(Box::new(camera))
    }

    fn open_writer(&self, path: &Path, fourcc: i32, fps: f64, size: (i32, i32)) -> Result<Box<dyn ClipWriter>, RecorderError> {
        let size = Size::new(size.0, size.1);
        let writer = videoio::VideoWriter::new(path.to_string_lossy().as_ref(), fourcc, fps, size, true)?;
        Ok(Box::new(writer))
    }
}

impl Camera for videoio::VideoCapture {
    fn opened(&self) -> Result<bool, opencv::Error> {
        self.is_opened()
    }

    fn frame_size(&mut self) -> (i32, i32) {
        let width = self.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as i32;
        let height = self.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as i32;
        (width, height)
    }

    fn read_frame(&mut self, frame: &mut Mat) -> Result<bool, opencv::Error> {
        self.read(frame)
    }
}

impl ClipWriter for videoio::VideoWriter {
    fn opened(&self) -> Result<bool, opencv::Error> {
        self.is_opened()
    }

    fn write_frame(&mut self, frame: &Mat) -> Result<(), opencv::Error> {
        self.write(frame)
    }

    fn close(&mut self) -> Result<(), opencv::Error> {
        self.release()
    }
}
