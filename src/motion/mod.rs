use std::path::Path;

use opencv::core::{Point, Size};
use opencv::prelude::*;
use opencv::{core, imgproc, video, videoio};
use thiserror::Error;

use crate::policy::PolicySnapshot;

#[derive(Error, Debug)]
pub enum MotionError {
    #[error("clip {0} could not be opened for analysis")]
    ClipUnavailable(std::path::PathBuf),
    #[error("opencv error: {0}")]
    OpenCv(#[from] opencv::Error),
}

/// Decides whether a clip contains motion worth uploading. Pure function
/// of the clip and the policy in force at the time it's called — no state
/// survives between invocations.
///
/// Callers MUST treat an `Err` as "motion present": this function only ever
/// narrows a clip down to "definitely nothing happened", never the reverse.
pub fn detect(path: &Path, policy: &PolicySnapshot) -> Result<bool, MotionError> {
    let tuning = policy.motion.normalized();

    let mut capture = videoio::VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
    if !capture.is_opened()? {
        return Err(MotionError::ClipUnavailable(path.to_path_buf()));
    }

    let mut subtractor = video::create_background_subtractor_mog2(tuning.mog_history, tuning.mog_var_thresh, false)?;

    let dilate_kernel = imgproc::get_structuring_element(imgproc::MORPH_RECT, Size::new(3, 3), Point::new(-1, -1))?;

    let mut frame = Mat::default();
    let mut previous_blurred: Option<Mat> = None;

    for frame_index in 0..tuning.max_frames_to_check {
        if !capture.read(&mut frame)? || frame.empty() {
            break;
        }

        let mut gray = Mat::default();
        imgproc::cvt_color(&frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;

        let mut blurred = Mat::default();
        imgproc::gaussian_blur(
            &gray,
            &mut blurred,
            Size::new(21, 21),
            0.0,
            0.0,
            core::BORDER_DEFAULT,
        )?;

        let mut foreground_mask = Mat::default();
        opencv::prelude::BackgroundSubtractorTrait::apply(&mut subtractor, &blurred, &mut foreground_mask, -1.0)?;

        if frame_index < tuning.warm_up_frames {
            previous_blurred = Some(blurred);
            continue;
        }

        if let Some(previous) = &previous_blurred {
            let mut diff = Mat::default();
            core::absdiff(previous, &blurred, &mut diff)?;
            let mut diff_mask = Mat::default();
            imgproc::threshold(&diff, &mut diff_mask, 25.0, 255.0, imgproc::THRESH_BINARY)?;
            let changed_pixels = core::count_non_zero(&diff_mask)?;
            previous_blurred = Some(blurred);
            if changed_pixels < 5000 {
                continue;
            }
        } else {
            previous_blurred = Some(blurred);
        }

        let mut binary_mask = Mat::default();
        imgproc::threshold(&foreground_mask, &mut binary_mask, 25.0, 255.0, imgproc::THRESH_BINARY)?;

        let mut dilated = Mat::default();
        imgproc::dilate(
            &binary_mask,
            &mut dilated,
            &dilate_kernel,
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut contours = core::Vector::<core::Vector<Point>>::new();
        imgproc::find_contours(
            &dilated,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        for contour in contours.iter() {
            if contour_is_motion(&contour, &tuning)? {
                return Ok(true);
            }
        }
    }

    Ok(false)
}

fn contour_is_motion(contour: &core::Vector<Point>, tuning: &crate::policy::MotionTuning) -> Result<bool, MotionError> {
    let area = imgproc::contour_area(contour, false)?;
    if area < tuning.min_area {
        return Ok(false);
    }

    let bounds = imgproc::bounding_rect(contour)?;
    if bounds.width < tuning.min_width || bounds.height < tuning.min_height {
        return Ok(false);
    }

    if bounds.height == 0 {
        return Ok(false);
    }
    let aspect_ratio = bounds.width as f64 / bounds.height as f64;
    Ok(aspect_ratio >= tuning.min_aspect && aspect_ratio <= tuning.max_aspect)
}
