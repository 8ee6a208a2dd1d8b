use std::path::Path;

use geo::{coord, Rect};
use image::DynamicImage;
use ndarray::Axis;
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    util::{build_session, non_max_suppression, subtract_mean_normalize},
    CharBox, Detection, Error, ExecutionProvider, ExtractionOptions, Result,
};

/// Detector class id of a character box; 0 is background.
pub const CHAR_CLASS: i64 = 1;

// The exported graph resizes and normalizes internally and only expects
// pixels in [0, 1].
const MEAN_VALUES: [f32; 3] = [0.0, 0.0, 0.0];
const NORM_VALUES: [f32; 3] = [1.0, 1.0, 1.0];

const BOXES_OUTPUT: &str = "boxes";
const SCORES_OUTPUT: &str = "scores";
const LABELS_OUTPUT: &str = "labels";

/// Anything that finds candidate character boxes in a field image.
pub trait CharDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>>;
}

/// SSDLite320 MobileNetV3 character box detector exported to ONNX.
pub struct SsdNet {
    session: Session,
    input_name: String,
}

impl SsdNet {
    #[instrument(level = "debug", skip(execution_providers))]
    pub fn init(
        path: &Path,
        num_threads: usize,
        execution_providers: &[ExecutionProvider],
    ) -> Result<Self> {
        let session = build_session(path, num_threads, execution_providers).map_err(|source| {
            Error::ModelLoad {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "images".to_string());

        Ok(Self {
            session,
            input_name,
        })
    }
}

impl CharDetector for SsdNet {
    #[instrument(level = "debug", skip(self, image))]
    fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>> {
        let image = DynamicImage::ImageRgb8(image.to_rgb8());
        let input_values =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input_values]?)?;

        let output = |name: &str| {
            outputs
                .get(name)
                .ok_or_else(|| Error::MissingOutput(name.to_string()))
        };
        let boxes = output(BOXES_OUTPUT)?
            .try_extract_tensor::<f32>()?
            .iter()
            .copied()
            .collect::<Vec<_>>();
        let scores = output(SCORES_OUTPUT)?.try_extract_tensor::<f32>()?;
        let labels = output(LABELS_OUTPUT)?.try_extract_tensor::<i64>()?;
        log::trace!(
            "Detector produced {} boxes, {} scores, {} labels",
            boxes.len() / 4,
            scores.len(),
            labels.len()
        );

        Ok(boxes
            .chunks_exact(4)
            .zip(scores.iter())
            .zip(labels.iter())
            .map(|((b, &score), &label)| Detection {
                rect: Rect::new(coord! { x: b[0], y: b[1] }, coord! { x: b[2], y: b[3] }),
                score,
                label,
            })
            .collect())
    }
}

/// Runs the detector over a field image and keeps plausible character boxes
/// in reading order. A missing detector finds nothing.
#[instrument(level = "debug", skip(detector, image, options))]
pub fn detect_chars<D: CharDetector + ?Sized>(
    detector: Option<&D>,
    image: &DynamicImage,
    options: &ExtractionOptions,
) -> Result<Vec<CharBox>> {
    let Some(detector) = detector else {
        return Ok(Vec::new());
    };
    let detections = detector.detect(image)?;
    Ok(filter_char_boxes(
        detections,
        image.width(),
        image.height(),
        options,
    ))
}

/// Post-processing of raw detections:
///
/// 1. drop other classes and scores at or below the detection threshold,
/// 2. class agnostic NMS,
/// 3. drop boxes that are too small or too elongated to be a character,
/// 4. clamp to the field image and drop boxes left without area,
/// 5. sort left to right.
#[instrument(level = "trace", skip(detections, options))]
pub fn filter_char_boxes(
    detections: Vec<Detection>,
    width: u32,
    height: u32,
    options: &ExtractionOptions,
) -> Vec<CharBox> {
    let candidates = detections
        .into_iter()
        .filter(|det| det.label == CHAR_CLASS && det.score > options.detection_threshold)
        .collect::<Vec<_>>();
    if candidates.is_empty() {
        return Vec::new();
    }

    let mut boxes = non_max_suppression(candidates, options.nms_iou_threshold)
        .into_iter()
        .map(|det| {
            let min = det.rect.min();
            let max = det.rect.max();
            [min.x as i64, min.y as i64, max.x as i64, max.y as i64]
        })
        .filter(|b| is_plausible_char(b, options))
        .filter_map(|[x1, y1, x2, y2]| {
            let char_box = CharBox {
                x1: x1.clamp(0, width as i64) as u32,
                y1: y1.clamp(0, height as i64) as u32,
                x2: x2.clamp(0, width as i64) as u32,
                y2: y2.clamp(0, height as i64) as u32,
            };
            (!char_box.is_degenerate()).then_some(char_box)
        })
        .collect::<Vec<_>>();

    boxes.sort_by_key(|b| b.x1);
    log::trace!("Kept {} character boxes", boxes.len());
    boxes
}

fn is_plausible_char(&[x1, y1, x2, y2]: &[i64; 4], options: &ExtractionOptions) -> bool {
    let w = x2.saturating_sub(x1);
    let h = y2.saturating_sub(y1);
    if w < options.min_box_width as i64
        || h < options.min_box_height as i64
        || w.saturating_mul(h) < options.min_box_area as i64
    {
        return false;
    }
    let aspect_ratio = w as f32 / h as f32;
    aspect_ratio <= options.max_aspect_ratio && 1.0 / aspect_ratio <= options.max_aspect_ratio
}
