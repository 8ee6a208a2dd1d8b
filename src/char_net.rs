use std::path::Path;

use float_ord::FloatOrd;
use image::{imageops::FilterType, DynamicImage};
use ndarray::Axis;
use ort::{inputs, Session};
use tracing::instrument;

use crate::{
    util::{build_session, grey_stats, subtract_mean_normalize},
    Error, ExecutionProvider, ExtractionOptions, Prediction, Result, ALPHABET, SENTINEL,
};

const DEST_WIDTH: u32 = 64;
const DEST_HEIGHT: u32 = 64;

const MEAN_VALUES: [f32; 3] = [0.485, 0.456, 0.406];
const NORM_VALUES: [f32; 3] = [1.0 / 0.229, 1.0 / 0.224, 1.0 / 0.225];

/// Anything that scores a single character crop against [`ALPHABET`].
pub trait CharClassifier {
    /// Raw class logits, one per alphabet entry.
    fn logits(&self, image: &DynamicImage) -> Result<Vec<f32>>;
}

/// MobileNetV3-Small character classifier exported to ONNX.
pub struct CharNet {
    session: Session,
    input_name: String,
}

impl CharNet {
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
            .unwrap_or_else(|| "input".to_string());

        Ok(Self {
            session,
            input_name,
        })
    }
}

impl CharClassifier for CharNet {
    #[instrument(level = "trace", skip(self, image))]
    fn logits(&self, image: &DynamicImage) -> Result<Vec<f32>> {
        let image = DynamicImage::ImageRgb8(image.to_rgb8()).resize_exact(
            DEST_WIDTH,
            DEST_HEIGHT,
            FilterType::Triangle,
        );
        let input_values =
            subtract_mean_normalize(&image, &MEAN_VALUES, &NORM_VALUES).insert_axis(Axis(0));
        let outputs = self
            .session
            .run(inputs![self.input_name.as_str() => input_values]?)?;
        let (_, output) = outputs
            .first_key_value()
            .ok_or_else(|| Error::MissingOutput("logits".to_string()))?;

        Ok(output.try_extract_tensor::<f32>()?.iter().copied().collect())
    }
}

/// Whether a crop is visually empty: nearly uniform and nearly white.
pub fn is_blank(image: &DynamicImage, options: &ExtractionOptions) -> bool {
    let (mean, stddev) = grey_stats(image);
    stddev < options.blank_max_stddev && mean > options.blank_min_mean
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits
        .iter()
        .copied()
        .max_by_key(|value| FloatOrd(*value))
        .unwrap_or(0.0);
    let exps = logits.iter().map(|l| (l - max).exp()).collect::<Vec<_>>();
    let sum = exps.iter().sum::<f32>();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Classifies one character crop. Crops smaller than the minimum character
/// box and blank crops are reported as the sentinel with zero confidence
/// without running the model, as is every crop when no model is loaded.
#[instrument(level = "trace", skip_all)]
pub fn classify_char<C: CharClassifier + ?Sized>(
    classifier: Option<&C>,
    image: &DynamicImage,
    options: &ExtractionOptions,
) -> Result<Prediction> {
    let Some(classifier) = classifier else {
        return Ok(Prediction::unrecognized());
    };
    if image.width() < options.min_box_width || image.height() < options.min_box_height {
        return Ok(Prediction::unrecognized());
    }
    if is_blank(image, options) {
        log::trace!("Character crop is blank");
        return Ok(Prediction::unrecognized());
    }

    let probabilities = softmax(&classifier.logits(image)?);
    let prediction = probabilities
        .iter()
        .enumerate()
        .max_by_key(|(_, p)| FloatOrd(**p))
        .filter(|(_, p)| p.is_finite())
        .map(|(index, &confidence)| Prediction {
            character: ALPHABET.get(index).copied().unwrap_or(SENTINEL),
            confidence: confidence.clamp(0.0, 1.0),
        })
        .unwrap_or_else(Prediction::unrecognized);
    Ok(prediction)
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use image::{GrayImage, Luma};
    use imageproc::{drawing::draw_filled_rect_mut, rect::Rect};

    use super::*;

    struct FixedClassifier {
        logits: Vec<f32>,
        calls: Cell<usize>,
    }

    impl FixedClassifier {
        fn favoring(index: usize) -> Self {
            let mut logits = vec![0.0; ALPHABET.len()];
            logits[index] = 5.0;
            Self {
                logits,
                calls: Cell::new(0),
            }
        }
    }

    impl CharClassifier for FixedClassifier {
        fn logits(&self, _image: &DynamicImage) -> Result<Vec<f32>> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.logits.clone())
        }
    }

    fn stroke(width: u32, height: u32) -> DynamicImage {
        let mut image = GrayImage::from_pixel(width, height, Luma([255]));
        draw_filled_rect_mut(
            &mut image,
            Rect::at(width as i32 / 4, 0).of_size((width / 2).max(1), height),
            Luma([0]),
        );
        DynamicImage::ImageLuma8(image)
    }

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        assert!(p[2] > p[1] && p[1] > p[0]);
        let large = softmax(&[1000.0, 1000.0]);
        assert!((large[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn predicts_the_argmax_class() {
        let classifier = FixedClassifier::favoring(17);
        let prediction =
            classify_char(Some(&classifier), &stroke(20, 30), &ExtractionOptions::default())
                .unwrap();
        assert_eq!(prediction.character, 'X');
        assert!(prediction.confidence > 0.5 && prediction.confidence <= 1.0);
        assert_eq!(classifier.calls.get(), 1);
    }

    #[test]
    fn tiny_crops_skip_the_model() {
        let classifier = FixedClassifier::favoring(3);
        let options = ExtractionOptions::default();
        for (w, h) in [(4, 30), (20, 9), (1, 1)] {
            let prediction = classify_char(Some(&classifier), &stroke(w, h), &options).unwrap();
            assert_eq!(prediction, Prediction::unrecognized());
        }
        assert_eq!(classifier.calls.get(), 0);
    }

    #[test]
    fn blank_crops_skip_the_model() {
        let classifier = FixedClassifier::favoring(3);
        let blank = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 30, Luma([250])));
        let prediction =
            classify_char(Some(&classifier), &blank, &ExtractionOptions::default()).unwrap();
        assert_eq!(prediction, Prediction::unrecognized());
        assert_eq!(classifier.calls.get(), 0);
    }

    #[test]
    fn uniform_grey_is_not_blank() {
        let options = ExtractionOptions::default();
        let grey = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 30, Luma([200])));
        assert!(!is_blank(&grey, &options));
        assert!(!is_blank(&stroke(20, 30), &options));
    }

    #[test]
    fn blank_thresholds_are_configurable() {
        let grey = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 30, Luma([200])));
        let options = ExtractionOptions {
            blank_min_mean: 150.0,
            ..Default::default()
        };
        assert!(is_blank(&grey, &options));
    }

    #[test]
    fn missing_model_is_unrecognized() {
        let prediction = classify_char::<FixedClassifier>(
            None,
            &stroke(20, 30),
            &ExtractionOptions::default(),
        )
        .unwrap();
        assert_eq!(prediction, Prediction::unrecognized());
    }

    #[test]
    fn out_of_alphabet_index_is_the_sentinel() {
        let mut logits = vec![0.0; ALPHABET.len() + 1];
        logits[ALPHABET.len()] = 9.0;
        let classifier = FixedClassifier {
            logits,
            calls: Cell::new(0),
        };
        let prediction =
            classify_char(Some(&classifier), &stroke(20, 30), &ExtractionOptions::default())
                .unwrap();
        assert_eq!(prediction.character, SENTINEL);
    }

    #[test]
    fn non_finite_logits_are_unrecognized() {
        for bad in [f32::NAN, f32::INFINITY] {
            let mut logits = vec![0.0; ALPHABET.len()];
            logits[7] = bad;
            let classifier = FixedClassifier {
                logits,
                calls: Cell::new(0),
            };
            let prediction =
                classify_char(Some(&classifier), &stroke(20, 30), &ExtractionOptions::default())
                    .unwrap();
            assert_eq!(prediction, Prediction::unrecognized());

            let field = crate::assemble([prediction], 0.5);
            assert_eq!(field.text, "?");
            assert_eq!(field.average_confidence(), 0.0);
        }
    }
}
