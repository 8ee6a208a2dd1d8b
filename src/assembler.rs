use crate::{Prediction, SENTINEL};

/// A field's recognized string together with the confidence of every
/// character, rejected ones included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldText {
    pub text: String,
    pub confidences: Vec<f32>,
}

impl FieldText {
    /// Mean character confidence; 0.0 for a field without characters.
    pub fn average_confidence(&self) -> f32 {
        if self.confidences.is_empty() {
            return 0.0;
        }
        self.confidences.iter().sum::<f32>() / self.confidences.len() as f32
    }

    /// Appends one character. A non-finite confidence counts as zero.
    pub fn push(&mut self, prediction: Prediction, threshold: f32) {
        let confidence = if prediction.confidence.is_finite() {
            prediction.confidence
        } else {
            0.0
        };
        if prediction.is_sentinel() || confidence < threshold {
            self.text.push(SENTINEL);
        } else {
            self.text.push(prediction.character);
        }
        self.confidences.push(confidence);
    }
}

/// Joins per-character predictions in reading order. Predictions below
/// `threshold` become the sentinel but still count toward the average.
pub fn assemble(predictions: impl IntoIterator<Item = Prediction>, threshold: f32) -> FieldText {
    predictions
        .into_iter()
        .fold(FieldText::default(), |mut field, prediction| {
            field.push(prediction, threshold);
            field
        })
}
