use geo::Rect;
use image::DynamicImage;

/// Placeholder for a character that could not be read with confidence.
pub const SENTINEL: char = '?';

/// Classes of the character classifier, in logit order.
pub const ALPHABET: [char; 20] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'X', 'Y',
    'Z',
];

/// Raw detector output in field image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub rect: Rect<f32>,
    pub score: f32,
    pub label: i64,
}

/// Character rectangle within a field image. `x2` and `y2` are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl CharBox {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub character: char,
    pub confidence: f32,
}

impl Prediction {
    pub fn unrecognized() -> Self {
        Self {
            character: SENTINEL,
            confidence: 0.0,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.character == SENTINEL
    }
}

/// Recognized answer of one annotated question field.
#[derive(Debug, Clone)]
pub struct FieldResult {
    pub question_id: String,
    pub page: u32,
    pub text: String,
    pub confidences: Vec<f32>,
    pub average_confidence: f32,
    pub char_boxes: Vec<CharBox>,
    pub image: DynamicImage,
}

impl FieldResult {
    /// Average confidence as shown to reviewers, e.g. `"0.53"`.
    pub fn confidence_label(&self) -> String {
        format!("{:.2}", self.average_confidence)
    }
}
