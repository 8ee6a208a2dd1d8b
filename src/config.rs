//! Thresholds and presentation settings for an extraction run.
//!
//! Every field has a default matching the values the detector and classifier
//! checkpoints were tuned with, so an options file only needs to list the
//! values it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionOptions {
    /// Minimum detector score for a character box.
    pub detection_threshold: f32,
    /// IoU above which the lower scoring of two boxes is suppressed.
    pub nms_iou_threshold: f32,
    pub min_box_width: u32,
    pub min_box_height: u32,
    pub min_box_area: u32,
    /// Largest allowed `max(w / h, h / w)` of a character box.
    pub max_aspect_ratio: f32,
    /// Predictions below this confidence are replaced by the sentinel.
    pub classification_threshold: f32,
    /// A crop is blank when its grey stddev is below this...
    pub blank_max_stddev: f32,
    /// ...and its grey mean is above this.
    pub blank_min_mean: f32,
    /// Results per review page.
    pub page_size: usize,
    /// Resolution PDF pages are rendered at.
    pub render_dpi: f32,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            detection_threshold: 0.3,
            nms_iou_threshold: 0.3,
            min_box_width: 5,
            min_box_height: 10,
            min_box_area: 5 * 10,
            max_aspect_ratio: 2.5,
            classification_threshold: 0.5,
            blank_max_stddev: 7.0,
            blank_min_mean: 240.0,
            page_size: 30,
            render_dpi: 300.0,
        }
    }
}

/// Reads options from a TOML file. Missing keys keep their defaults.
pub fn load_options(path: &Path) -> Result<ExtractionOptions> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    parse_options(&content)
}

pub fn parse_options(content: &str) -> Result<ExtractionOptions> {
    let options = toml::from_str(content)?;
    log::debug!("Loaded extraction options: {options:?}");
    Ok(options)
}
