use std::path::{Path, PathBuf};

use image::DynamicImage;
use tracing::instrument;

pub mod annotation;
mod assembler;
mod char_net;
mod config;
mod error;
pub mod pagination;
pub mod pdf;
pub mod report;
mod result;
mod ssd_net;
pub mod util;

pub use annotation::{
    annotation_path, load_tasks, parse_tasks, AnnotationTask, FieldAnnotation, Gender,
    NormalizedRect,
};
pub use assembler::{assemble, FieldText};
pub use char_net::{classify_char, is_blank, softmax, CharClassifier, CharNet};
pub use config::{load_options, parse_options, ExtractionOptions};
pub use error::{Error, Result};
use pagination::{paginate, Page};
use pdf::{is_pdf_bytes, PdfRasterizer};
pub use result::*;
pub use ssd_net::{detect_chars, filter_char_boxes, CharDetector, SsdNet, CHAR_CLASS};
use util::crop_region;

pub use ort as runtime;

pub const DEFAULT_DATA_DIR: &str = "app_data";
pub const DEFAULT_DET_MODEL: &str = "ssd_mobilenetv3_large_kotakkecil.onnx";
pub const DEFAULT_CLS_MODEL: &str = "mobilenetv3_small_char_classifier_augmented.onnx";

pub struct QuestionnaireOcrBuilder {
    threads: usize,
    data_dir: PathBuf,
    det_path: Option<PathBuf>,
    cls_path: Option<PathBuf>,
    options: ExtractionOptions,
    execution_providers: Vec<ExecutionProvider>,
}

impl QuestionnaireOcrBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Directory the default model files are looked up in.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    pub fn det_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.det_path = Some(path.into());
        self
    }

    pub fn cls_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.cls_path = Some(path.into());
        self
    }

    pub fn options(mut self, options: ExtractionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_execution_providers(
        mut self,
        providers: impl IntoIterator<Item = ExecutionProvider>,
    ) -> Self {
        self.execution_providers = providers.into_iter().collect();
        self
    }

    /// Loads both models. A model that is missing or fails to load is logged
    /// and left out; check [`QuestionnaireOcr::is_ready`] before running.
    #[instrument(skip(self))]
    pub fn build(mut self) -> QuestionnaireOcr {
        let det_path = self
            .det_path
            .take()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_DET_MODEL));
        let cls_path = self
            .cls_path
            .take()
            .unwrap_or_else(|| self.data_dir.join(DEFAULT_CLS_MODEL));

        let detector = load_model("detection", &det_path, |path| {
            SsdNet::init(path, self.threads, &self.execution_providers)
        });
        let classifier = load_model("classification", &cls_path, |path| {
            CharNet::init(path, self.threads, &self.execution_providers)
        });

        QuestionnaireOcr::from_models(detector, classifier, self.options)
    }
}

impl Default for QuestionnaireOcrBuilder {
    fn default() -> Self {
        Self {
            threads: 4,
            data_dir: DEFAULT_DATA_DIR.into(),
            det_path: None,
            cls_path: None,
            options: ExtractionOptions::default(),
            execution_providers: DEFAULT_PROVIDERS.to_vec(),
        }
    }
}

fn load_model<T>(kind: &str, path: &Path, init: impl FnOnce(&Path) -> Result<T>) -> Option<T> {
    if !path.exists() {
        log::error!("The {kind} model file was not found at {path:?}");
        return None;
    }
    match init(path) {
        Ok(model) => {
            log::info!("Loaded {kind} model from {path:?}");
            Some(model)
        }
        Err(e) => {
            log::error!("Failed to load {kind} model: {e}");
            None
        }
    }
}

/// Extracts questionnaire answers with a detector and a classifier that are
/// loaded once and only read afterwards.
pub struct QuestionnaireOcr<D = SsdNet, C = CharNet> {
    detector: Option<D>,
    classifier: Option<C>,
    options: ExtractionOptions,
}

impl<D: CharDetector, C: CharClassifier> QuestionnaireOcr<D, C> {
    pub fn from_models(
        detector: Option<D>,
        classifier: Option<C>,
        options: ExtractionOptions,
    ) -> Self {
        Self {
            detector,
            classifier,
            options,
        }
    }

    pub fn options(&self) -> &ExtractionOptions {
        &self.options
    }

    pub fn is_ready(&self) -> bool {
        self.detector.is_some() && self.classifier.is_some()
    }

    /// Detects and classifies the characters of one field image. Returns the
    /// assembled text and the boxes that produced its characters, one box per
    /// character.
    #[instrument(level = "debug", skip_all)]
    pub fn recognize_field(&self, field_image: &DynamicImage) -> Result<(FieldText, Vec<CharBox>)> {
        let boxes = detect_chars(self.detector.as_ref(), field_image, &self.options)?;

        let mut text = FieldText::default();
        let mut used = Vec::with_capacity(boxes.len());
        for char_box in boxes {
            if char_box.is_degenerate() {
                continue;
            }
            let char_image =
                field_image.crop_imm(char_box.x1, char_box.y1, char_box.width(), char_box.height());
            if char_image.width() == 0 || char_image.height() == 0 {
                continue;
            }
            let prediction = classify_char(self.classifier.as_ref(), &char_image, &self.options)?;
            log::trace!("{char_box:?} -> {prediction:?}");
            text.push(prediction, self.options.classification_threshold);
            used.push(char_box);
        }
        Ok((text, used))
    }

    /// Crops an annotated field from its page and recognizes it.
    #[instrument(level = "debug", skip(self, page), fields(question = %field.question_id))]
    pub fn process_field(&self, field: &FieldAnnotation, page: &DynamicImage) -> Result<FieldResult> {
        let image = crop_region(
            page,
            &field.rect,
            field.original_width,
            field.original_height,
        );
        let (text, char_boxes) = self.recognize_field(&image)?;

        #[cfg(feature = "debug")]
        save_debug_field(&image, &char_boxes, field);

        let average_confidence = text.average_confidence();
        Ok(FieldResult {
            question_id: field.question_id.clone(),
            page: field.page,
            text: text.text,
            confidences: text.confidences,
            average_confidence,
            char_boxes,
            image,
        })
    }

    /// Runs every annotated field of every task against the rendered pages.
    /// Fields whose page does not exist or whose recognition fails are
    /// skipped; the rest of the run continues.
    #[instrument(skip_all, fields(tasks = tasks.len(), pages = pages.len()))]
    pub fn extract(&self, tasks: &[AnnotationTask], pages: &[DynamicImage]) -> Result<Extraction> {
        if !self.is_ready() {
            return Err(Error::ModelsNotLoaded);
        }

        let mut extraction = Extraction::default();
        for (task_index, task) in tasks.iter().enumerate() {
            log::info!(
                "Processing annotation task {}/{}",
                task_index + 1,
                tasks.len()
            );
            for field in task.fields() {
                let Some(page_index) = field.page_index(pages.len()) else {
                    log::debug!(
                        "Skipping question {} on missing page {}",
                        field.question_id,
                        field.page
                    );
                    extraction.skipped_fields += 1;
                    continue;
                };
                match self.process_field(&field, &pages[page_index]) {
                    Ok(result) => extraction.results.push(result),
                    Err(e) => {
                        log::warn!("Skipping question {}: {e}", field.question_id);
                        extraction.skipped_fields += 1;
                    }
                }
            }
        }

        log::info!(
            "Extracted {} fields, skipped {}",
            extraction.results.len(),
            extraction.skipped_fields
        );
        Ok(extraction)
    }

    /// Full run over an uploaded questionnaire: loads the field layout,
    /// renders the PDF and extracts every field.
    #[instrument(skip(self, pdf), fields(len = pdf.len()))]
    pub fn extract_pdf(&self, pdf: &[u8], annotations: &Path) -> Result<Extraction> {
        if !self.is_ready() {
            return Err(Error::ModelsNotLoaded);
        }
        if !is_pdf_bytes(pdf) {
            return Err(Error::Pdf("input is not a PDF document".to_string()));
        }
        let tasks = load_tasks(annotations)?;
        let pages = PdfRasterizer::new(self.options.render_dpi)?.render(pdf)?;
        log::info!("Rendered {} pages", pages.len());
        self.extract(&tasks, &pages)
    }
}

/// Results of one extraction run, in annotation order.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub results: Vec<FieldResult>,
    /// Fields left out because their page was missing or recognition failed.
    pub skipped_fields: usize,
}

impl Extraction {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Review page `number` (1-based, clamped) of `page_size` results.
    pub fn page(&self, number: usize, page_size: usize) -> Option<Page<'_, FieldResult>> {
        paginate(&self.results, page_size, number)
    }

    /// Spreadsheet report of all results.
    pub fn report(&self) -> Result<Vec<u8>> {
        report::build_report(&self.results)
    }
}

#[cfg(feature = "debug")]
fn save_debug_field(image: &DynamicImage, boxes: &[CharBox], field: &FieldAnnotation) {
    use image::Rgb;
    use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

    let mut canvas = image.to_rgb8();
    for b in boxes {
        draw_hollow_rect_mut(
            &mut canvas,
            Rect::at(b.x1 as i32, b.y1 as i32).of_size(b.width(), b.height()),
            Rgb([255, 0, 0]),
        );
    }
    let dir = Path::new("debug_fields");
    let path = dir.join(format!("p{}_{}.png", field.page, field.question_id));
    if let Err(e) = std::fs::create_dir_all(dir) {
        log::warn!("Could not create {dir:?}: {e}");
        return;
    }
    if let Err(e) = canvas.save(&path) {
        log::warn!("Could not save {path:?}: {e}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];
