use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load model {path:?}: {source}")]
    ModelLoad { path: PathBuf, source: ort::Error },

    #[error("model inference failed: {0}")]
    Inference(#[from] ort::Error),

    #[error("model output `{0}` is missing")]
    MissingOutput(String),

    #[error("detection and classification models must both be loaded")]
    ModelsNotLoaded,

    #[error("annotation file {0:?} not found")]
    AnnotationNotFound(PathBuf),

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed annotation file: {0}")]
    Annotation(#[from] serde_json::Error),

    #[error("invalid options file: {0}")]
    Options(#[from] toml::de::Error),

    #[error("unknown gender `{0}`, expected `pria` or `perempuan`")]
    UnknownGender(String),

    #[error("failed to rasterize PDF: {0}")]
    Pdf(String),

    #[error("PDF has no pages")]
    EmptyPdf,

    #[error("failed to encode image: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to build report: {0}")]
    Report(#[from] rust_xlsxwriter::XlsxError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
