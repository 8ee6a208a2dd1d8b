//! Rendering of questionnaire PDFs to page images.

use image::DynamicImage;
use pdfium_render::prelude::*;
use tracing::instrument;

use crate::{Error, Result};

/// Renders PDF pages with PDFium at a fixed resolution.
pub struct PdfRasterizer {
    pdfium: Pdfium,
    dpi: f32,
}

impl PdfRasterizer {
    /// Binds to a PDFium library next to the executable, falling back to the
    /// system one.
    pub fn new(dpi: f32) -> Result<Self> {
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library())
            .map_err(|e| Error::Pdf(format!("could not find PDFium library: {e}")))?;

        Ok(Self {
            pdfium: Pdfium::new(bindings),
            dpi,
        })
    }

    /// Renders every page of an in-memory PDF, first page first.
    #[instrument(level = "debug", skip(self, bytes), fields(len = bytes.len()))]
    pub fn render(&self, bytes: &[u8]) -> Result<Vec<DynamicImage>> {
        let document = self
            .pdfium
            .load_pdf_from_byte_slice(bytes, None)
            .map_err(|e| Error::Pdf(e.to_string()))?;

        let pages = document.pages();
        if pages.len() == 0 {
            return Err(Error::EmptyPdf);
        }

        pages
            .iter()
            .enumerate()
            .map(|(index, page)| {
                self.render_page(&page)
                    .map_err(|e| Error::Pdf(format!("page {}: {e}", index + 1)))
            })
            .collect()
    }

    fn render_page(&self, page: &PdfPage) -> Result<DynamicImage, PdfiumError> {
        let scale = self.dpi / 72.0;
        let width = (page.width().value * scale) as i32;
        let height = (page.height().value * scale) as i32;
        log::debug!("Rendering page at {width}x{height}");

        let render_config = PdfRenderConfig::new()
            .set_target_width(width)
            .set_target_height(height)
            .render_form_data(true)
            .render_annotations(true);

        let bitmap = page.render_with_config(&render_config)?;
        Ok(DynamicImage::ImageRgb8(bitmap.as_image().to_rgb8()))
    }
}

/// Whether `bytes` start with the PDF magic number.
pub fn is_pdf_bytes(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF")
}
