//! Spreadsheet export of field results.
//!
//! Layout is fixed: a header row, then one row per field with the question
//! number, a thumbnail of the field crop, the recognized text and the average
//! confidence. Thumbnails are encoded in memory, so the returned buffer is
//! self-contained.

use std::{io::Cursor, path::Path};

use image::{
    error::{ParameterError, ParameterErrorKind},
    DynamicImage, ImageError, ImageFormat,
};
use rust_xlsxwriter::{Format, Image, Workbook, Worksheet};
use tracing::instrument;

use crate::{Error, FieldResult, Result};

pub const SHEET_NAME: &str = "Extraction Results";
pub const HEADERS: [&str; 4] = [
    "Question Number",
    "Question Image",
    "Recognized Text",
    "Avg. Confidence",
];
pub const IMAGE_FAILED: &str = "Failed to load image";

const COLUMN_WIDTHS: [f64; 4] = [25.0, 45.0, 30.0, 20.0];
const ROW_HEIGHT: f64 = 70.0;
const THUMBNAIL_HEIGHT: f64 = 80.0;

/// Pixel size of a field thumbnail: fixed height, width following the
/// crop's aspect ratio.
pub fn thumbnail_size(width: u32, height: u32) -> (f64, f64) {
    let aspect_ratio = if height > 0 {
        width as f64 / height as f64
    } else {
        1.0
    };
    (THUMBNAIL_HEIGHT * aspect_ratio, THUMBNAIL_HEIGHT)
}

/// Builds the report workbook and returns the `.xlsx` bytes.
#[instrument(level = "debug", skip(results), fields(rows = results.len()))]
pub fn build_report(results: &[FieldResult]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(SHEET_NAME)?;

    let header = Format::new().set_bold();
    for (col, (title, width)) in HEADERS.iter().zip(COLUMN_WIDTHS).enumerate() {
        worksheet.set_column_width(col as u16, width)?;
        worksheet.write_string_with_format(0, col as u16, *title, &header)?;
    }

    for (index, result) in results.iter().enumerate() {
        let row = index as u32 + 1;
        worksheet.set_row_height(row, ROW_HEIGHT)?;
        worksheet.write_string(row, 0, &result.question_id)?;
        if let Err(e) = insert_thumbnail(worksheet, row, &result.image) {
            log::warn!(
                "Could not embed image for question {}: {e}",
                result.question_id
            );
            worksheet.write_string(row, 1, IMAGE_FAILED)?;
        }
        worksheet.write_string(row, 2, &result.text)?;
        worksheet.write_string(row, 3, result.confidence_label())?;
    }

    Ok(workbook.save_to_buffer()?)
}

fn insert_thumbnail(worksheet: &mut Worksheet, row: u32, image: &DynamicImage) -> Result<()> {
    if image.width() == 0 || image.height() == 0 {
        return Err(Error::Image(ImageError::Parameter(ParameterError::from_kind(
            ParameterErrorKind::DimensionMismatch,
        ))));
    }
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

    let (width, height) = thumbnail_size(image.width(), image.height());
    let thumbnail = Image::new_from_buffer(&png)?
        .set_scale_width(width / image.width() as f64)
        .set_scale_height(height / image.height() as f64);
    worksheet.insert_image(row, 1, &thumbnail)?;
    Ok(())
}

/// Builds the report and writes it to `path`.
pub fn write_report(results: &[FieldResult], path: &Path) -> Result<()> {
    let buffer = build_report(results)?;
    std::fs::write(path, buffer).map_err(|e| Error::io(path, e))?;
    log::info!("Wrote report with {} rows to {path:?}", results.len());
    Ok(())
}

/// Conventional report file name for a processed PDF.
pub fn report_file_name(gender: &str, pdf_path: &Path) -> String {
    let stem = pdf_path
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();
    format!("extraction_results_{gender}_{stem}.xlsx")
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use image::{Rgb, RgbImage};

    use super::*;

    fn result(question_id: &str, image: DynamicImage) -> FieldResult {
        FieldResult {
            question_id: question_id.into(),
            page: 1,
            text: "7?A".into(),
            confidences: vec![0.9, 0.1, 0.6],
            average_confidence: 1.6 / 3.0,
            char_boxes: vec![],
            image,
        }
    }

    fn white(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255])))
    }

    /// Reads one part of the xlsx zip container as text, `None` if absent.
    fn part(buffer: &[u8], name: &str) -> Option<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(buffer)).unwrap();
        let mut file = archive.by_name(name).ok()?;
        let mut text = String::new();
        file.read_to_string(&mut text).unwrap();
        Some(text)
    }

    #[test]
    fn thumbnail_keeps_aspect_ratio() {
        assert_eq!(thumbnail_size(600, 100), (480.0, 80.0));
        assert_eq!(thumbnail_size(50, 100), (40.0, 80.0));
        assert_eq!(thumbnail_size(10, 0), (80.0, 80.0));
    }

    #[test]
    fn rows_hold_question_text_and_confidence() {
        let buffer = build_report(&[result("Q1", white(60, 10)), result("Q2", white(60, 10))])
            .unwrap();

        let workbook = part(&buffer, "xl/workbook.xml").unwrap();
        assert!(workbook.contains(SHEET_NAME));

        let strings = part(&buffer, "xl/sharedStrings.xml").unwrap();
        for header in HEADERS {
            assert!(strings.contains(header), "missing header {header}");
        }
        for value in ["Q1", "Q2", "7?A", "0.53"] {
            assert!(strings.contains(value), "missing cell {value}");
        }
        assert!(!strings.contains(IMAGE_FAILED));

        let sheet = part(&buffer, "xl/worksheets/sheet1.xml").unwrap();
        assert!(sheet.contains("<drawing"));
        let drawing = part(&buffer, "xl/drawings/drawing1.xml").unwrap();
        assert_eq!(drawing.matches("<xdr:pic>").count(), 2);
    }

    #[test]
    fn empty_crop_falls_back_to_text() {
        let buffer = build_report(&[result("Q1", DynamicImage::new_rgb8(0, 0))]).unwrap();

        let strings = part(&buffer, "xl/sharedStrings.xml").unwrap();
        assert!(strings.contains(IMAGE_FAILED));
        assert!(strings.contains("7?A"));

        let sheet = part(&buffer, "xl/worksheets/sheet1.xml").unwrap();
        assert!(!sheet.contains("<drawing"));
        assert!(part(&buffer, "xl/drawings/drawing1.xml").is_none());
    }

    #[test]
    fn empty_results_still_produce_a_header_only_sheet() {
        let buffer = build_report(&[]).unwrap();
        let strings = part(&buffer, "xl/sharedStrings.xml").unwrap();
        for header in HEADERS {
            assert!(strings.contains(header));
        }
        let sheet = part(&buffer, "xl/worksheets/sheet1.xml").unwrap();
        assert!(!sheet.contains("<row r=\"2\""));
    }

    #[test]
    fn write_report_creates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.xlsx");
        write_report(&[result("Q9", white(30, 10))], &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"PK");
        assert!(part(&bytes, "xl/sharedStrings.xml")
            .unwrap()
            .contains("Q9"));
    }

    #[test]
    fn report_name_uses_gender_and_pdf_stem() {
        assert_eq!(
            report_file_name("pria", Path::new("scans/batch 3.pdf")),
            "extraction_results_pria_batch 3.xlsx"
        );
    }
}
