use std::{cmp::Reverse, path::Path};

use float_ord::FloatOrd;
use geo::{Area, Rect};
use image::{DynamicImage, GrayImage, Luma, Pixel, Rgb};
use ndarray::Array3;
use ort::{ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::{annotation::NormalizedRect, Detection, ExecutionProvider};

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

#[cfg(feature = "coreml")]
fn setup_coreml() -> ExecutionProviderDispatch {
    use ort::CoreMLExecutionProvider;

    CoreMLExecutionProvider::default().build()
}

#[instrument(level = "debug", skip(execution_providers))]
pub(crate) fn build_session(
    path: &Path,
    num_threads: usize,
    execution_providers: &[ExecutionProvider],
) -> ort::Result<Session> {
    #[cfg(feature = "directml")]
    let parallel = !execution_providers.contains(&ExecutionProvider::DirectML);
    #[cfg(not(feature = "directml"))]
    let parallel = true;

    let execution_providers = execution_providers.iter().filter_map(
        |provider| -> Option<ExecutionProviderDispatch> {
            match provider {
                ExecutionProvider::Default => None,
                #[cfg(feature = "coreml")]
                ExecutionProvider::CoreML => Some(setup_coreml()),
                #[cfg(feature = "cuda")]
                ExecutionProvider::Cuda => Some(setup_cuda()),
                #[cfg(feature = "directml")]
                ExecutionProvider::DirectML => Some(setup_directml()),
            }
        },
    );

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_memory_pattern(parallel)?
        .with_intra_threads(num_threads)?
        .with_execution_providers(execution_providers)?
        .commit_from_file(path)?;

    log::debug!("Session inputs for {path:?}: {:?}", session.inputs);
    log::debug!("Session outputs for {path:?}: {:?}", session.outputs);

    Ok(session)
}

/// Converts an image to a normalized CHW tensor: `pixel * norm - mean * norm`
/// per channel, with pixels in `[0, 1]`.
#[instrument(level = "trace", skip(image))]
pub(crate) fn subtract_mean_normalize(
    image: &DynamicImage,
    mean_vals: &[f32; 3],
    norm_vals: &[f32; 3],
) -> Array3<f32> {
    let mut image = image.to_rgb32f();
    let norm = Rgb::<f32>(*norm_vals);
    let mean_vals = Rgb::<f32>(*mean_vals).map2(&norm, |c1, c2| c1 * c2);
    for pixel in image.pixels_mut() {
        *pixel = pixel
            .map2(&norm, |c1, c2| c1 * c2)
            .map2(&mean_vals, |c1, c2| c1 - c2);
    }
    Array3::<f32>::from_shape_fn(
        (3, image.height() as usize, image.width() as usize),
        |(ch, y, x)| image.get_pixel(x as u32, y as u32).channels()[ch],
    )
}

/// Intersection over union of two axis aligned rectangles. Zero when either
/// rectangle has no area.
pub fn iou(a: &Rect<f32>, b: &Rect<f32>) -> f32 {
    let width = a.max().x.min(b.max().x) - a.min().x.max(b.min().x);
    let height = a.max().y.min(b.max().y) - a.min().y.max(b.min().y);
    if width <= 0.0 || height <= 0.0 {
        return 0.0;
    }
    let intersection = width * height;
    let union = a.unsigned_area() + b.unsigned_area() - intersection;
    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Greedy class agnostic NMS. Keeps the best scoring box of every cluster
/// whose pairwise IoU exceeds `iou_threshold`. Output is sorted by
/// descending score.
#[instrument(level = "trace", skip(detections))]
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by_key(|det| Reverse(FloatOrd(det.score)));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept
            .iter()
            .all(|other| iou(&other.rect, &det.rect) <= iou_threshold)
        {
            kept.push(det);
        }
    }
    kept
}

/// Cuts an annotated field out of a rendered page. The rectangle is given in
/// percent of the annotation-time image size and is scaled to the actual
/// page size, then clamped to the page; a rectangle off the page yields an
/// empty image.
pub fn crop_region(
    page: &DynamicImage,
    rect: &NormalizedRect,
    original_width: f32,
    original_height: f32,
) -> DynamicImage {
    let (original_width, original_height) = (original_width as f64, original_height as f64);
    let scale_x = page.width() as f64 / original_width;
    let scale_y = page.height() as f64 / original_height;

    let x = rect.x as f64 / 100.0 * original_width * scale_x;
    let y = rect.y as f64 / 100.0 * original_height * scale_y;
    let w = rect.width as f64 / 100.0 * original_width * scale_x;
    let h = rect.height as f64 / 100.0 * original_height * scale_y;

    let left = (x.round().max(0.0) as u32).min(page.width());
    let top = (y.round().max(0.0) as u32).min(page.height());
    let right = ((x + w).round().max(0.0) as u32).clamp(left, page.width());
    let bottom = ((y + h).round().max(0.0) as u32).clamp(top, page.height());

    log::trace!("Cropping field to ({left}, {top}) .. ({right}, {bottom})");
    page.crop_imm(left, top, right - left, bottom - top)
}

/// Greyscale conversion with Rec. 601 weights (0.299, 0.587, 0.114) in
/// 16-bit fixed point, rounded.
pub(crate) fn to_grey_601(image: &DynamicImage) -> GrayImage {
    imageproc::map::map_colors(&image.to_rgb8(), |Rgb([r, g, b])| {
        let luma = (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16;
        Luma([luma as u8])
    })
}

/// Mean and population standard deviation of the greyscale intensities.
pub(crate) fn grey_stats(image: &DynamicImage) -> (f32, f32) {
    let grey = to_grey_601(image);
    let histogram = imageproc::stats::histogram(&grey);
    let counts = &histogram.channels[0];

    let n = counts.iter().map(|&c| c as f64).sum::<f64>();
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let (sum, sum_sq) = counts
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(sum, sum_sq), (value, &count)| {
            let value = value as f64;
            let count = count as f64;
            (sum + value * count, sum_sq + value * value * count)
        });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    (mean as f32, variance.sqrt() as f32)
}

#[cfg(test)]
mod tests {
    use geo::coord;

    use super::*;

    fn rect(x1: f32, y1: f32, x2: f32, y2: f32) -> Rect<f32> {
        Rect::new(coord! { x: x1, y: y1 }, coord! { x: x2, y: y2 })
    }

    fn det(x1: f32, y1: f32, x2: f32, y2: f32, score: f32) -> Detection {
        Detection {
            rect: rect(x1, y1, x2, y2),
            score,
            label: 1,
        }
    }

    #[test]
    fn iou_of_overlapping_boxes() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        let b = rect(5.0, 5.0, 15.0, 15.0);
        // 25 / (100 + 100 - 25)
        assert!((iou(&a, &b) - 25.0 / 175.0).abs() < 1e-6);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &rect(20.0, 20.0, 30.0, 30.0)), 0.0);
    }

    #[test]
    fn nms_keeps_highest_score_per_cluster() {
        let detections = vec![
            det(0.0, 0.0, 10.0, 20.0, 0.6),
            det(1.0, 0.0, 11.0, 20.0, 0.9),
            det(40.0, 0.0, 50.0, 20.0, 0.5),
        ];
        let kept = non_max_suppression(detections, 0.3);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].score - 0.9).abs() < f32::EPSILON);
        assert!((kept[1].score - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn nms_keeps_boxes_at_threshold() {
        // IoU of exactly 1/3 is not above a 0.34 threshold
        let detections = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.9),
            det(5.0, 0.0, 15.0, 10.0, 0.8),
        ];
        assert_eq!(non_max_suppression(detections.clone(), 0.34).len(), 2);
        assert_eq!(non_max_suppression(detections, 0.3).len(), 1);
    }

    #[test]
    fn crop_scales_to_page_size() {
        let page = DynamicImage::new_rgb8(2000, 3000);
        let field = NormalizedRect {
            x: 10.0,
            y: 20.0,
            width: 30.0,
            height: 5.0,
        };
        let crop = crop_region(&page, &field, 1000.0, 1500.0);
        assert_eq!(crop.width(), 600);
        assert_eq!(crop.height(), 150);
    }

    #[test]
    fn crop_takes_the_annotated_pixels() {
        let mut page = GrayImage::from_pixel(200, 100, Luma([255]));
        page.put_pixel(20, 10, Luma([0]));
        let page = DynamicImage::ImageLuma8(page);
        let field = NormalizedRect {
            x: 10.0,
            y: 10.0,
            width: 10.0,
            height: 10.0,
        };
        let crop = crop_region(&page, &field, 100.0, 50.0).to_luma8();
        assert_eq!(crop.dimensions(), (20, 10));
        assert_eq!(crop.get_pixel(0, 0), &Luma([0]));
        assert_eq!(crop.get_pixel(1, 0), &Luma([255]));
    }

    #[test]
    fn crop_outside_page_is_empty() {
        let page = DynamicImage::new_rgb8(100, 100);
        let field = NormalizedRect {
            x: 150.0,
            y: 10.0,
            width: 20.0,
            height: 20.0,
        };
        let crop = crop_region(&page, &field, 100.0, 100.0);
        assert_eq!(crop.width(), 0);
    }

    #[test]
    fn crop_past_the_edge_is_clamped() {
        let page = DynamicImage::new_rgb8(100, 100);
        let field = NormalizedRect {
            x: 90.0,
            y: -5.0,
            width: 20.0,
            height: 20.0,
        };
        let crop = crop_region(&page, &field, 100.0, 100.0);
        assert_eq!(crop.width(), 10);
        assert_eq!(crop.height(), 15);
    }

    #[test]
    fn grey_stats_of_uniform_and_split_images() {
        let white = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([250])));
        let (mean, stddev) = grey_stats(&white);
        assert!((mean - 250.0).abs() < 1e-3);
        assert!(stddev.abs() < 1e-3);

        let mut split = GrayImage::from_pixel(2, 1, Luma([0]));
        split.put_pixel(1, 0, Luma([200]));
        let (mean, stddev) = grey_stats(&DynamicImage::ImageLuma8(split));
        assert!((mean - 100.0).abs() < 1e-3);
        assert!((stddev - 100.0).abs() < 1e-3);
    }

    #[test]
    fn grey_conversion_uses_601_weights() {
        let red = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(2, 2, Rgb([255, 0, 0])));
        assert_eq!(to_grey_601(&red).get_pixel(0, 0), &Luma([76]));
        let (mean, _) = grey_stats(&red);
        assert!((mean - 76.0).abs() < 1e-3);

        let mixed = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(1, 1, Rgb([10, 200, 90])));
        // 0.299 * 10 + 0.587 * 200 + 0.114 * 90 = 130.65
        assert_eq!(to_grey_601(&mixed).get_pixel(0, 0), &Luma([131]));

        for v in [0, 1, 127, 254, 255] {
            let grey = DynamicImage::ImageLuma8(GrayImage::from_pixel(1, 1, Luma([v])));
            assert_eq!(to_grey_601(&grey).get_pixel(0, 0), &Luma([v]));
        }
    }

    #[test]
    fn normalize_applies_mean_and_norm() {
        let image = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(2, 3, Rgb([255, 0, 255])));
        let tensor = subtract_mean_normalize(&image, &[0.5, 0.5, 0.5], &[2.0, 2.0, 2.0]);
        assert_eq!(tensor.dim(), (3, 3, 2));
        assert!((tensor[(0, 0, 0)] - 1.0).abs() < 1e-6);
        assert!((tensor[(1, 2, 1)] + 1.0).abs() < 1e-6);
    }
}
