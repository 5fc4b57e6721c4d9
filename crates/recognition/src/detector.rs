//! Heuristic plate region detection.
//!
//! A frame is binarized with a local-mean threshold, split into connected
//! regions, and every region is scored on how much it looks like a plate:
//! filled and rectangular, with a width/height ratio near the usual 4:1.

use crate::config::DetectionConfig;
use common::plates::{BoundingBox, CandidateRegion};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::collections::BTreeMap;

pub const MIN_ASPECT_RATIO: f32 = 1.5;
pub const MAX_ASPECT_RATIO: f32 = 5.0;
pub const IDEAL_ASPECT_RATIO: f32 = 4.0;

const RECTANGULARITY_WEIGHT: f32 = 0.6;
const ASPECT_WEIGHT: f32 = 0.4;

/// Per-call detection settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionSettings {
    /// Candidates scoring below this are dropped
    pub confidence_threshold: f32,
    /// Minimum width/height as a percentage of the frame dimensions
    pub min_plate_size: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            min_plate_size: 5.0,
            iou_threshold: 0.4,
            max_detections: 10,
        }
    }
}

/// Geometry of one connected region
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionStats {
    pub bbox: BoundingBox,
    /// Number of foreground pixels in the region
    pub filled_area: u64,
}

impl RegionStats {
    pub fn rectangularity(&self) -> f32 {
        let area = self.bbox.area();
        if area == 0 {
            return 0.0;
        }
        (self.filled_area as f32 / area as f32).clamp(0.0, 1.0)
    }
}

/// Plate-likeness of a region in [0, 1]
pub fn region_confidence(stats: &RegionStats) -> f32 {
    let aspect = stats.bbox.aspect_ratio();
    let aspect_score = (1.0 - (aspect - IDEAL_ASPECT_RATIO).abs() / IDEAL_ASPECT_RATIO).clamp(0.0, 1.0);
    (RECTANGULARITY_WEIGHT * stats.rectangularity() + ASPECT_WEIGHT * aspect_score).clamp(0.0, 1.0)
}

/// Size/aspect filter, scoring, thresholding and non-maximum suppression.
///
/// Pure function over region statistics; `detect` feeds it the connected
/// regions of a frame.
pub fn filter_regions(
    regions: &[RegionStats],
    frame_width: u32,
    frame_height: u32,
    settings: &DetectionSettings,
) -> Vec<CandidateRegion> {
    let min_width = frame_width as f32 * settings.min_plate_size / 100.0;
    let min_height = frame_height as f32 * settings.min_plate_size / 100.0;

    let candidates: Vec<CandidateRegion> = regions
        .iter()
        .filter(|r| r.bbox.width as f32 >= min_width && r.bbox.height as f32 >= min_height)
        .filter(|r| {
            let aspect = r.bbox.aspect_ratio();
            (MIN_ASPECT_RATIO..=MAX_ASPECT_RATIO).contains(&aspect)
        })
        .map(|r| CandidateRegion {
            bbox: r.bbox,
            confidence: region_confidence(r),
        })
        .filter(|c| c.confidence >= settings.confidence_threshold)
        .collect();

    let mut kept = nms(candidates, settings.iou_threshold);
    kept.truncate(settings.max_detections);
    kept
}

/// Keep the most confident of every group of overlapping candidates
fn nms(mut candidates: Vec<CandidateRegion>, iou_threshold: f32) -> Vec<CandidateRegion> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<CandidateRegion> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if keep
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) < iou_threshold)
        {
            keep.push(candidate);
        }
    }
    keep
}

pub struct PlateRegionDetector {
    config: DetectionConfig,
}

impl PlateRegionDetector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    /// Settings derived from the pipeline configuration
    pub fn settings(&self, confidence_threshold: f32) -> DetectionSettings {
        DetectionSettings {
            confidence_threshold,
            min_plate_size: self.config.min_plate_size,
            iou_threshold: self.config.iou_threshold,
            max_detections: self.config.max_detections,
        }
    }

    /// Candidate plate regions of a frame; empty when nothing qualifies
    pub fn detect(&self, frame: &DynamicImage, settings: &DetectionSettings) -> Vec<CandidateRegion> {
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Vec::new();
        }

        let binary = self.binarize(&frame.to_luma8());
        let regions = Self::extract_regions(&binary);
        let candidates = filter_regions(&regions, width, height, settings);

        tracing::debug!(
            regions = regions.len(),
            candidates = candidates.len(),
            "plate region detection finished"
        );
        candidates
    }

    /// Local-mean adaptive threshold with a brightness floor
    fn binarize(&self, gray: &GrayImage) -> GrayImage {
        let blurred = if self.config.blur_sigma > 0.0 {
            imageproc::filter::gaussian_blur_f32(gray, self.config.blur_sigma)
        } else {
            gray.clone()
        };
        let radius = self.config.block_radius.max(1);
        let local_mean = imageproc::filter::box_filter(&blurred, radius, radius);

        let floor = self.config.min_region_intensity;
        let offset = self.config.threshold_offset;
        let mut binary = GrayImage::new(gray.width(), gray.height());
        for (x, y, pixel) in blurred.enumerate_pixels() {
            let value = pixel[0];
            let mean = local_mean.get_pixel(x, y)[0];
            if value >= floor && value as i16 > mean as i16 - offset {
                binary.put_pixel(x, y, Luma([255u8]));
            }
        }
        binary
    }

    fn extract_regions(binary: &GrayImage) -> Vec<RegionStats> {
        let labels = connected_components(binary, Connectivity::Eight, Luma([0u8]));

        // label -> (min_x, min_y, max_x, max_y, count)
        let mut extents: BTreeMap<u32, (u32, u32, u32, u32, u64)> = BTreeMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label[0];
            if label == 0 {
                continue;
            }
            let entry = extents.entry(label).or_insert((x, y, x, y, 0));
            entry.0 = entry.0.min(x);
            entry.1 = entry.1.min(y);
            entry.2 = entry.2.max(x);
            entry.3 = entry.3.max(y);
            entry.4 += 1;
        }

        extents
            .into_values()
            .map(|(min_x, min_y, max_x, max_y, count)| RegionStats {
                bbox: BoundingBox::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1),
                filled_area: count,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full(bbox: BoundingBox) -> RegionStats {
        RegionStats {
            bbox,
            filled_area: bbox.area(),
        }
    }

    #[test]
    fn test_plate_sized_region_retained() {
        // 200x50, aspect 4.0; filled so that the confidence is ~0.9
        let stats = RegionStats {
            bbox: BoundingBox::new(100, 100, 200, 50),
            filled_area: 8_334,
        };
        let confidence = region_confidence(&stats);
        assert!((confidence - 0.9).abs() < 0.01);

        let kept = filter_regions(&[stats], 640, 480, &DetectionSettings::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox, stats.bbox);
    }

    #[test]
    fn test_small_square_region_discarded() {
        let stats = full(BoundingBox::new(10, 10, 10, 10));
        let kept = filter_regions(&[stats], 640, 480, &DetectionSettings::default());
        assert!(kept.is_empty());
    }

    #[test]
    fn test_aspect_ratio_bounds() {
        let settings = DetectionSettings::default();
        let too_wide = full(BoundingBox::new(0, 0, 300, 50)); // 6.0
        let too_tall = full(BoundingBox::new(0, 0, 60, 50)); // 1.2
        let at_min = full(BoundingBox::new(0, 200, 75, 50)); // 1.5
        let at_max = full(BoundingBox::new(300, 300, 250, 50)); // 5.0
        let kept = filter_regions(&[too_wide, too_tall, at_min, at_max], 640, 480, &settings);
        let boxes: Vec<BoundingBox> = kept.iter().map(|c| c.bbox).collect();
        assert_eq!(boxes.len(), 2);
        assert!(boxes.contains(&at_min.bbox));
        assert!(boxes.contains(&at_max.bbox));
    }

    #[test]
    fn test_overlapping_candidates_suppressed() {
        let a = full(BoundingBox::new(100, 100, 200, 50));
        let b = RegionStats {
            bbox: BoundingBox::new(105, 102, 200, 50),
            filled_area: 9_000,
        };
        let kept = filter_regions(&[b, a], 640, 480, &DetectionSettings::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox, a.bbox);
    }

    #[test]
    fn test_detect_synthetic_plate() {
        let mut frame = GrayImage::new(640, 480);
        for x in 100..300 {
            for y in 100..150 {
                frame.put_pixel(x, y, Luma([255u8]));
            }
        }
        let detector = PlateRegionDetector::new(DetectionConfig::default());
        let settings = detector.settings(0.7);
        let regions = detector.detect(&DynamicImage::ImageLuma8(frame), &settings);

        assert_eq!(regions.len(), 1);
        let bbox = regions[0].bbox;
        assert!((bbox.x as i64 - 100).abs() <= 2);
        assert!((bbox.y as i64 - 100).abs() <= 2);
        assert!((bbox.width as i64 - 200).abs() <= 4);
        assert!((bbox.height as i64 - 50).abs() <= 4);
        assert!(regions[0].confidence >= 0.7);
    }

    #[test]
    fn test_detect_empty_and_blank_frames() {
        let detector = PlateRegionDetector::new(DetectionConfig::default());
        let settings = DetectionSettings::default();

        let empty = DynamicImage::ImageLuma8(GrayImage::new(0, 0));
        assert!(detector.detect(&empty, &settings).is_empty());

        let black = DynamicImage::ImageLuma8(GrayImage::new(320, 240));
        assert!(detector.detect(&black, &settings).is_empty());
    }
}
