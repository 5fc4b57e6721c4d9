//! Randomized properties of detection filtering and tracking.

use common::plates::{BoundingBox, CandidateRegion, PlateDetection, QualityMetrics};
use proptest::prelude::*;
use recognition::detector::{
    filter_regions, DetectionSettings, RegionStats, MAX_ASPECT_RATIO, MIN_ASPECT_RATIO,
};
use recognition::PlateTracker;

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;

fn detection_at(x: u32, timestamp: f64) -> PlateDetection {
    PlateDetection {
        camera_id: "gate".to_string(),
        timestamp,
        region: CandidateRegion {
            bbox: BoundingBox::new(x, 100, 200, 50),
            confidence: 0.9,
        },
        text: "ABC123".to_string(),
        ocr_confidence: 0.9,
        engine: None,
        quality: QualityMetrics::default(),
        region_code: Some("US".to_string()),
    }
}

proptest! {
    #[test]
    fn prop_single_region_kept_iff_it_passes_every_filter(
        x in 0u32..400,
        y in 0u32..400,
        width in 1u32..240,
        height in 1u32..80,
        fill in 0.0f64..=1.0,
        threshold in 0.0f32..=1.0,
        min_plate_size in 1.0f32..10.0,
    ) {
        let area = width as u64 * height as u64;
        let stats = RegionStats {
            bbox: BoundingBox::new(x, y, width, height),
            filled_area: ((area as f64) * fill) as u64,
        };
        let settings = DetectionSettings {
            confidence_threshold: threshold,
            min_plate_size,
            ..Default::default()
        };

        let kept = filter_regions(&[stats], FRAME_WIDTH, FRAME_HEIGHT, &settings);

        let aspect = stats.bbox.aspect_ratio();
        let big_enough = width as f32 >= FRAME_WIDTH as f32 * min_plate_size / 100.0
            && height as f32 >= FRAME_HEIGHT as f32 * min_plate_size / 100.0;
        let plate_shaped = (MIN_ASPECT_RATIO..=MAX_ASPECT_RATIO).contains(&aspect);
        let confident = recognition::detector::region_confidence(&stats) >= threshold;

        prop_assert_eq!(kept.len() == 1, big_enough && plate_shaped && confident);
        for candidate in &kept {
            prop_assert!((0.0..=1.0).contains(&candidate.confidence));
            prop_assert!(candidate.confidence >= threshold);
        }
    }

    #[test]
    fn prop_kept_regions_never_overlap_heavily(
        boxes in prop::collection::vec((0u32..440, 0u32..400, 40u32..200, 20u32..60), 1..12),
    ) {
        let regions: Vec<RegionStats> = boxes
            .iter()
            .map(|(x, y, w, h)| RegionStats {
                bbox: BoundingBox::new(*x, *y, *w, *h),
                filled_area: *w as u64 * *h as u64,
            })
            .collect();
        let settings = DetectionSettings {
            confidence_threshold: 0.0,
            ..Default::default()
        };

        let kept = filter_regions(&regions, FRAME_WIDTH, FRAME_HEIGHT, &settings);
        prop_assert!(kept.len() <= settings.max_detections);
        for (i, a) in kept.iter().enumerate() {
            for b in &kept[i + 1..] {
                prop_assert!(a.bbox.iou(&b.bbox) < settings.iou_threshold);
            }
        }
    }

    #[test]
    fn prop_track_history_bounded(max_age in 1usize..20, updates in 1usize..60) {
        let tracker = PlateTracker::new(max_age);
        for i in 0..updates {
            tracker.update_track("ABC123", &detection_at(100 + i as u32, i as f64 * 0.1), "gate");
        }
        let track = tracker.get_track("ABC123").unwrap();
        prop_assert_eq!(track.track_length, updates.min(max_age));
        prop_assert_eq!(tracker.history("ABC123").len(), updates.min(max_age));
    }
}

#[test]
fn test_track_expires_after_max_age() {
    let tracker = PlateTracker::new(5);
    tracker.update_track("ABC123", &detection_at(100, 10.0), "gate");
    tracker.update_track("XYZ789", &detection_at(300, 14.0), "gate");

    assert!(tracker.cleanup(15.0).is_empty());
    assert_eq!(tracker.cleanup(16.0), vec!["ABC123".to_string()]);
    assert_eq!(tracker.len(), 1);
    assert!(tracker.predict_trajectory("ABC123", 3).is_err());
    assert_eq!(tracker.predict_trajectory("XYZ789", 3).unwrap().len(), 3);
}
