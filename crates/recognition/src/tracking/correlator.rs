//! Matching the same plate across camera views.

use super::homography::HomographyCalculator;
use common::plates::{CorrelationRecord, PlateDetection};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use telemetry::metrics::LPR_CORRELATIONS;
use tracing::{debug, info};

/// (plate text, camera a, camera b)
type HitKey = (String, String, String);

pub struct CrossCameraCorrelator {
    homography: Arc<HomographyCalculator>,
    max_distance: f64,
    min_frames: u32,
    hits: Mutex<HashMap<HitKey, u32>>,
}

impl CrossCameraCorrelator {
    pub fn new(homography: Arc<HomographyCalculator>, max_distance: f64, min_frames: u32) -> Self {
        Self {
            homography,
            max_distance,
            min_frames: min_frames.max(1),
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn homography(&self) -> &Arc<HomographyCalculator> {
        &self.homography
    }

    /// Correlate one time-aligned set of detections.
    ///
    /// Detections are grouped by text; for every camera pair in a group the
    /// closest pair (A center mapped into B vs B center) is recorded when it is
    /// closer than the maximum distance. Pairs without a usable transform are
    /// skipped. Hit counts survive across calls while a pair keeps matching.
    pub fn correlate_cross_camera(
        &self,
        detections_by_camera: &HashMap<String, Vec<PlateDetection>>,
    ) -> Vec<CorrelationRecord> {
        let mut groups: BTreeMap<&str, BTreeMap<&str, Vec<&PlateDetection>>> = BTreeMap::new();
        for (camera_id, detections) in detections_by_camera {
            for detection in detections.iter().filter(|d| !d.text.is_empty()) {
                groups
                    .entry(detection.text.as_str())
                    .or_default()
                    .entry(camera_id.as_str())
                    .or_default()
                    .push(detection);
            }
        }

        let mut records = Vec::new();
        for (text, by_camera) in &groups {
            if by_camera.len() < 2 {
                continue;
            }
            let cameras: Vec<&str> = by_camera.keys().copied().collect();
            for (i, camera_a) in cameras.iter().enumerate() {
                for camera_b in &cameras[i + 1..] {
                    if let Some(record) =
                        self.match_pair(text, camera_a, camera_b, &by_camera[camera_a], &by_camera[camera_b])
                    {
                        records.push(record);
                    }
                }
            }
        }

        self.update_hits(&mut records);
        for record in &records {
            let label = if record.confirmed { "true" } else { "false" };
            LPR_CORRELATIONS.with_label_values(&[label]).inc();
            if record.confirmed && record.consecutive_hits == self.min_frames {
                info!(
                    plate = %record.plate_text,
                    camera_a = %record.camera_a,
                    camera_b = %record.camera_b,
                    distance = record.distance,
                    "cross-camera correlation confirmed"
                );
            }
        }
        records
    }

    fn match_pair(
        &self,
        text: &str,
        camera_a: &str,
        camera_b: &str,
        in_a: &[&PlateDetection],
        in_b: &[&PlateDetection],
    ) -> Option<CorrelationRecord> {
        let mut best: Option<(f64, &PlateDetection, &PlateDetection)> = None;

        for det_a in in_a {
            let mapped = match self.homography.transform_point(det_a.center(), camera_a, camera_b) {
                Ok(p) => p,
                Err(e) => {
                    debug!(camera_a = %camera_a, camera_b = %camera_b, error = %e, "skipping camera pair");
                    return None;
                }
            };
            for det_b in in_b {
                let distance = mapped.distance(&det_b.center());
                if best.map_or(true, |(d, _, _)| distance < d) {
                    best = Some((distance, det_a, det_b));
                }
            }
        }

        let (distance, det_a, det_b) = best?;
        (distance < self.max_distance).then(|| CorrelationRecord {
            plate_text: text.to_string(),
            camera_a: camera_a.to_string(),
            camera_b: camera_b.to_string(),
            distance,
            detection_a: det_a.clone(),
            detection_b: det_b.clone(),
            consecutive_hits: 0,
            confirmed: false,
        })
    }

    /// Bump counters of matched keys, forget keys that did not match
    fn update_hits(&self, records: &mut [CorrelationRecord]) {
        let mut hits = self.hits.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let seen: HashSet<HitKey> = records
            .iter()
            .map(|r| (r.plate_text.clone(), r.camera_a.clone(), r.camera_b.clone()))
            .collect();
        hits.retain(|key, _| seen.contains(key));

        for record in records.iter_mut() {
            let key = (
                record.plate_text.clone(),
                record.camera_a.clone(),
                record.camera_b.clone(),
            );
            let count = hits.entry(key).or_insert(0);
            *count += 1;
            record.consecutive_hits = *count;
            record.confirmed = *count >= self.min_frames;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::plates::{BoundingBox, CandidateRegion, Point2, QualityMetrics};

    fn detection(camera: &str, text: &str, cx: u32, cy: u32) -> PlateDetection {
        PlateDetection {
            camera_id: camera.to_string(),
            timestamp: 0.0,
            region: CandidateRegion {
                bbox: BoundingBox::new(cx - 100, cy - 25, 200, 50),
                confidence: 0.9,
            },
            text: text.to_string(),
            ocr_confidence: 0.9,
            engine: None,
            quality: QualityMetrics::default(),
            region_code: None,
        }
    }

    /// cam-2 sees everything shifted 20px right
    fn correlator(min_frames: u32) -> CrossCameraCorrelator {
        let calc = Arc::new(HomographyCalculator::new());
        let pts: Vec<(String, Point2)> = [(0.0, 0.0), (640.0, 0.0), (640.0, 480.0), (0.0, 480.0), (320.0, 200.0)]
            .iter()
            .enumerate()
            .map(|(i, (x, y))| (format!("m{}", i), Point2::new(*x, *y)))
            .collect();
        let shifted: Vec<(String, Point2)> = pts
            .iter()
            .map(|(id, p)| (id.clone(), Point2::new(p.x + 20.0, p.y)))
            .collect();
        calc.add_calibration("cam-1", pts);
        calc.add_calibration("cam-2", shifted);
        CrossCameraCorrelator::new(calc, 50.0, min_frames)
    }

    fn frame_set(entries: &[(&str, &str, u32, u32)]) -> HashMap<String, Vec<PlateDetection>> {
        let mut map: HashMap<String, Vec<PlateDetection>> = HashMap::new();
        for (camera, text, x, y) in entries {
            map.entry(camera.to_string())
                .or_default()
                .push(detection(camera, text, *x, *y));
        }
        map
    }

    #[test]
    fn test_matching_plates_correlate() {
        let correlator = correlator(3);
        let set = frame_set(&[("cam-1", "ABC123", 200, 200), ("cam-2", "ABC123", 225, 200)]);
        let records = correlator.correlate_cross_camera(&set);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.plate_text, "ABC123");
        assert_eq!((record.camera_a.as_str(), record.camera_b.as_str()), ("cam-1", "cam-2"));
        assert!((record.distance - 5.0).abs() < 1e-6);
        assert_eq!(record.consecutive_hits, 1);
        assert!(!record.confirmed);
    }

    #[test]
    fn test_far_apart_plates_do_not_correlate() {
        let correlator = correlator(3);
        let set = frame_set(&[("cam-1", "ABC123", 200, 200), ("cam-2", "ABC123", 400, 300)]);
        assert!(correlator.correlate_cross_camera(&set).is_empty());
    }

    #[test]
    fn test_single_camera_group_ignored() {
        let correlator = correlator(3);
        let set = frame_set(&[("cam-1", "ABC123", 200, 200), ("cam-1", "ABC123", 205, 200)]);
        assert!(correlator.correlate_cross_camera(&set).is_empty());
    }

    #[test]
    fn test_different_text_not_grouped() {
        let correlator = correlator(3);
        let set = frame_set(&[("cam-1", "ABC123", 200, 200), ("cam-2", "XYZ789", 220, 200)]);
        assert!(correlator.correlate_cross_camera(&set).is_empty());
    }

    #[test]
    fn test_uncalibrated_pair_skipped() {
        let correlator = correlator(3);
        let set = frame_set(&[("cam-1", "ABC123", 200, 200), ("cam-9", "ABC123", 220, 200)]);
        assert!(correlator.correlate_cross_camera(&set).is_empty());
    }

    #[test]
    fn test_picks_closest_pair() {
        let correlator = correlator(3);
        let set = frame_set(&[
            ("cam-1", "ABC123", 200, 200),
            ("cam-2", "ABC123", 250, 200),
            ("cam-2", "ABC123", 222, 201),
        ]);
        let records = correlator.correlate_cross_camera(&set);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].detection_b.center(), Point2::new(222.0, 201.0));
    }

    #[test]
    fn test_confirmation_after_consecutive_hits() {
        let correlator = correlator(3);
        let set = frame_set(&[("cam-1", "ABC123", 200, 200), ("cam-2", "ABC123", 220, 200)]);

        assert!(!correlator.correlate_cross_camera(&set)[0].confirmed);
        assert!(!correlator.correlate_cross_camera(&set)[0].confirmed);
        let third = correlator.correlate_cross_camera(&set);
        assert!(third[0].confirmed);
        assert_eq!(third[0].consecutive_hits, 3);

        // A miss resets the streak
        assert!(correlator.correlate_cross_camera(&HashMap::new()).is_empty());
        assert_eq!(correlator.correlate_cross_camera(&set)[0].consecutive_hits, 1);
    }
}
