//! Projective transforms between camera views.
//!
//! Each camera registers named calibration points (the same physical marker
//! carries the same id in every view). The transform for an ordered camera
//! pair is fitted on the points both cameras share and cached until either
//! camera is recalibrated.

use crate::error::TrackingError;
use anyhow::Context;
use common::plates::Point2;
use nalgebra::{DMatrix, Matrix3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, info};

pub const MIN_CALIBRATION_POINTS: usize = 4;

/// Reprojection error (pixels) below which a correspondence is an inlier
const RANSAC_INLIER_THRESHOLD: f64 = 3.0;
const RANSAC_ITERATIONS: usize = 200;
const DEFAULT_SEED: u64 = 0x1bad_5eed;

/// Smallest-to-largest eigenvalue ratio under which a second null direction
/// means the points do not pin down a unique transform
const DEGENERACY_RATIO: f64 = 1e-10;

type PairKey = (String, String);

pub struct HomographyCalculator {
    calibrations: RwLock<HashMap<String, BTreeMap<String, Point2>>>,
    matrices: RwLock<HashMap<PairKey, Matrix3<f64>>>,
    seed: u64,
}

impl Default for HomographyCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl HomographyCalculator {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Calculator whose robust fit draws samples from `seed`
    pub fn with_seed(seed: u64) -> Self {
        Self {
            calibrations: RwLock::new(HashMap::new()),
            matrices: RwLock::new(HashMap::new()),
            seed,
        }
    }

    /// Replace the calibration points of `camera_id`
    pub fn add_calibration<I, S>(&self, camera_id: &str, points: I)
    where
        I: IntoIterator<Item = (S, Point2)>,
        S: Into<String>,
    {
        let points: BTreeMap<String, Point2> =
            points.into_iter().map(|(id, p)| (id.into(), p)).collect();
        info!(camera_id = %camera_id, points = points.len(), "camera calibration registered");

        self.calibrations
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(camera_id.to_string(), points);
        self.matrices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|(a, b), _| a != camera_id && b != camera_id);
    }

    pub fn has_calibration(&self, camera_id: &str) -> bool {
        self.calibrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(camera_id)
    }

    /// Register every camera of a JSON calibration file
    /// (`{"camera": {"point id": {"x": .., "y": ..}}}`); returns the camera count.
    pub fn load_calibration_file(&self, path: impl AsRef<Path>) -> anyhow::Result<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read calibration file {}", path.display()))?;
        let cameras: BTreeMap<String, BTreeMap<String, Point2>> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid calibration file {}", path.display()))?;
        let count = cameras.len();
        for (camera_id, points) in cameras {
            self.add_calibration(&camera_id, points);
        }
        Ok(count)
    }

    fn correspondences(&self, camera_a: &str, camera_b: &str) -> (Vec<Point2>, Vec<Point2>) {
        let calibrations = self
            .calibrations
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (Some(a), Some(b)) = (calibrations.get(camera_a), calibrations.get(camera_b)) else {
            return (Vec::new(), Vec::new());
        };
        a.iter()
            .filter_map(|(id, pa)| b.get(id).map(|pb| (*pa, *pb)))
            .unzip()
    }

    /// Transform mapping `camera_a` pixels to `camera_b` pixels
    pub fn calculate_homography(
        &self,
        camera_a: &str,
        camera_b: &str,
        min_points: usize,
    ) -> Result<Matrix3<f64>, TrackingError> {
        let required = min_points.max(MIN_CALIBRATION_POINTS);
        let (src, dst) = self.correspondences(camera_a, camera_b);
        if src.len() < required {
            return Err(TrackingError::InsufficientCalibration {
                camera_a: camera_a.to_string(),
                camera_b: camera_b.to_string(),
                found: src.len(),
                required,
            });
        }

        let degenerate = || TrackingError::DegenerateHomography {
            camera_a: camera_a.to_string(),
            camera_b: camera_b.to_string(),
        };
        let matrix = if src.len() == MIN_CALIBRATION_POINTS {
            fit_dlt(&src, &dst).ok_or_else(degenerate)?
        } else {
            fit_ransac(&src, &dst, self.seed).ok_or_else(degenerate)?
        };

        debug!(
            camera_a = %camera_a,
            camera_b = %camera_b,
            points = src.len(),
            "homography computed"
        );
        self.matrices
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((camera_a.to_string(), camera_b.to_string()), matrix);
        Ok(matrix)
    }

    /// Cached transform for the pair, computed on first use
    pub fn homography(&self, camera_a: &str, camera_b: &str) -> Result<Matrix3<f64>, TrackingError> {
        let cached = self
            .matrices
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(camera_a.to_string(), camera_b.to_string()))
            .copied();
        match cached {
            Some(matrix) => Ok(matrix),
            None => self.calculate_homography(camera_a, camera_b, MIN_CALIBRATION_POINTS),
        }
    }

    /// Map a `camera_a` pixel into `camera_b`
    pub fn transform_point(
        &self,
        point: Point2,
        camera_a: &str,
        camera_b: &str,
    ) -> Result<Point2, TrackingError> {
        if camera_a == camera_b {
            return Ok(point);
        }
        let matrix = self.homography(camera_a, camera_b)?;
        project(&matrix, point).ok_or_else(|| TrackingError::PointAtInfinity {
            camera_a: camera_a.to_string(),
            camera_b: camera_b.to_string(),
        })
    }
}

/// Apply `h` to a point with homogeneous normalization
pub fn project(h: &Matrix3<f64>, point: Point2) -> Option<Point2> {
    let p = h * Vector3::new(point.x, point.y, 1.0);
    if p.z.abs() < 1e-12 || !p.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Point2::new(p.x / p.z, p.y / p.z))
}

/// Similarity moving the centroid to the origin with mean distance sqrt(2)
fn normalization(points: &[Point2]) -> Option<Matrix3<f64>> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    #[rustfmt::skip]
    let t = Matrix3::new(
        s, 0.0, -s * cx,
        0.0, s, -s * cy,
        0.0, 0.0, 1.0,
    );
    Some(t)
}

/// Normalized direct linear transform over all correspondences.
///
/// The solution is the eigenvector of `AᵀA` with the smallest eigenvalue.
pub fn fit_dlt(src: &[Point2], dst: &[Point2]) -> Option<Matrix3<f64>> {
    if src.len() < MIN_CALIBRATION_POINTS || src.len() != dst.len() {
        return None;
    }
    let t_src = normalization(src)?;
    let t_dst = normalization(dst)?;

    let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
    for (i, (ps, pd)) in src.iter().zip(dst).enumerate() {
        let s = project(&t_src, *ps)?;
        let d = project(&t_dst, *pd)?;
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);

        let r = 2 * i;
        for (c, val) in [-x, -y, -1.0, 0.0, 0.0, 0.0, u * x, u * y, u].into_iter().enumerate() {
            a[(r, c)] = val;
        }
        for (c, val) in [0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v].into_iter().enumerate() {
            a[(r + 1, c)] = val;
        }
    }

    let ata = a.transpose() * &a;
    let eigen = ata.symmetric_eigen();

    let mut order: Vec<usize> = (0..eigen.eigenvalues.len()).collect();
    order.sort_by(|&i, &j| {
        eigen.eigenvalues[i]
            .partial_cmp(&eigen.eigenvalues[j])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let (smallest, second) = (order[0], order[1]);
    let largest = eigen.eigenvalues[order[order.len() - 1]].abs().max(f64::EPSILON);
    if eigen.eigenvalues[second].abs() / largest < DEGENERACY_RATIO {
        return None;
    }

    let h = eigen.eigenvectors.column(smallest);
    #[rustfmt::skip]
    let h_norm = Matrix3::new(
        h[0], h[1], h[2],
        h[3], h[4], h[5],
        h[6], h[7], h[8],
    );

    let t_dst_inv = t_dst.try_inverse()?;
    let mut matrix = t_dst_inv * h_norm * t_src;
    let scale = if matrix[(2, 2)].abs() > 1e-12 {
        matrix[(2, 2)]
    } else {
        matrix.norm()
    };
    matrix /= scale;

    if !matrix.iter().all(|v| v.is_finite()) || matrix.determinant().abs() < 1e-12 {
        return None;
    }
    Some(matrix)
}

fn reprojection_error(h: &Matrix3<f64>, src: Point2, dst: Point2) -> f64 {
    project(h, src).map_or(f64::INFINITY, |p| p.distance(&dst))
}

/// RANSAC over minimal samples, then a refit on the best consensus set
fn fit_ransac(src: &[Point2], dst: &[Point2], seed: u64) -> Option<Matrix3<f64>> {
    let n = src.len();
    let mut rng = StdRng::seed_from_u64(seed);

    let mut best: Option<(usize, f64, Vec<usize>)> = None;
    for _ in 0..RANSAC_ITERATIONS {
        let sample = rand::seq::index::sample(&mut rng, n, MIN_CALIBRATION_POINTS).into_vec();
        let s: Vec<Point2> = sample.iter().map(|&i| src[i]).collect();
        let d: Vec<Point2> = sample.iter().map(|&i| dst[i]).collect();
        let Some(model) = fit_dlt(&s, &d) else {
            continue;
        };

        let mut inliers = Vec::new();
        let mut error = 0.0;
        for i in 0..n {
            let e = reprojection_error(&model, src[i], dst[i]);
            if e < RANSAC_INLIER_THRESHOLD {
                inliers.push(i);
                error += e;
            }
        }

        let better = match &best {
            None => true,
            Some((count, best_error, _)) => {
                inliers.len() > *count || (inliers.len() == *count && error < *best_error)
            }
        };
        if better {
            let all_inliers = inliers.len() == n;
            best = Some((inliers.len(), error, inliers));
            if all_inliers {
                break;
            }
        }
    }

    let (count, _, inliers) = best?;
    if count < MIN_CALIBRATION_POINTS {
        return None;
    }
    let s: Vec<Point2> = inliers.iter().map(|&i| src[i]).collect();
    let d: Vec<Point2> = inliers.iter().map(|&i| dst[i]).collect();
    fit_dlt(&s, &d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn truth() -> Matrix3<f64> {
        #[rustfmt::skip]
        let h = Matrix3::new(
            1.1, 0.05, 30.0,
            -0.02, 0.95, 12.0,
            0.0001, 0.00005, 1.0,
        );
        h
    }

    fn grid() -> Vec<(String, Point2)> {
        let mut points = Vec::new();
        for (i, x) in [50.0, 300.0, 550.0].iter().enumerate() {
            for (j, y) in [40.0, 240.0, 440.0].iter().enumerate() {
                points.push((format!("p{}{}", i, j), Point2::new(*x, *y)));
            }
        }
        points
    }

    fn calibrated(points_b: impl Fn(Point2) -> Point2) -> HomographyCalculator {
        let calc = HomographyCalculator::new();
        let a = grid();
        let b: Vec<(String, Point2)> = a.iter().map(|(id, p)| (id.clone(), points_b(*p))).collect();
        calc.add_calibration("gate", a);
        calc.add_calibration("lobby", b);
        calc
    }

    #[test]
    fn test_insufficient_calibration() {
        let calc = HomographyCalculator::new();
        let pts: Vec<(String, Point2)> = grid().into_iter().take(3).collect();
        calc.add_calibration("gate", pts.clone());
        calc.add_calibration("lobby", pts);

        let err = calc.calculate_homography("gate", "lobby", 4).unwrap_err();
        assert_eq!(
            err,
            TrackingError::InsufficientCalibration {
                camera_a: "gate".to_string(),
                camera_b: "lobby".to_string(),
                found: 3,
                required: 4,
            }
        );
        assert!(calc.transform_point(Point2::new(0.0, 0.0), "gate", "lobby").is_err());
    }

    #[test]
    fn test_only_common_ids_count() {
        let calc = HomographyCalculator::new();
        calc.add_calibration("gate", grid());
        calc.add_calibration(
            "lobby",
            vec![("p00", Point2::new(1.0, 1.0)), ("zz", Point2::new(2.0, 2.0))],
        );
        assert!(matches!(
            calc.calculate_homography("gate", "lobby", 4),
            Err(TrackingError::InsufficientCalibration { found: 1, .. })
        ));
    }

    #[test]
    fn test_recovers_known_transform() {
        let h = truth();
        let calc = calibrated(|p| project(&h, p).unwrap());

        let probe = Point2::new(420.0, 310.0);
        let mapped = calc.transform_point(probe, "gate", "lobby").unwrap();
        let expected = project(&h, probe).unwrap();
        assert!(mapped.distance(&expected) < 1e-6, "{:?} vs {:?}", mapped, expected);
    }

    #[test]
    fn test_four_points_exact() {
        let h = truth();
        let calc = HomographyCalculator::new();
        let a: Vec<(String, Point2)> = [(0.0, 0.0), (400.0, 0.0), (400.0, 300.0), (0.0, 300.0)]
            .iter()
            .enumerate()
            .map(|(i, (x, y))| (format!("c{}", i), Point2::new(*x, *y)))
            .collect();
        let b: Vec<(String, Point2)> =
            a.iter().map(|(id, p)| (id.clone(), project(&h, *p).unwrap())).collect();
        calc.add_calibration("a", a);
        calc.add_calibration("b", b);

        let m = calc.calculate_homography("a", "b", 4).unwrap();
        let p = project(&m, Point2::new(200.0, 150.0)).unwrap();
        assert!(p.distance(&project(&h, Point2::new(200.0, 150.0)).unwrap()) < 1e-6);
    }

    #[test]
    fn test_deterministic() {
        let h = truth();
        let a = calibrated(|p| project(&h, p).unwrap());
        let b = calibrated(|p| project(&h, p).unwrap());
        assert_eq!(
            a.calculate_homography("gate", "lobby", 4).unwrap(),
            b.calculate_homography("gate", "lobby", 4).unwrap()
        );
    }

    #[test]
    fn test_outlier_rejected() {
        let h = truth();
        let calc = HomographyCalculator::new();
        let a = grid();
        let b: Vec<(String, Point2)> = a
            .iter()
            .map(|(id, p)| {
                let mut q = project(&h, *p).unwrap();
                if id == "p11" {
                    q.x += 80.0;
                }
                (id.clone(), q)
            })
            .collect();
        calc.add_calibration("gate", a);
        calc.add_calibration("lobby", b);

        let probe = Point2::new(100.0, 100.0);
        let mapped = calc.transform_point(probe, "gate", "lobby").unwrap();
        assert!(mapped.distance(&project(&h, probe).unwrap()) < 1e-3);
    }

    #[test]
    fn test_collinear_points_are_degenerate() {
        let calc = HomographyCalculator::new();
        let line: Vec<(String, Point2)> = (0..5)
            .map(|i| (format!("l{}", i), Point2::new(i as f64 * 50.0, i as f64 * 10.0)))
            .collect();
        calc.add_calibration("a", line.clone());
        calc.add_calibration("b", line);
        assert!(matches!(
            calc.calculate_homography("a", "b", 4),
            Err(TrackingError::DegenerateHomography { .. })
        ));
    }

    #[test]
    fn test_recalibration_invalidates_cache() {
        let calc = calibrated(|p| Point2::new(p.x + 10.0, p.y));
        let p = calc.transform_point(Point2::new(100.0, 100.0), "gate", "lobby").unwrap();
        assert!((p.x - 110.0).abs() < 1e-6);

        let shifted: Vec<(String, Point2)> = grid()
            .into_iter()
            .map(|(id, p)| (id, Point2::new(p.x + 50.0, p.y)))
            .collect();
        calc.add_calibration("lobby", shifted);
        let p = calc.transform_point(Point2::new(100.0, 100.0), "gate", "lobby").unwrap();
        assert!((p.x - 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_same_camera_is_identity() {
        let calc = HomographyCalculator::new();
        let p = Point2::new(3.0, 4.0);
        assert_eq!(calc.transform_point(p, "a", "a").unwrap(), p);
    }

    #[test]
    fn test_load_calibration_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "gate": {{ "a": {{"x": 0, "y": 0}}, "b": {{"x": 100, "y": 0}},
                           "c": {{"x": 100, "y": 100}}, "d": {{"x": 0, "y": 100}} }},
                "lobby": {{ "a": {{"x": 5, "y": 0}}, "b": {{"x": 105, "y": 0}},
                            "c": {{"x": 105, "y": 100}}, "d": {{"x": 5, "y": 100}} }}
            }}"#
        )
        .unwrap();

        let calc = HomographyCalculator::new();
        assert_eq!(calc.load_calibration_file(file.path()).unwrap(), 2);
        assert!(calc.has_calibration("gate"));
        let p = calc.transform_point(Point2::new(50.0, 50.0), "gate", "lobby").unwrap();
        assert!((p.x - 55.0).abs() < 1e-6 && (p.y - 50.0).abs() < 1e-6);

        assert!(calc.load_calibration_file("/nonexistent/calibration.json").is_err());
    }

    #[test]
    fn test_recalibration_after_poisoned_locks() {
        let calc = std::sync::Arc::new(HomographyCalculator::new());
        let square = [(0.0, 0.0), (100.0, 0.0), (100.0, 100.0), (0.0, 100.0)];
        let points = |dx: f64| {
            square
                .iter()
                .enumerate()
                .map(move |(i, (x, y))| (i.to_string(), Point2::new(x + dx, *y)))
                .collect::<Vec<_>>()
        };
        calc.add_calibration("gate", points(0.0));
        calc.add_calibration("lobby", points(10.0));
        let before = calc.transform_point(Point2::new(50.0, 50.0), "gate", "lobby").unwrap();
        assert!((before.x - 60.0).abs() < 1e-6);

        let poisoner = std::sync::Arc::clone(&calc);
        let _ = std::thread::spawn(move || {
            let _calibrations = poisoner.calibrations.write().unwrap();
            let _matrices = poisoner.matrices.write().unwrap();
            panic!("poison both locks");
        })
        .join();
        assert!(calc.calibrations.is_poisoned());
        assert!(calc.matrices.is_poisoned());

        calc.add_calibration("lobby", points(30.0));
        let after = calc.transform_point(Point2::new(50.0, 50.0), "gate", "lobby").unwrap();
        assert!((after.x - 80.0).abs() < 1e-6);
        assert!(calc.has_calibration("lobby"));
    }
}
