pub mod correlator;
pub mod homography;
pub mod kalman;
pub mod tracker;

pub use correlator::CrossCameraCorrelator;
pub use homography::{HomographyCalculator, MIN_CALIBRATION_POINTS};
pub use kalman::PlateKalman;
pub use tracker::{PlateTracker, TrackSnapshot};
