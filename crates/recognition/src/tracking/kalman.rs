//! Constant-velocity Kalman filter in image coordinates.
//!
//! State `[x, y, vx, vy]` in pixels and pixels per step, measurement `[x, y]`.

use common::plates::Point2;
use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};

const INITIAL_VARIANCE: f64 = 10.0;
const PROCESS_NOISE: f64 = 0.03;
const MEASUREMENT_NOISE: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct PlateKalman {
    state: Vector4<f64>,
    covariance: Matrix4<f64>,
    transition: Matrix4<f64>,
    observation: Matrix2x4<f64>,
    process_noise: Matrix4<f64>,
    measurement_noise: Matrix2<f64>,
}

impl PlateKalman {
    /// Filter at rest at `position`
    pub fn new(position: Point2) -> Self {
        #[rustfmt::skip]
        let transition = Matrix4::new(
            1.0, 0.0, 1.0, 0.0,
            0.0, 1.0, 0.0, 1.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );
        #[rustfmt::skip]
        let observation = Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        );

        Self {
            state: Vector4::new(position.x, position.y, 0.0, 0.0),
            covariance: Matrix4::identity() * INITIAL_VARIANCE,
            transition,
            observation,
            process_noise: Matrix4::identity() * PROCESS_NOISE,
            measurement_noise: Matrix2::identity() * MEASUREMENT_NOISE,
        }
    }

    pub fn position(&self) -> Point2 {
        Point2::new(self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> Point2 {
        Point2::new(self.state[2], self.state[3])
    }

    pub fn state(&self) -> Vector4<f64> {
        self.state
    }

    pub fn covariance(&self) -> Matrix4<f64> {
        self.covariance
    }

    /// Advance one step; returns the predicted position
    pub fn predict(&mut self) -> Point2 {
        self.state = self.transition * self.state;
        self.covariance =
            self.transition * self.covariance * self.transition.transpose() + self.process_noise;
        self.symmetrize();
        self.position()
    }

    /// Fold a measured position into the estimate.
    ///
    /// Uses the Joseph form so the covariance stays positive semi-definite.
    /// A singular innovation covariance leaves the state untouched.
    pub fn correct(&mut self, measured: Point2) {
        let z = Vector2::new(measured.x, measured.y);
        let h = self.observation;

        let innovation = z - h * self.state;
        let s = h * self.covariance * h.transpose() + self.measurement_noise;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let gain = self.covariance * h.transpose() * s_inv;

        self.state += gain * innovation;
        let i_kh = Matrix4::identity() - gain * h;
        self.covariance = i_kh * self.covariance * i_kh.transpose()
            + gain * self.measurement_noise * gain.transpose();
        self.symmetrize();
    }

    /// Positions of the next `steps` predictions, leaving the filter as is
    pub fn forecast(&self, steps: usize) -> Vec<Point2> {
        let mut probe = self.clone();
        (0..steps).map(|_| probe.predict()).collect()
    }

    fn symmetrize(&mut self) {
        self.covariance = (self.covariance + self.covariance.transpose()) * 0.5;
    }
}
