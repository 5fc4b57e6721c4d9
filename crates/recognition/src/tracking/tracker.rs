//! Per-plate Kalman tracks.
//!
//! A plate id is absent until its first accepted detection, active while
//! updates keep arriving, and expired (removed) once no update arrived for
//! `max_track_age` seconds of detection time.

use super::kalman::PlateKalman;
use crate::error::TrackingError;
use crate::scoring::ConsistencySource;
use common::plates::{PlateDetection, Point2, TrackUpdate};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use telemetry::metrics::LPR_ACTIVE_TRACKS;
use tracing::{debug, warn};

/// Detections needed before a plate counts as fully consistent
const CONSISTENT_TRACK_LENGTH: f32 = 3.0;

struct Track {
    camera_id: String,
    filter: PlateKalman,
    history: VecDeque<PlateDetection>,
    first_seen: f64,
    last_update: f64,
}

/// Read-only view of a track
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub plate_id: String,
    pub camera_id: String,
    pub position: Point2,
    pub velocity: Point2,
    pub track_length: usize,
    pub first_seen: f64,
    pub last_update: f64,
}

pub struct PlateTracker {
    max_track_age: usize,
    tracks: Mutex<HashMap<String, Track>>,
}

impl PlateTracker {
    pub fn new(max_track_age: usize) -> Self {
        Self {
            max_track_age: max_track_age.max(1),
            tracks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Track>> {
        // A panic while holding the lock leaves at worst a stale track
        self.tracks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max_track_age(&self) -> usize {
        self.max_track_age
    }

    /// Record an accepted detection of `plate_id`
    pub fn update_track(
        &self,
        plate_id: &str,
        detection: &PlateDetection,
        camera_id: &str,
    ) -> TrackUpdate {
        let center = detection.center();
        let mut tracks = self.lock();

        let track = tracks.entry(plate_id.to_string()).or_insert_with(|| {
            debug!(plate_id = %plate_id, camera_id = %camera_id, "new plate track");
            Track {
                camera_id: camera_id.to_string(),
                filter: PlateKalman::new(center),
                history: VecDeque::with_capacity(self.max_track_age),
                first_seen: detection.timestamp,
                last_update: detection.timestamp,
            }
        });

        if !track.history.is_empty() {
            track.filter.predict();
            track.filter.correct(center);
        }

        track.history.push_back(detection.clone());
        while track.history.len() > self.max_track_age {
            track.history.pop_front();
        }
        track.camera_id = camera_id.to_string();
        track.last_update = track.last_update.max(detection.timestamp);

        let predicted = track
            .filter
            .forecast(1)
            .first()
            .copied()
            .unwrap_or_else(|| track.filter.position());

        let update = TrackUpdate {
            plate_id: plate_id.to_string(),
            current_position: track.filter.position(),
            predicted_position: predicted,
            velocity: track.filter.velocity(),
            track_length: track.history.len(),
            camera_id: camera_id.to_string(),
        };

        LPR_ACTIVE_TRACKS.set(tracks.len() as i64);
        update
    }

    /// Next `steps` predicted positions; the track itself is not modified
    pub fn predict_trajectory(
        &self,
        plate_id: &str,
        steps: usize,
    ) -> Result<Vec<Point2>, TrackingError> {
        let tracks = self.lock();
        let track = tracks
            .get(plate_id)
            .ok_or_else(|| TrackingError::UnknownTrack(plate_id.to_string()))?;
        Ok(track.filter.forecast(steps))
    }

    /// Remove tracks whose last update is older than `max_track_age`
    /// seconds before `now`; returns the expired plate ids.
    pub fn cleanup(&self, now: f64) -> Vec<String> {
        let horizon = self.max_track_age as f64;
        let mut tracks = self.lock();

        let expired: Vec<String> = tracks
            .iter()
            .filter(|(_, t)| now - t.last_update > horizon)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            tracks.remove(id);
        }

        if !expired.is_empty() {
            debug!(expired = expired.len(), remaining = tracks.len(), "expired plate tracks");
        }
        LPR_ACTIVE_TRACKS.set(tracks.len() as i64);
        expired
    }

    pub fn active_tracks(&self) -> Vec<TrackSnapshot> {
        let tracks = self.lock();
        let mut snapshots: Vec<TrackSnapshot> = tracks
            .iter()
            .map(|(id, t)| snapshot(id, t))
            .collect();
        snapshots.sort_by(|a, b| a.plate_id.cmp(&b.plate_id));
        snapshots
    }

    pub fn get_track(&self, plate_id: &str) -> Option<TrackSnapshot> {
        self.lock().get(plate_id).map(|t| snapshot(plate_id, t))
    }

    /// Detections currently held for `plate_id`, oldest first
    pub fn history(&self, plate_id: &str) -> Vec<PlateDetection> {
        self.lock()
            .get(plate_id)
            .map(|t| t.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot(plate_id: &str, track: &Track) -> TrackSnapshot {
    TrackSnapshot {
        plate_id: plate_id.to_string(),
        camera_id: track.camera_id.clone(),
        position: track.filter.position(),
        velocity: track.filter.velocity(),
        track_length: track.history.len(),
        first_seen: track.first_seen,
        last_update: track.last_update,
    }
}

impl ConsistencySource for PlateTracker {
    fn consistency(&self, detection: &PlateDetection) -> f32 {
        if detection.text.is_empty() {
            return 0.5;
        }
        match self.tracks.lock() {
            Ok(tracks) => tracks
                .get(&detection.text)
                .map(|t| (t.history.len() as f32 / CONSISTENT_TRACK_LENGTH).min(1.0))
                .unwrap_or(0.5),
            Err(e) => {
                warn!(error = %e, "tracker lock poisoned, using neutral consistency");
                0.5
            }
        }
    }
}
