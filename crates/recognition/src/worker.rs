//! One tokio task per camera, plus the loop that correlates their results.

use crate::frame::Frame;
use crate::pipeline::{FrameOutcome, RecognitionPipeline};
use crate::source::FrameSource;
use crate::sync::CameraSyncManager;
use crate::tracking::{CrossCameraCorrelator, PlateTracker};
use common::plates::{CorrelationRecord, PlateDetection};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one processed frame, as sent to the correlation loop
#[derive(Debug, Clone)]
pub struct CameraEvent {
    pub camera_id: String,
    /// Capture time on the synchronized timeline
    pub aligned_timestamp: f64,
    pub outcome: FrameOutcome,
}

/// Start the read-recognize loop of one camera.
///
/// Frame reads and recognition run on the blocking pool. The camera's clock
/// offset is estimated from its first frame unless one is already set, and
/// every recognized frame is buffered in `sync` under its aligned time.
/// Cancellation is honoured between frames; a frame already being
/// recognized completes.
pub fn spawn_camera_worker(
    mut source: Box<dyn FrameSource>,
    pipeline: Arc<RecognitionPipeline>,
    sync: Arc<CameraSyncManager>,
    events: mpsc::Sender<CameraEvent>,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let camera_id = source.camera_id().to_string();
        if let Err(e) = source.start_stream() {
            error!(camera_id = %camera_id, error = %e, "failed to start camera stream");
            return;
        }
        info!(camera_id = %camera_id, "camera worker started");

        let mut interval = time::interval(poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut frames = 0u64;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(camera_id = %camera_id, "camera worker cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let pipeline = Arc::clone(&pipeline);
                    let sync = Arc::clone(&sync);
                    let id = camera_id.clone();

                    let joined = tokio::task::spawn_blocking(move || {
                        let event = source.get_frame().map(|(image, timestamp)| {
                            if !sync.has_camera_offset(&id) {
                                sync.estimate_camera_offset(&id, timestamp);
                            }
                            let frame = Frame::new(id.clone(), image, timestamp);
                            let outcome = pipeline.process_frame(&frame);
                            let aligned_timestamp = if outcome.is_skipped() {
                                sync.aligned_timestamp(&id, timestamp)
                            } else {
                                sync.add_frame(frame)
                            };
                            CameraEvent {
                                aligned_timestamp,
                                camera_id: id,
                                outcome,
                            }
                        });
                        (source, event)
                    })
                    .await;

                    let event = match joined {
                        Ok((returned, event)) => {
                            source = returned;
                            event
                        }
                        Err(e) => {
                            error!(camera_id = %camera_id, error = %e, "camera worker task failed");
                            return;
                        }
                    };

                    match event {
                        Some(event) => {
                            frames += 1;
                            if events.send(event).await.is_err() {
                                debug!(camera_id = %camera_id, "event receiver closed");
                                break;
                            }
                        }
                        None if source.is_finished() => {
                            info!(camera_id = %camera_id, "camera stream finished");
                            break;
                        }
                        None => {
                            debug!(camera_id = %camera_id, "no frame available");
                        }
                    }
                }
            }
        }

        source.stop_stream();
        info!(camera_id = %camera_id, frames, "camera worker stopped");
    })
}

/// Collects accepted detections per camera and correlates the frames the
/// sync manager aligns with each new one.
pub struct CorrelationLoop {
    correlator: Arc<CrossCameraCorrelator>,
    tracker: Arc<PlateTracker>,
    sync: Arc<CameraSyncManager>,
    /// Accepted detections per camera keyed by aligned capture time, as
    /// many as the sync buffer holds frames
    history: HashMap<String, VecDeque<(f64, Vec<PlateDetection>)>>,
    newest_timestamp: f64,
}

impl CorrelationLoop {
    pub fn new(
        correlator: Arc<CrossCameraCorrelator>,
        tracker: Arc<PlateTracker>,
        sync: Arc<CameraSyncManager>,
    ) -> Self {
        Self {
            correlator,
            tracker,
            sync,
            history: HashMap::new(),
            newest_timestamp: f64::MIN,
        }
    }

    /// Fold one camera event in; returns the correlations it produced
    pub fn handle(&mut self, event: CameraEvent) -> Vec<CorrelationRecord> {
        if event.outcome.is_skipped() {
            return Vec::new();
        }
        self.newest_timestamp = self.newest_timestamp.max(event.aligned_timestamp);

        let accepted: Vec<PlateDetection> = event
            .outcome
            .plates()
            .iter()
            .filter(|p| p.decision.decision.is_accepted())
            .map(|p| p.detection.clone())
            .collect();
        let has_plates = !accepted.is_empty();
        let capacity = self.sync.config().buffer_size.max(1);
        let history = self.history.entry(event.camera_id).or_default();
        while history.len() >= capacity {
            history.pop_front();
        }
        history.push_back((event.aligned_timestamp, accepted));
        if !has_plates {
            return Vec::new();
        }

        // Per camera the buffered frame closest in time; cameras whose
        // closest frame had no accepted plate (or is not reported yet) drop out
        let window: HashMap<String, Vec<PlateDetection>> = self
            .sync
            .get_synchronized_frames(event.aligned_timestamp)
            .into_iter()
            .filter_map(|(camera, frame)| {
                let detections = self
                    .history
                    .get(&camera)?
                    .iter()
                    .rev()
                    .find(|(ts, _)| ts.to_bits() == frame.timestamp.to_bits())
                    .map(|(_, detections)| detections)
                    .filter(|detections| !detections.is_empty())?;
                Some((camera, detections.clone()))
            })
            .collect();
        if window.len() < 2 {
            return Vec::new();
        }
        self.correlator.correlate_cross_camera(&window)
    }

    /// Expire tracks relative to the newest frame seen so far
    pub fn cleanup(&self) -> Vec<String> {
        if self.newest_timestamp == f64::MIN {
            return Vec::new();
        }
        self.tracker.cleanup(self.newest_timestamp)
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<CameraEvent>,
        cleanup_interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut cleanup = time::interval(cleanup_interval);
        cleanup.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = cleanup.tick() => {
                    let expired = self.cleanup();
                    if !expired.is_empty() {
                        debug!(expired = ?expired, "plate tracks expired");
                    }
                }
                event = events.recv() => {
                    let Some(event) = event else { break };
                    for record in self.handle(event) {
                        debug!(
                            plate = %record.plate_text,
                            camera_a = %record.camera_a,
                            camera_b = %record.camera_b,
                            hits = record.consecutive_hits,
                            "cross-camera match"
                        );
                    }
                }
            }
        }
        info!("correlation loop stopped");
    }
}

/// Resynchronize the clock every `sync_interval` seconds
pub async fn run_clock_sync(sync: Arc<CameraSyncManager>, cancel: CancellationToken) {
    let period = Duration::from_secs_f64(sync.config().sync_interval.max(1.0));
    let mut interval = time::interval(period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let sync = Arc::clone(&sync);
                match tokio::task::spawn_blocking(move || sync.sync_time()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "clock synchronization failed"),
                    Err(e) => error!(error = %e, "clock synchronization task failed"),
                }
            }
        }
    }
}
