//! Clock synchronization and time-aligned frame sets across cameras.

use super::ntp::{SntpClient, TimeSource};
use super::unix_now;
use crate::config::CameraSyncConfig;
use crate::error::SyncError;
use crate::frame::Frame;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use telemetry::metrics::{LPR_BUFFERED_FRAMES, LPR_SYNC_FAILURES, LPR_SYNC_OFFSET};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct ClockState {
    offset: f64,
    last_sync: Option<f64>,
    last_attempt: Option<f64>,
    last_server: Option<String>,
    consecutive_failures: u32,
}

/// Point-in-time view of the synchronization state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub synchronized: bool,
    pub offset: f64,
    pub last_sync: Option<f64>,
    pub last_server: Option<String>,
    pub consecutive_failures: u32,
    pub camera_offsets: HashMap<String, f64>,
    pub buffered_frames: HashMap<String, usize>,
}

pub struct CameraSyncManager {
    config: CameraSyncConfig,
    prealloc: bool,
    source: Arc<dyn TimeSource>,
    clock: Mutex<ClockState>,
    camera_offsets: Mutex<HashMap<String, f64>>,
    buffers: Mutex<HashMap<String, VecDeque<Frame>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CameraSyncManager {
    /// Manager backed by the SNTP client
    pub fn new(config: CameraSyncConfig, prealloc: bool) -> Self {
        let timeout = Duration::from_secs_f64(config.server_timeout.max(0.001));
        Self::with_source(config, prealloc, Arc::new(SntpClient::new(timeout)))
    }

    pub fn with_source(
        config: CameraSyncConfig,
        prealloc: bool,
        source: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            config,
            prealloc,
            source,
            clock: Mutex::new(ClockState::default()),
            camera_offsets: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CameraSyncConfig {
        &self.config
    }

    /// Query the time servers in order and adopt the first answer.
    ///
    /// When every server fails the previous offset stays in place and the
    /// last error is returned.
    pub fn sync_time(&self) -> Result<f64, SyncError> {
        let mut last_error = None;

        for server in &self.config.ntp_servers {
            match self.source.query(server) {
                Ok(reading) => {
                    let now = unix_now();
                    let mut clock = lock(&self.clock);
                    clock.offset = reading.offset;
                    clock.last_sync = Some(now);
                    clock.last_attempt = Some(now);
                    clock.last_server = Some(server.clone());
                    clock.consecutive_failures = 0;
                    LPR_SYNC_OFFSET.set(reading.offset);
                    info!(
                        server = %server,
                        offset = reading.offset,
                        delay = reading.delay,
                        "clock synchronized"
                    );
                    return Ok(reading.offset);
                }
                Err(e) => {
                    LPR_SYNC_FAILURES.with_label_values(&[server.as_str()]).inc();
                    debug!(server = %server, error = %e, "time server query failed");
                    last_error = Some(e);
                }
            }
        }

        let mut clock = lock(&self.clock);
        clock.last_attempt = Some(unix_now());
        clock.consecutive_failures += 1;
        warn!(
            servers = self.config.ntp_servers.len(),
            offset = clock.offset,
            failures = clock.consecutive_failures,
            "all time servers failed, keeping previous offset"
        );
        Err(last_error.unwrap_or_else(|| SyncError::TimeServerUnreachable {
            server: String::new(),
            reason: "no time servers configured".to_string(),
        }))
    }

    /// Local time corrected by the current offset.
    ///
    /// Resynchronizes first once `sync_interval` seconds passed since the
    /// last attempt. Without configured servers the local clock is used.
    pub fn get_synchronized_time(&self) -> f64 {
        let now = unix_now();
        let stale = !self.config.ntp_servers.is_empty() && {
            let clock = lock(&self.clock);
            clock
                .last_attempt
                .map_or(true, |t| now - t >= self.config.sync_interval)
        };
        if stale {
            // Failure is already logged; the previous offset still applies
            let _ = self.sync_time();
        }
        unix_now() + self.offset()
    }

    pub fn offset(&self) -> f64 {
        lock(&self.clock).offset
    }

    pub fn set_camera_offset(&self, camera_id: &str, offset: f64) {
        lock(&self.camera_offsets).insert(camera_id.to_string(), offset);
    }

    pub fn camera_offset(&self, camera_id: &str) -> f64 {
        lock(&self.camera_offsets)
            .get(camera_id)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn has_camera_offset(&self, camera_id: &str) -> bool {
        lock(&self.camera_offsets).contains_key(camera_id)
    }

    /// A camera timestamp moved onto the synchronized timeline
    pub fn aligned_timestamp(&self, camera_id: &str, camera_timestamp: f64) -> f64 {
        camera_timestamp + self.camera_offset(camera_id)
    }

    /// Derive a camera's offset from a timestamp the camera reported now
    pub fn estimate_camera_offset(&self, camera_id: &str, camera_timestamp: f64) -> f64 {
        let offset = self.get_synchronized_time() - camera_timestamp;
        self.set_camera_offset(camera_id, offset);
        debug!(camera_id = %camera_id, offset, "estimated camera clock offset");
        offset
    }

    /// Buffer a frame on the aligned timeline, dropping the oldest when
    /// full. Returns the aligned timestamp it was buffered under.
    pub fn add_frame(&self, mut frame: Frame) -> f64 {
        frame.timestamp = self.aligned_timestamp(&frame.camera_id, frame.timestamp);
        let aligned = frame.timestamp;
        let capacity = self.config.buffer_size.max(1);

        let mut buffers = lock(&self.buffers);
        let buffer = buffers.entry(frame.camera_id.clone()).or_insert_with(|| {
            if self.prealloc {
                VecDeque::with_capacity(capacity)
            } else {
                VecDeque::new()
            }
        });
        while buffer.len() >= capacity {
            buffer.pop_front();
        }
        let camera_id = frame.camera_id.clone();
        buffer.push_back(frame);
        LPR_BUFFERED_FRAMES
            .with_label_values(&[camera_id.as_str()])
            .set(buffer.len() as i64);
        aligned
    }

    /// Per camera, the buffered frame closest to `target` within `max_drift`.
    ///
    /// Cameras with nothing close enough are left out.
    pub fn get_synchronized_frames(&self, target: f64) -> HashMap<String, Frame> {
        let buffers = lock(&self.buffers);
        buffers
            .iter()
            .filter_map(|(camera_id, frames)| {
                frames
                    .iter()
                    .map(|f| ((f.timestamp - target).abs(), f))
                    .filter(|(drift, _)| *drift <= self.config.max_drift)
                    .min_by(|a, b| a.0.total_cmp(&b.0))
                    .map(|(_, f)| (camera_id.clone(), f.clone()))
            })
            .collect()
    }

    pub fn buffered(&self, camera_id: &str) -> usize {
        lock(&self.buffers).get(camera_id).map_or(0, VecDeque::len)
    }

    pub fn sync_status(&self) -> SyncStatus {
        let (synchronized, offset, last_sync, last_server, consecutive_failures) = {
            let clock = lock(&self.clock);
            (
                clock.last_sync.is_some(),
                clock.offset,
                clock.last_sync,
                clock.last_server.clone(),
                clock.consecutive_failures,
            )
        };
        SyncStatus {
            synchronized,
            offset,
            last_sync,
            last_server,
            consecutive_failures,
            camera_offsets: lock(&self.camera_offsets).clone(),
            buffered_frames: lock(&self.buffers)
                .iter()
                .map(|(id, frames)| (id.clone(), frames.len()))
                .collect(),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::sync::ServerReading;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Servers answer with a fixed offset, or not at all
    pub struct ScriptedTimeSource {
        replies: HashMap<String, Option<f64>>,
        calls: AtomicUsize,
    }

    impl ScriptedTimeSource {
        pub fn new(replies: &[(&str, Option<f64>)]) -> Arc<Self> {
            Arc::new(Self {
                replies: replies
                    .iter()
                    .map(|(s, r)| (s.to_string(), *r))
                    .collect(),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TimeSource for ScriptedTimeSource {
        fn query(&self, server: &str) -> Result<ServerReading, SyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.replies.get(server).copied().flatten() {
                Some(offset) => Ok(ServerReading { offset, delay: 0.01 }),
                None => Err(SyncError::TimeServerUnreachable {
                    server: server.to_string(),
                    reason: "timed out".to_string(),
                }),
            }
        }
    }
}
