pub mod manager;
pub mod ntp;

pub use manager::{CameraSyncManager, SyncStatus};
pub use ntp::{ServerReading, SntpClient, TimeSource};

use std::time::{SystemTime, UNIX_EPOCH};

/// Local wall clock in seconds since the Unix epoch
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
