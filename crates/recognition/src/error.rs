use thiserror::Error;

/// Per-frame and per-detection failures of the recognition path.
///
/// None of these escape `RecognitionPipeline::process_frame`; they are logged,
/// counted and turned into a "nothing recognized" outcome.
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("no frame available from camera {0}")]
    FrameUnavailable(String),

    #[error("OCR engine {engine} unavailable: {reason}")]
    EngineUnavailable { engine: String, reason: String },

    #[error("OCR engine {engine} inference failed: {reason}")]
    InferenceError { engine: String, reason: String },

    #[error("plate text '{text}' rejected: {reason}")]
    FormatRejected { text: String, reason: String },

    #[error("image quality {quality:.2} below minimum")]
    LowQualityRejected { quality: f32 },

    #[error("no OCR engine could be initialized")]
    NoEngineAvailable,
}

impl RecognitionError {
    pub fn unavailable(engine: impl Into<String>, reason: impl ToString) -> Self {
        Self::EngineUnavailable {
            engine: engine.into(),
            reason: reason.to_string(),
        }
    }

    pub fn inference(engine: impl Into<String>, reason: impl ToString) -> Self {
        Self::InferenceError {
            engine: engine.into(),
            reason: reason.to_string(),
        }
    }

    pub fn format_rejected(text: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FormatRejected {
            text: text.into(),
            reason: reason.into(),
        }
    }

    /// Label used for the rejection counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::FrameUnavailable(_) => "frame_unavailable",
            Self::EngineUnavailable { .. } => "engine_unavailable",
            Self::InferenceError { .. } => "inference_error",
            Self::FormatRejected { .. } => "format_rejected",
            Self::LowQualityRejected { .. } => "low_quality",
            Self::NoEngineAvailable => "no_engine",
        }
    }
}

/// Failures of the cache collaborator; always recovered by running uncached
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum TrackingError {
    #[error(
        "insufficient calibration between {camera_a} and {camera_b}: {found} common points, {required} required"
    )]
    InsufficientCalibration {
        camera_a: String,
        camera_b: String,
        found: usize,
        required: usize,
    },

    #[error("calibration points between {camera_a} and {camera_b} are degenerate")]
    DegenerateHomography { camera_a: String, camera_b: String },

    #[error("point maps to infinity between {camera_a} and {camera_b}")]
    PointAtInfinity { camera_a: String, camera_b: String },

    #[error("no track for plate {0}")]
    UnknownTrack(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("time server {server} unreachable: {reason}")]
    TimeServerUnreachable { server: String, reason: String },

    #[error("invalid reply from time server {server}: {reason}")]
    InvalidReply { server: String, reason: String },
}
