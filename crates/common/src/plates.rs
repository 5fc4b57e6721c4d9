//! Plate recognition contracts shared between the recognition pipeline and
//! its downstream consumers (access control, storage, notification).
//!
//! Everything here is plain data: serializable, cloneable and free of any
//! pipeline behaviour.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box coordinates in frame pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Width divided by height; zero for degenerate boxes
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            return 0.0;
        }
        self.width as f32 / self.height as f32
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> Point2 {
        Point2::new(
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// Intersection over Union with another box
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = if x2 > x1 && y2 > y1 {
            ((x2 - x1) as u64 * (y2 - y1) as u64) as f32
        } else {
            0.0
        };

        let union = self.area() as f32 + other.area() as f32 - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// A point in image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Rectangular area of a frame believed to contain a plate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateRegion {
    pub bbox: BoundingBox,

    /// Heuristic detection confidence (0.0 to 1.0)
    pub confidence: f32,
}

/// OCR backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrEngineKind {
    /// Segmentation + template matching driven by the region grammar
    RuleBased,
    /// CTC recognizer on the CPU execution provider
    Neural,
    /// CTC recognizer on an attached accelerator (CUDA / TensorRT)
    Accelerated,
}

impl OcrEngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::Neural => "neural",
            Self::Accelerated => "accelerated",
        }
    }

    /// Both neural variants count as the neural side during arbitration
    pub fn is_neural(&self) -> bool {
        matches!(self, Self::Neural | Self::Accelerated)
    }
}

impl fmt::Display for OcrEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw output of a single OCR engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f32,
    pub engine: OcrEngineKind,
}

/// Image quality measurements of a plate crop, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Sharpness from the variance of the Laplacian
    pub sharpness: f32,
    /// Mean intensity inside the accepted brightness window
    pub brightness: f32,
    /// Intensity spread
    pub contrast: f32,
    /// Crop size against the minimum useful resolution
    pub resolution: f32,
    /// Mean of the four components
    pub overall: f32,
}

/// A recognized plate in a single frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateDetection {
    pub camera_id: String,

    /// Capture timestamp in seconds
    pub timestamp: f64,

    pub region: CandidateRegion,

    /// Arbitrated, cleaned plate text
    pub text: String,

    /// Arbitrated OCR confidence
    pub ocr_confidence: f32,

    /// Engine whose text won arbitration (None for cache hits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<OcrEngineKind>,

    pub quality: QualityMetrics,

    /// Region code whose grammar the text satisfied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_code: Option<String>,
}

impl PlateDetection {
    pub fn center(&self) -> Point2 {
        self.region.bbox.center()
    }
}

/// Individual confidence factors before weighting
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScoreFactors {
    pub ocr: f32,
    pub quality: f32,
    pub format: f32,
    pub consistency: f32,
}

/// Weights applied to [`ScoreFactors`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub ocr: f32,
    pub quality: f32,
    pub format: f32,
    pub consistency: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            ocr: 0.4,
            quality: 0.3,
            format: 0.2,
            consistency: 0.1,
        }
    }
}

/// Aggregated confidence of a detection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScore {
    /// Weighted sum of the factors, clamped to [0, 1]
    pub overall: f32,
    pub factors: ScoreFactors,
    pub weights: ScoreWeights,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    AcceptHigh,
    AcceptMedium,
    Review,
    Reject,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptHigh => "accept_high",
            Self::AcceptMedium => "accept_medium",
            Self::Review => "review",
            Self::Reject => "reject",
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::AcceptHigh | Self::AcceptMedium)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    PoorImageQuality,
    LowConfidence,
}

/// Result of the decision stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub confidence_level: ConfidenceLevel,

    /// Accepted detections that a human should still look at
    pub needs_review: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,

    pub score: f32,
}

/// State of a plate track after an update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackUpdate {
    pub plate_id: String,
    pub current_position: Point2,
    pub predicted_position: Point2,

    /// Velocity in pixels per update step
    pub velocity: Point2,

    pub track_length: usize,
    pub camera_id: String,
}

/// Same plate seen by two cameras
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRecord {
    pub plate_text: String,
    pub camera_a: String,
    pub camera_b: String,

    /// Distance in camera B pixels between the transformed A center and B center
    pub distance: f64,

    pub detection_a: PlateDetection,
    pub detection_b: PlateDetection,

    /// Consecutive correlation passes that matched this plate on this pair
    pub consecutive_hits: u32,

    /// Whether `consecutive_hits` reached the configured minimum
    pub confirmed: bool,
}

/// A plate that made it through the full pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizedPlate {
    pub detection: PlateDetection,
    pub score: ConfidenceScore,
    pub decision: DecisionOutcome,

    /// Present when the decision was accepted and the tracker was updated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track: Option<TrackUpdate>,
}
