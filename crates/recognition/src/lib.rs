//! License plate recognition: region detection, multi-engine OCR, regional
//! formats, confidence decisions, plate tracking and multi-camera
//! correlation on a synchronized clock.

pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod frame;
pub mod ocr;
pub mod pipeline;
pub mod preprocess;
pub mod regional;
pub mod scoring;
pub mod source;
pub mod sync;
pub mod text;
pub mod tracking;
pub mod worker;

pub use cache::{CacheHealth, CacheHealthMonitor, MemoryResultCache, ResultCache};
pub use config::PipelineConfig;
pub use detector::PlateRegionDetector;
pub use error::{CacheError, RecognitionError, SyncError, TrackingError};
pub use frame::Frame;
pub use ocr::{EngineSet, OcrArbitrator, OcrEngine};
pub use pipeline::{FrameOutcome, PipelineStats, RecognitionPipeline};
pub use regional::RegionalAdapter;
pub use scoring::{ConfidenceScorer, DecisionMaker};
pub use source::{DirectoryFrameSource, FrameSource};
pub use sync::CameraSyncManager;
pub use tracking::{CrossCameraCorrelator, HomographyCalculator, PlateTracker};
pub use worker::{spawn_camera_worker, CameraEvent, CorrelationLoop};
