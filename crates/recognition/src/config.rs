use crate::preprocess::EnhanceConfig;
use anyhow::{bail, Context, Result};
use common::plates::ScoreWeights;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// How OCR engines are dispatched per candidate region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMethod {
    /// Call the selected engine only
    Single,
    /// Run the rule-based and neural engines side by side and reconcile
    #[default]
    Hybrid,
}

/// Engine used by [`OcrMethod::Single`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineSelector {
    /// Best available engine: accelerated, then neural, then rule-based
    #[default]
    Auto,
    RuleBased,
    Neural,
    Accelerated,
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub ocr_method: OcrMethod,

    #[serde(default)]
    pub ocr_engine: EngineSelector,

    /// Minimum detector confidence for a candidate region (0.0 to 1.0)
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// Try to run the neural engine on CUDA / TensorRT
    #[serde(default)]
    pub use_hardware_accelerator: bool,

    #[serde(default)]
    pub detection: DetectionConfig,

    #[serde(default)]
    pub preprocessing: EnhanceConfig,

    #[serde(default)]
    pub neural: NeuralEngineConfig,

    #[serde(default)]
    pub rule_based: RuleEngineConfig,

    #[serde(default)]
    pub text: TextConfig,

    #[serde(default)]
    pub regional: RegionalConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,

    #[serde(default)]
    pub performance: PerformanceConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub camera_sync: CameraSyncConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,
}

fn default_confidence_threshold() -> f32 {
    0.7
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ocr_method: OcrMethod::default(),
            ocr_engine: EngineSelector::default(),
            confidence_threshold: default_confidence_threshold(),
            use_hardware_accelerator: false,
            detection: DetectionConfig::default(),
            preprocessing: EnhanceConfig::default(),
            neural: NeuralEngineConfig::default(),
            rule_based: RuleEngineConfig::default(),
            text: TextConfig::default(),
            regional: RegionalConfig::default(),
            scoring: ScoringConfig::default(),
            performance: PerformanceConfig::default(),
            cache: CacheConfig::default(),
            camera_sync: CameraSyncConfig::default(),
            tracking: TrackingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum plate width/height as a percentage of the frame dimensions
    #[serde(default = "default_min_plate_size")]
    pub min_plate_size: f32,

    /// IoU threshold for non-maximum suppression
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Maximum number of candidates returned per frame
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,

    /// Gaussian blur sigma applied before thresholding
    #[serde(default = "default_blur_sigma")]
    pub blur_sigma: f32,

    /// Radius of the local-mean window of the adaptive threshold
    #[serde(default = "default_block_radius")]
    pub block_radius: u32,

    /// Offset subtracted from the local mean
    #[serde(default = "default_threshold_offset")]
    pub threshold_offset: i16,

    /// Pixels darker than this never belong to a plate background
    #[serde(default = "default_min_region_intensity")]
    pub min_region_intensity: u8,
}

fn default_min_plate_size() -> f32 {
    5.0
}

fn default_iou_threshold() -> f32 {
    0.4
}

fn default_max_detections() -> usize {
    10
}

fn default_blur_sigma() -> f32 {
    1.0
}

fn default_block_radius() -> u32 {
    15
}

fn default_threshold_offset() -> i16 {
    2
}

fn default_min_region_intensity() -> u8 {
    90
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_plate_size: default_min_plate_size(),
            iou_threshold: default_iou_threshold(),
            max_detections: default_max_detections(),
            blur_sigma: default_blur_sigma(),
            block_radius: default_block_radius(),
            threshold_offset: default_threshold_offset(),
            min_region_intensity: default_min_region_intensity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeuralEngineConfig {
    /// Path to the CTC recognizer ONNX model
    #[serde(default = "default_model_path")]
    pub model_path: String,

    /// Model input width
    #[serde(default = "default_input_width")]
    pub input_width: u32,

    /// Model input height
    #[serde(default = "default_input_height")]
    pub input_height: u32,

    /// Character map; index 0 of the model output is the CTC blank
    #[serde(default = "default_char_vocab")]
    pub char_vocab: String,

    /// Accelerator provider tried first (CUDA or TensorRT)
    #[serde(default = "default_execution_provider")]
    pub execution_provider: String,

    /// GPU device ID
    #[serde(default)]
    pub device_id: i32,

    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,

    #[serde(default = "default_inter_threads")]
    pub inter_threads: usize,
}

fn default_model_path() -> String {
    "models/lpr_ocr.onnx".to_string()
}

fn default_input_width() -> u32 {
    200
}

fn default_input_height() -> u32 {
    64
}

fn default_char_vocab() -> String {
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string()
}

fn default_execution_provider() -> String {
    "CUDA".to_string()
}

fn default_intra_threads() -> usize {
    2
}

fn default_inter_threads() -> usize {
    1
}

impl Default for NeuralEngineConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            input_width: default_input_width(),
            input_height: default_input_height(),
            char_vocab: default_char_vocab(),
            execution_provider: default_execution_provider(),
            device_id: 0,
            intra_threads: default_intra_threads(),
            inter_threads: default_inter_threads(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEngineConfig {
    /// JSON glyph template table; the engine is unavailable without it
    #[serde(default)]
    pub templates_path: Option<String>,

    /// Glyphs matching no template better than this are dropped
    #[serde(default = "default_min_glyph_similarity")]
    pub min_glyph_similarity: f32,
}

fn default_min_glyph_similarity() -> f32 {
    0.6
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            templates_path: None,
            min_glyph_similarity: default_min_glyph_similarity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextConfig {
    #[serde(default = "default_min_plate_length")]
    pub min_plate_length: usize,

    #[serde(default = "default_max_plate_length")]
    pub max_plate_length: usize,

    /// Reject text that does not match the active region grammar
    #[serde(default = "default_true")]
    pub validate_format: bool,
}

fn default_min_plate_length() -> usize {
    4
}

fn default_max_plate_length() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            min_plate_length: default_min_plate_length(),
            max_plate_length: default_max_plate_length(),
            validate_format: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalConfig {
    /// Active region code
    #[serde(default = "default_country_code")]
    pub country_code: String,

    /// Region used when an unknown code is requested
    #[serde(default = "default_country_code")]
    pub default_region: String,

    /// Grammar override for the active region
    #[serde(default)]
    pub plate_format: Option<String>,

    /// External region table (JSON) merged over the built-in one
    #[serde(default)]
    pub regions_file: Option<String>,

    /// Try the other regions when the active one rejects the text
    #[serde(default = "default_true")]
    pub dynamic_switching: bool,

    /// Make a successfully switched-to region the active one
    #[serde(default)]
    pub auto_switch: bool,
}

fn default_country_code() -> String {
    "US".to_string()
}

impl Default for RegionalConfig {
    fn default() -> Self {
        Self {
            country_code: default_country_code(),
            default_region: default_country_code(),
            plate_format: None,
            regions_file: None,
            dynamic_switching: true,
            auto_switch: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default)]
    pub weights: ScoreWeights,

    #[serde(default = "default_high_threshold")]
    pub high_threshold: f32,

    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f32,

    #[serde(default = "default_low_threshold")]
    pub low_threshold: f32,

    /// Hard reject below this image quality, whatever the score
    #[serde(default = "default_min_quality")]
    pub min_quality: f32,

    #[serde(default = "default_min_brightness")]
    pub min_brightness: f32,

    #[serde(default = "default_max_brightness")]
    pub max_brightness: f32,

    /// Laplacian variance considered fully sharp
    #[serde(default = "default_blur_threshold")]
    pub blur_threshold: f32,

    #[serde(default = "default_min_width")]
    pub min_width: u32,

    #[serde(default = "default_min_height")]
    pub min_height: u32,
}

fn default_high_threshold() -> f32 {
    0.8
}

fn default_medium_threshold() -> f32 {
    0.6
}

fn default_low_threshold() -> f32 {
    0.4
}

fn default_min_quality() -> f32 {
    0.3
}

fn default_min_brightness() -> f32 {
    50.0
}

fn default_max_brightness() -> f32 {
    200.0
}

fn default_blur_threshold() -> f32 {
    100.0
}

fn default_min_width() -> u32 {
    100
}

fn default_min_height() -> u32 {
    25
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            high_threshold: default_high_threshold(),
            medium_threshold: default_medium_threshold(),
            low_threshold: default_low_threshold(),
            min_quality: default_min_quality(),
            min_brightness: default_min_brightness(),
            max_brightness: default_max_brightness(),
            blur_threshold: default_blur_threshold(),
            min_width: default_min_width(),
            min_height: default_min_height(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Run hybrid OCR engines on the worker pool
    #[serde(default = "default_true")]
    pub enable_parallel: bool,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Seconds; a frame arriving sooner after the previous one finished is dropped
    #[serde(default = "default_frame_skip_threshold")]
    pub frame_skip_threshold: f64,

    /// Reserve sync buffers at full capacity up front
    #[serde(default = "default_true")]
    pub enable_buffer_prealloc: bool,
}

fn default_max_workers() -> usize {
    4
}

fn default_frame_skip_threshold() -> f64 {
    0.05
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            enable_parallel: true,
            max_workers: default_max_workers(),
            frame_skip_threshold: default_frame_skip_threshold(),
            enable_buffer_prealloc: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
}

fn default_cache_entries() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_health_interval() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
            health_check_interval_secs: default_health_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSyncConfig {
    /// Time servers, queried in order
    #[serde(default = "default_ntp_servers")]
    pub ntp_servers: Vec<String>,

    /// Seconds between resynchronizations
    #[serde(default = "default_sync_interval")]
    pub sync_interval: f64,

    /// Seconds a frame may be away from the target time
    #[serde(default = "default_max_drift")]
    pub max_drift: f64,

    /// Frames kept per camera
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Per-server query timeout in seconds
    #[serde(default = "default_server_timeout")]
    pub server_timeout: f64,
}

fn default_ntp_servers() -> Vec<String> {
    vec![
        "pool.ntp.org".to_string(),
        "time.google.com".to_string(),
        "time.cloudflare.com".to_string(),
    ]
}

fn default_sync_interval() -> f64 {
    3600.0
}

fn default_max_drift() -> f64 {
    0.1
}

fn default_buffer_size() -> usize {
    30
}

fn default_server_timeout() -> f64 {
    2.0
}

impl Default for CameraSyncConfig {
    fn default() -> Self {
        Self {
            ntp_servers: default_ntp_servers(),
            sync_interval: default_sync_interval(),
            max_drift: default_max_drift(),
            buffer_size: default_buffer_size(),
            server_timeout: default_server_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// History capacity and expiry horizon (seconds) of a track
    #[serde(default = "default_max_track_age")]
    pub max_track_age: usize,

    /// Pixels in the target camera
    #[serde(default = "default_max_correlation_distance")]
    pub max_correlation_distance: f64,

    /// Consecutive correlation passes before a match is confirmed
    #[serde(default = "default_min_correlation_frames")]
    pub min_correlation_frames: u32,
}

fn default_max_track_age() -> usize {
    30
}

fn default_max_correlation_distance() -> f64 {
    50.0
}

fn default_min_correlation_frames() -> u32 {
    3
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_track_age: default_max_track_age(),
            max_correlation_distance: default_max_correlation_distance(),
            min_correlation_frames: default_min_correlation_frames(),
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file; missing sections take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid pipeline config in {}", path.display()))
    }

    /// Load from an optional file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(method) = env::var("LPR_OCR_METHOD") {
            self.ocr_method = serde_json::from_value(serde_json::Value::String(method.clone()))
                .with_context(|| format!("Invalid LPR_OCR_METHOD '{}'", method))?;
        }
        if let Ok(threshold) = env::var("LPR_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = threshold
                .parse()
                .context("Invalid LPR_CONFIDENCE_THRESHOLD")?;
        }
        if let Ok(flag) = env::var("LPR_USE_ACCELERATOR") {
            self.use_hardware_accelerator = flag.parse().context("Invalid LPR_USE_ACCELERATOR")?;
        }
        if let Ok(code) = env::var("LPR_COUNTRY_CODE") {
            self.regional.country_code = code.to_uppercase();
        }
        if let Ok(servers) = env::var("LPR_NTP_SERVERS") {
            self.camera_sync.ntp_servers = servers
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(provider) = env::var("LPR_EXECUTION_PROVIDER") {
            self.neural.execution_provider = provider;
        }
        if let Ok(device_id) = env::var("LPR_DEVICE_ID") {
            if let Ok(id) = device_id.parse::<i32>() {
                self.neural.device_id = id;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            );
        }
        if self.detection.min_plate_size <= 0.0 || self.detection.min_plate_size >= 100.0 {
            bail!("detection.min_plate_size must be a percentage in (0, 100)");
        }
        if self.text.min_plate_length == 0 || self.text.min_plate_length > self.text.max_plate_length {
            bail!(
                "text plate length bounds are inconsistent: {}..{}",
                self.text.min_plate_length,
                self.text.max_plate_length
            );
        }
        let s = &self.scoring;
        if !(s.low_threshold <= s.medium_threshold && s.medium_threshold <= s.high_threshold) {
            bail!("scoring thresholds must satisfy low <= medium <= high");
        }
        if s.min_brightness >= s.max_brightness {
            bail!("scoring.min_brightness must be below scoring.max_brightness");
        }
        if self.performance.max_workers == 0 {
            bail!("performance.max_workers must be at least 1");
        }
        if self.camera_sync.buffer_size == 0 {
            bail!("camera_sync.buffer_size must be at least 1");
        }
        if self.camera_sync.max_drift < 0.0 || self.camera_sync.server_timeout <= 0.0 {
            bail!("camera_sync.max_drift must be >= 0 and server_timeout > 0");
        }
        if self.tracking.max_track_age == 0 {
            bail!("tracking.max_track_age must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.ocr_method, OcrMethod::Hybrid);
        assert_eq!(config.confidence_threshold, 0.7);
        assert_eq!(config.detection.min_plate_size, 5.0);
        assert_eq!(config.text.min_plate_length, 4);
        assert_eq!(config.text.max_plate_length, 10);
        assert_eq!(config.camera_sync.max_drift, 0.1);
        assert_eq!(config.tracking.max_correlation_distance, 50.0);
        assert_eq!(config.scoring.weights.ocr, 0.4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PipelineConfig = serde_json::from_value(serde_json::json!({
            "ocr_method": "single",
            "ocr_engine": "rule_based",
            "regional": { "country_code": "DE" },
            "tracking": { "max_track_age": 5 }
        }))
        .unwrap();

        assert_eq!(config.ocr_method, OcrMethod::Single);
        assert_eq!(config.ocr_engine, EngineSelector::RuleBased);
        assert_eq!(config.regional.country_code, "DE");
        assert_eq!(config.regional.default_region, "US");
        assert_eq!(config.tracking.max_track_age, 5);
        assert_eq!(config.tracking.min_correlation_frames, 3);
        assert_eq!(config.camera_sync.buffer_size, 30);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "confidence_threshold": 0.5, "camera_sync": {{ "ntp_servers": ["10.0.0.1"] }} }}"#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.camera_sync.ntp_servers, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn test_from_file_missing() {
        let result = PipelineConfig::from_file("/nonexistent/lpr.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::default();
        config.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.text.min_plate_length = 12;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.scoring.low_threshold = 0.9;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.performance.max_workers = 0;
        assert!(config.validate().is_err());
    }
}
