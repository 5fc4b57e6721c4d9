//! Per-frame recognition: detection, OCR, regional checks, scoring, decision
//! and tracking, behind one context object.

use crate::cache::{MemoryResultCache, ResultCache};
use crate::config::PipelineConfig;
use crate::detector::PlateRegionDetector;
use crate::error::RecognitionError;
use crate::frame::Frame;
use crate::ocr::{ArbitratedText, EngineSet, OcrArbitrator, RecognitionHints};
use crate::preprocess::{ImageEnhancer, RegionPreprocessor};
use crate::regional::{DynamicSwitcher, RegionalAdapter};
use crate::scoring::{ConfidenceScorer, DecisionMaker};
use crate::text::is_valid_length;
use crate::tracking::PlateTracker;
use anyhow::{Context, Result};
use common::plates::{
    CandidateRegion, Decision, PlateDetection, RecognizedPlate, RejectReason,
};
use image::DynamicImage;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Instant;
use telemetry::metrics::{
    LPR_CANDIDATE_REGIONS, LPR_DECISIONS, LPR_FRAMES_PROCESSED, LPR_FRAMES_SKIPPED,
    LPR_FRAME_LATENCY, LPR_REJECTIONS,
};
use tracing::{debug, info, warn};

/// What `process_frame` made of one frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Plates that were accepted or sent to review
    Recognized(Vec<RecognizedPlate>),
    NothingRecognized,
    /// Dropped by the frame-skip rule without being looked at
    Skipped,
}

impl FrameOutcome {
    pub fn plates(&self) -> &[RecognizedPlate] {
        match self {
            Self::Recognized(plates) => plates,
            _ => &[],
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped)
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Recognized(_) => "recognized",
            Self::NothingRecognized => "nothing_recognized",
            Self::Skipped => "skipped",
        }
    }
}

/// Running totals since the pipeline was created
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub frames_skipped: u64,
    pub frames_without_plates: u64,
    pub plates_accepted: u64,
    pub plates_for_review: u64,
    pub plates_rejected: u64,
    pub cache_hits: u64,
    pub region_switches: u64,
}

/// Text read from one crop, after length and grammar checks
struct ReadText {
    arbitrated: ArbitratedText,
    region_code: Option<String>,
}

pub struct RecognitionPipeline {
    config: PipelineConfig,
    detector: PlateRegionDetector,
    preprocessor: Arc<dyn RegionPreprocessor>,
    arbitrator: OcrArbitrator,
    cache: Option<Arc<dyn ResultCache>>,
    regional: RwLock<RegionalAdapter>,
    switcher: Option<DynamicSwitcher>,
    scorer: ConfidenceScorer,
    decisions: DecisionMaker,
    tracker: Arc<PlateTracker>,
    last_completed: Mutex<HashMap<String, Instant>>,
    stats: Mutex<PipelineStats>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RecognitionPipeline {
    /// Build every stage from configuration.
    ///
    /// Fails when no OCR engine can be initialized or the region table is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let engines = EngineSet::initialize(&config).context("OCR engine initialization failed")?;
        let regional = RegionalAdapter::from_config(&config.regional)
            .context("Failed to build the region table")?;
        let cache: Option<Arc<dyn ResultCache>> = if config.cache.enabled {
            Some(Arc::new(MemoryResultCache::from_config(&config.cache)))
        } else {
            None
        };
        Ok(Self::with_components(config, engines, regional, cache))
    }

    /// Assemble a pipeline from already built collaborators
    pub fn with_components(
        config: PipelineConfig,
        engines: EngineSet,
        regional: RegionalAdapter,
        cache: Option<Arc<dyn ResultCache>>,
    ) -> Self {
        let arbitrator = OcrArbitrator::new(engines, &config, cache.clone());
        let switcher = config
            .regional
            .dynamic_switching
            .then(DynamicSwitcher::default);

        info!(
            ocr_method = ?config.ocr_method,
            engines = ?arbitrator.engines().available(),
            parallel = arbitrator.is_parallel(),
            region = %regional.active_code(),
            cache = cache.is_some(),
            "recognition pipeline ready"
        );

        Self {
            detector: PlateRegionDetector::new(config.detection.clone()),
            preprocessor: Arc::new(ImageEnhancer::new()),
            arbitrator,
            cache,
            regional: RwLock::new(regional),
            switcher,
            scorer: ConfidenceScorer::new(config.scoring.clone()),
            decisions: DecisionMaker::new(&config.scoring),
            tracker: Arc::new(PlateTracker::new(config.tracking.max_track_age)),
            last_completed: Mutex::new(HashMap::new()),
            stats: Mutex::new(PipelineStats::default()),
            config,
        }
    }

    /// Replace the default image enhancer
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn RegionPreprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<PlateTracker> {
        &self.tracker
    }

    pub fn cache(&self) -> Option<&Arc<dyn ResultCache>> {
        self.cache.as_ref()
    }

    pub fn stats(&self) -> PipelineStats {
        lock(&self.stats).clone()
    }

    pub fn active_region(&self) -> String {
        self.regional
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active_code()
            .to_string()
    }

    /// Switch the active region; returns the region actually selected
    pub fn set_region(&self, code: &str) -> String {
        self.regional
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .set_region(code)
            .to_string()
    }

    /// Recognize the plates of one frame.
    ///
    /// Never fails: per-detection problems are counted and logged, and the
    /// frame then yields fewer (or no) plates. A frame arriving less than
    /// `frame_skip_threshold` seconds after the previous frame of the same
    /// camera finished is skipped.
    pub fn process_frame(&self, frame: &Frame) -> FrameOutcome {
        let started = Instant::now();

        if self.should_skip(&frame.camera_id, started) {
            lock(&self.stats).frames_skipped += 1;
            LPR_FRAMES_SKIPPED
                .with_label_values(&[frame.camera_id.as_str()])
                .inc();
            debug!(camera_id = %frame.camera_id, "frame skipped");
            return FrameOutcome::Skipped;
        }

        let outcome = self.recognize_frame(frame);

        lock(&self.last_completed).insert(frame.camera_id.clone(), Instant::now());
        {
            let mut stats = lock(&self.stats);
            stats.frames_processed += 1;
            if outcome.plates().is_empty() {
                stats.frames_without_plates += 1;
            }
        }
        LPR_FRAMES_PROCESSED
            .with_label_values(&[frame.camera_id.as_str(), outcome.label()])
            .inc();
        LPR_FRAME_LATENCY
            .with_label_values(&[frame.camera_id.as_str()])
            .observe(started.elapsed().as_secs_f64());
        outcome
    }

    fn should_skip(&self, camera_id: &str, now: Instant) -> bool {
        let threshold = self.config.performance.frame_skip_threshold;
        if threshold <= 0.0 {
            return false;
        }
        lock(&self.last_completed)
            .get(camera_id)
            .is_some_and(|last| now.saturating_duration_since(*last).as_secs_f64() < threshold)
    }

    fn recognize_frame(&self, frame: &Frame) -> FrameOutcome {
        if frame.is_empty() {
            let err = RecognitionError::FrameUnavailable(frame.camera_id.clone());
            LPR_REJECTIONS.with_label_values(&[err.metric_label()]).inc();
            warn!(camera_id = %frame.camera_id, "empty frame");
            return FrameOutcome::NothingRecognized;
        }

        let settings = self.detector.settings(self.config.confidence_threshold);
        let regions = self.detector.detect(&frame.image, &settings);
        LPR_CANDIDATE_REGIONS.inc_by(regions.len() as u64);
        if regions.is_empty() {
            debug!(camera_id = %frame.camera_id, "no plate region detected");
            return FrameOutcome::NothingRecognized;
        }

        let mut plates = Vec::with_capacity(regions.len());
        for region in regions {
            match self.recognize_region(frame, region) {
                Ok(Some(plate)) => plates.push(plate),
                Ok(None) => {}
                Err(e) => {
                    LPR_REJECTIONS.with_label_values(&[e.metric_label()]).inc();
                    debug!(camera_id = %frame.camera_id, bbox = ?region.bbox, error = %e, "candidate dropped");
                }
            }
        }

        if plates.is_empty() {
            FrameOutcome::NothingRecognized
        } else {
            FrameOutcome::Recognized(plates)
        }
    }

    fn recognize_region(
        &self,
        frame: &Frame,
        region: CandidateRegion,
    ) -> Result<Option<RecognizedPlate>, RecognitionError> {
        let b = region.bbox;
        let crop = frame.image.crop_imm(b.x, b.y, b.width, b.height);

        let Some(read) = self.read_text(&crop)? else {
            return Ok(None);
        };
        if read.arbitrated.from_cache {
            lock(&self.stats).cache_hits += 1;
        }

        let detection = PlateDetection {
            camera_id: frame.camera_id.clone(),
            timestamp: frame.timestamp,
            region,
            text: read.arbitrated.text,
            ocr_confidence: read.arbitrated.confidence,
            engine: read.arbitrated.engine,
            quality: self.scorer.assess_quality(&crop),
            region_code: read.region_code,
        };

        let score = self.scorer.score(&detection, self.tracker.as_ref());
        let decision = self.decisions.decide(&score);
        LPR_DECISIONS
            .with_label_values(&[decision.decision.as_str()])
            .inc();

        match (decision.decision, decision.reason) {
            (Decision::Reject, Some(RejectReason::PoorImageQuality)) => {
                lock(&self.stats).plates_rejected += 1;
                return Err(RecognitionError::LowQualityRejected {
                    quality: detection.quality.overall,
                });
            }
            (Decision::Reject, _) => {
                lock(&self.stats).plates_rejected += 1;
                LPR_REJECTIONS.with_label_values(&["low_confidence"]).inc();
                debug!(text = %detection.text, score = score.overall, "low confidence plate rejected");
                return Ok(None);
            }
            (Decision::Review, _) => lock(&self.stats).plates_for_review += 1,
            _ => lock(&self.stats).plates_accepted += 1,
        }

        let track = decision.decision.is_accepted().then(|| {
            self.tracker
                .update_track(&detection.text, &detection, &frame.camera_id)
        });

        info!(
            camera_id = %frame.camera_id,
            plate = %detection.text,
            region = ?detection.region_code,
            score = score.overall,
            decision = %decision.decision,
            "plate recognized"
        );

        Ok(Some(RecognizedPlate {
            detection,
            score,
            decision,
            track,
        }))
    }

    /// Preprocess and OCR a crop, then apply length and grammar checks
    fn read_text(&self, crop: &DynamicImage) -> Result<Option<ReadText>, RecognitionError> {
        let read = match &self.switcher {
            Some(switcher) => self.read_with_switching(crop, switcher)?,
            None => self.read_active_region(crop)?,
        };
        let Some(read) = read else {
            return Ok(None);
        };

        let text_config = &self.config.text;
        if !is_valid_length(
            &read.arbitrated.text,
            text_config.min_plate_length,
            text_config.max_plate_length,
        ) {
            return Err(RecognitionError::format_rejected(
                read.arbitrated.text,
                format!(
                    "length outside {}..={}",
                    text_config.min_plate_length, text_config.max_plate_length
                ),
            ));
        }
        if text_config.validate_format && read.region_code.is_none() {
            return Err(RecognitionError::format_rejected(
                read.arbitrated.text,
                "no region grammar matched",
            ));
        }
        Ok(Some(read))
    }

    fn read_active_region(&self, crop: &DynamicImage) -> Result<Option<ReadText>, RecognitionError> {
        let adapter = self
            .regional
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let hints = RecognitionHints::for_region(&adapter, None);
        let enhance = match adapter.active() {
            Some(region) => self.config.preprocessing.with_hints(&region.preprocessing),
            None => self.config.preprocessing.clone(),
        };
        let enhanced = self.preprocessor.enhance(crop, &enhance);

        let Some(mut arbitrated) = self.arbitrator.recognize(&enhanced, &hints)? else {
            return Ok(None);
        };
        arbitrated.text = adapter.normalize(&arbitrated.text, None);
        let region_code = adapter
            .validate_format(&arbitrated.text, None)
            .then(|| adapter.active_code().to_string());
        Ok(Some(ReadText {
            arbitrated,
            region_code,
        }))
    }

    fn read_with_switching(
        &self,
        crop: &DynamicImage,
        switcher: &DynamicSwitcher,
    ) -> Result<Option<ReadText>, RecognitionError> {
        let mut first: Option<ArbitratedText> = None;
        let mut last_error: Option<RecognitionError> = None;

        let (outcome, switched_from) = {
            let adapter = self
                .regional
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let outcome = switcher.recognize(&adapter, |region| {
                let hints = RecognitionHints::for_region(&adapter, Some(&region.code));
                let enhance = self.config.preprocessing.with_hints(&region.preprocessing);
                let enhanced = self.preprocessor.enhance(crop, &enhance);
                match self.arbitrator.recognize(&enhanced, &hints) {
                    Ok(Some(arbitrated)) => {
                        if first.is_none() {
                            first = Some(arbitrated.clone());
                        }
                        Some((arbitrated.text.clone(), arbitrated))
                    }
                    Ok(None) => None,
                    Err(e) => {
                        last_error = Some(e);
                        None
                    }
                }
            });
            (outcome, adapter.active_code().to_string())
        };

        match (outcome.region, outcome.payload) {
            (Some(region_code), Some(mut arbitrated)) => {
                arbitrated.text = outcome.text;
                if region_code != switched_from {
                    lock(&self.stats).region_switches += 1;
                    if self.config.regional.auto_switch {
                        let now = self.set_region(&region_code);
                        info!(from = %switched_from, to = %now, "active region switched");
                    }
                }
                Ok(Some(ReadText {
                    arbitrated,
                    region_code: Some(region_code),
                }))
            }
            _ => match (first, last_error) {
                (Some(mut arbitrated), _) => {
                    let adapter = self
                        .regional
                        .read()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    arbitrated.text = adapter.normalize(&arbitrated.text, None);
                    Ok(Some(ReadText {
                        arbitrated,
                        region_code: None,
                    }))
                }
                (None, Some(e)) => Err(e),
                (None, None) => Ok(None),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::ocr::testing::{FixedEngine, RegionEngine};
    use crate::ocr::OcrEngine;
    use common::plates::OcrEngineKind;

    fn pipeline_with(
        config: PipelineConfig,
        rule: Option<Arc<FixedEngine>>,
        neural: Option<Arc<FixedEngine>>,
    ) -> RecognitionPipeline {
        let engines = EngineSet::new(
            rule.map(|e| e as Arc<dyn OcrEngine>),
            neural.map(|e| e as Arc<dyn OcrEngine>),
            None,
        )
        .unwrap();
        let regional = RegionalAdapter::from_config(&config.regional).unwrap();
        let cache: Option<Arc<dyn ResultCache>> = config
            .cache
            .enabled
            .then(|| Arc::new(MemoryResultCache::from_config(&config.cache)) as Arc<dyn ResultCache>);
        RecognitionPipeline::with_components(config, engines, regional, cache)
    }

    fn no_skip() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.performance.frame_skip_threshold = 0.0;
        config
    }

    fn frame(camera: &str, image: DynamicImage, ts: f64) -> Frame {
        Frame::new(camera, image, ts)
    }

    #[test]
    fn test_recognizes_and_tracks_plate() {
        let pipeline = pipeline_with(
            no_skip(),
            Some(FixedEngine::ok(OcrEngineKind::RuleBased, "ABC123", 0.9)),
            Some(FixedEngine::ok(OcrEngineKind::Neural, "abc-123", 0.85)),
        );

        let outcome = pipeline.process_frame(&frame("gate", plate_frame(), 1.0));
        let plates = outcome.plates();
        assert_eq!(plates.len(), 1);

        let plate = &plates[0];
        assert_eq!(plate.detection.text, "ABC123");
        assert_eq!(plate.detection.region_code.as_deref(), Some("US"));
        assert!(plate.decision.decision.is_accepted());
        assert!(plate.score.overall >= 0.0 && plate.score.overall <= 1.0);

        let track = plate.track.as_ref().unwrap();
        assert_eq!(track.plate_id, "ABC123");
        assert_eq!(track.camera_id, "gate");
        assert_eq!(pipeline.tracker().len(), 1);
        assert_eq!(pipeline.stats().plates_accepted, 1);
    }

    #[test]
    fn test_second_frame_within_threshold_is_skipped() {
        let mut config = PipelineConfig::default();
        config.performance.frame_skip_threshold = 60.0;
        let pipeline = pipeline_with(
            config,
            None,
            Some(FixedEngine::ok(OcrEngineKind::Neural, "ABC123", 0.9)),
        );

        let first = pipeline.process_frame(&frame("gate", plate_frame(), 1.0));
        assert!(!first.is_skipped());
        let second = pipeline.process_frame(&frame("gate", plate_frame(), 1.01));
        assert_eq!(second, FrameOutcome::Skipped);

        // Other cameras are unaffected
        let other = pipeline.process_frame(&frame("lobby", plate_frame(), 1.01));
        assert!(!other.is_skipped());

        let stats = pipeline.stats();
        assert_eq!(stats.frames_skipped, 1);
        assert_eq!(stats.frames_processed, 2);
    }

    #[test]
    fn test_blank_frame_recognizes_nothing() {
        let neural = FixedEngine::ok(OcrEngineKind::Neural, "ABC123", 0.9);
        let pipeline = pipeline_with(no_skip(), None, Some(neural.clone()));

        let blank = DynamicImage::ImageLuma8(image::GrayImage::new(320, 240));
        assert_eq!(
            pipeline.process_frame(&frame("gate", blank, 0.0)),
            FrameOutcome::NothingRecognized
        );
        let empty = DynamicImage::ImageLuma8(image::GrayImage::new(0, 0));
        assert_eq!(
            pipeline.process_frame(&frame("gate", empty, 0.0)),
            FrameOutcome::NothingRecognized
        );
        assert_eq!(neural.calls(), 0);
    }

    #[test]
    fn test_length_rejection() {
        let pipeline = pipeline_with(
            no_skip(),
            None,
            Some(FixedEngine::ok(OcrEngineKind::Neural, "AB1", 0.95)),
        );
        let outcome = pipeline.process_frame(&frame("gate", plate_frame(), 0.0));
        assert_eq!(outcome, FrameOutcome::NothingRecognized);
        assert!(pipeline.tracker().is_empty());
    }

    #[test]
    fn test_grammar_rejection_without_switching() {
        let mut config = no_skip();
        config.regional.country_code = "UK".to_string();
        config.regional.dynamic_switching = false;
        let pipeline = pipeline_with(
            config,
            None,
            Some(FixedEngine::ok(OcrEngineKind::Neural, "ABC123", 0.95)),
        );
        let outcome = pipeline.process_frame(&frame("gate", plate_frame(), 0.0));
        assert_eq!(outcome, FrameOutcome::NothingRecognized);
    }

    #[test]
    fn test_format_validation_can_be_disabled() {
        let mut config = no_skip();
        config.regional.country_code = "UK".to_string();
        config.regional.dynamic_switching = false;
        config.text.validate_format = false;
        let pipeline = pipeline_with(
            config,
            None,
            Some(FixedEngine::ok(OcrEngineKind::Neural, "ABC123", 0.95)),
        );
        let outcome = pipeline.process_frame(&frame("gate", plate_frame(), 0.0));
        let plates = outcome.plates();
        assert_eq!(plates.len(), 1);
        assert_eq!(plates[0].detection.region_code, None);
    }

    #[test]
    fn test_dynamic_switching_finds_region() {
        let mut config = no_skip();
        config.regional.country_code = "UK".to_string();
        config.regional.auto_switch = true;
        let pipeline = pipeline_with(
            config,
            None,
            Some(FixedEngine::ok(OcrEngineKind::Neural, "ABC1234", 0.95)),
        );

        let outcome = pipeline.process_frame(&frame("gate", plate_frame(), 0.0));
        let plates = outcome.plates();
        assert_eq!(plates.len(), 1);
        // UK grammar rejects it; BR is next in table order and accepts
        assert_eq!(plates[0].detection.region_code.as_deref(), Some("BR"));
        assert_eq!(pipeline.active_region(), "BR");
        assert_eq!(pipeline.stats().region_switches, 1);
    }

    #[test]
    fn test_poor_quality_is_hard_rejected() {
        let mut config = no_skip();
        config.scoring.min_quality = 0.95;
        let pipeline = pipeline_with(
            config,
            None,
            Some(FixedEngine::ok(OcrEngineKind::Neural, "ABC123", 1.0)),
        );
        let outcome = pipeline.process_frame(&frame("gate", plate_frame(), 0.0));
        assert_eq!(outcome, FrameOutcome::NothingRecognized);
        assert_eq!(pipeline.stats().plates_rejected, 1);
        assert!(pipeline.tracker().is_empty());
    }

    #[test]
    fn test_all_engines_failing_recognizes_nothing() {
        let pipeline = pipeline_with(
            no_skip(),
            Some(FixedEngine::failing(OcrEngineKind::RuleBased, "no glyphs")),
            Some(FixedEngine::failing(OcrEngineKind::Neural, "session error")),
        );
        let outcome = pipeline.process_frame(&frame("gate", plate_frame(), 0.0));
        assert_eq!(outcome, FrameOutcome::NothingRecognized);
    }

    #[test]
    fn test_cache_serves_repeated_crops() {
        let neural = FixedEngine::ok(OcrEngineKind::Neural, "ABC123", 0.9);
        let mut config = no_skip();
        config.ocr_method = crate::config::OcrMethod::Single;
        let pipeline = pipeline_with(config, None, Some(neural.clone()));

        let first = pipeline.process_frame(&frame("gate", plate_frame(), 0.0));
        let second = pipeline.process_frame(&frame("gate", plate_frame(), 0.5));
        assert_eq!(neural.calls(), 1);
        assert_eq!(pipeline.stats().cache_hits, 1);
        assert_eq!(
            first.plates()[0].detection.text,
            second.plates()[0].detection.text
        );
    }

    #[test]
    fn test_cache_keeps_region_specific_readings_apart() {
        let run = |cache_enabled: bool| {
            let mut config = no_skip();
            config.ocr_method = crate::config::OcrMethod::Single;
            config.regional.dynamic_switching = true;
            config.regional.auto_switch = false;
            config.cache.enabled = cache_enabled;
            let neural = RegionEngine::new(OcrEngineKind::Neural, "BR", "ABC1D23", "999999999");
            let engines =
                EngineSet::new(None, Some(neural as Arc<dyn OcrEngine>), None).unwrap();
            let regional = RegionalAdapter::from_config(&config.regional).unwrap();
            let cache: Option<Arc<dyn ResultCache>> = config.cache.enabled.then(|| {
                Arc::new(MemoryResultCache::from_config(&config.cache)) as Arc<dyn ResultCache>
            });
            let pipeline = RecognitionPipeline::with_components(config, engines, regional, cache);
            assert_eq!(pipeline.active_region(), "US");

            (0..2)
                .map(|i| {
                    let outcome = pipeline.process_frame(&frame("gate", plate_frame(), i as f64));
                    let plates = outcome.plates();
                    assert_eq!(plates.len(), 1);
                    (
                        plates[0].detection.text.clone(),
                        plates[0].detection.region_code.clone(),
                    )
                })
                .collect::<Vec<_>>()
        };

        let expected = ("ABC1D23".to_string(), Some("BR".to_string()));
        assert_eq!(run(false), vec![expected.clone(), expected.clone()]);
        assert_eq!(run(true), vec![expected.clone(), expected]);
    }

    #[test]
    fn test_set_region_falls_back_to_default() {
        let pipeline = pipeline_with(
            no_skip(),
            None,
            Some(FixedEngine::ok(OcrEngineKind::Neural, "ABC123", 0.9)),
        );
        assert_eq!(pipeline.set_region("de"), "DE");
        assert_eq!(pipeline.set_region("ATLANTIS"), "US");
    }
}
