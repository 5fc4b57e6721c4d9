//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use common::plates::{OcrEngineKind, OcrResult};
use image::{DynamicImage, GrayImage, Luma};
use recognition::error::{RecognitionError, SyncError};
use recognition::ocr::{EngineSet, OcrEngine, RecognitionHints};
use recognition::sync::{ServerReading, TimeSource};
use recognition::{MemoryResultCache, PipelineConfig, RecognitionPipeline, RegionalAdapter, ResultCache};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// OCR engine answering with a fixed text, or with a text that depends on
/// the region hint
pub struct StubEngine {
    kind: OcrEngineKind,
    text: String,
    /// Region whose hint makes the engine read `region_text` instead
    region: Option<(String, String)>,
    confidence: f32,
    calls: AtomicUsize,
}

impl StubEngine {
    pub fn new(kind: OcrEngineKind, text: &str, confidence: f32) -> Arc<Self> {
        Arc::new(Self {
            kind,
            text: text.to_string(),
            region: None,
            confidence,
            calls: AtomicUsize::new(0),
        })
    }

    /// Reads `matched` under the `region` hint and `otherwise` under any other
    pub fn reading_per_region(
        kind: OcrEngineKind,
        region: &str,
        matched: &str,
        otherwise: &str,
        confidence: f32,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            text: otherwise.to_string(),
            region: Some((region.to_string(), matched.to_string())),
            confidence,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl OcrEngine for StubEngine {
    fn kind(&self) -> OcrEngineKind {
        self.kind
    }

    fn recognize(
        &self,
        _image: &DynamicImage,
        hints: &RecognitionHints,
    ) -> Result<OcrResult, RecognitionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = match (&self.region, hints.region_code.as_deref()) {
            (Some((region, matched)), Some(hint)) if region == hint => matched,
            _ => &self.text,
        };
        Ok(OcrResult {
            text: text.clone(),
            confidence: self.confidence,
            engine: self.kind,
        })
    }
}

/// 640x480 dark frame with one textured 200x50 plate
pub fn plate_frame_at(left: u32, top: u32) -> DynamicImage {
    let mut frame = GrayImage::new(640, 480);
    for x in left..left + 200 {
        for y in top..top + 50 {
            let value = if (x + y) % 2 == 0 { 170u8 } else { 200u8 };
            frame.put_pixel(x, y, Luma([value]));
        }
    }
    DynamicImage::ImageLuma8(frame)
}

pub fn config_without_skip() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.performance.frame_skip_threshold = 0.0;
    config
}

pub fn pipeline(
    config: PipelineConfig,
    rule: Option<Arc<StubEngine>>,
    neural: Option<Arc<StubEngine>>,
) -> RecognitionPipeline {
    let engines = EngineSet::new(
        rule.map(|e| e as Arc<dyn OcrEngine>),
        neural.map(|e| e as Arc<dyn OcrEngine>),
        None,
    )
    .unwrap();
    let regional = RegionalAdapter::from_config(&config.regional).unwrap();
    let cache = config
        .cache
        .enabled
        .then(|| Arc::new(MemoryResultCache::from_config(&config.cache)) as Arc<dyn ResultCache>);
    RecognitionPipeline::with_components(config, engines, regional, cache)
}

/// Time source with canned per-server answers; unknown servers are unreachable
pub struct CannedTimeSource {
    offsets: HashMap<String, f64>,
    queried: Mutex<Vec<String>>,
}

impl CannedTimeSource {
    pub fn new(offsets: &[(&str, f64)]) -> Arc<Self> {
        Arc::new(Self {
            offsets: offsets.iter().map(|(s, o)| (s.to_string(), *o)).collect(),
            queried: Mutex::new(Vec::new()),
        })
    }

    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().unwrap().clone()
    }
}

impl TimeSource for CannedTimeSource {
    fn query(&self, server: &str) -> Result<ServerReading, SyncError> {
        self.queried.lock().unwrap().push(server.to_string());
        match self.offsets.get(server) {
            Some(offset) => Ok(ServerReading {
                offset: *offset,
                delay: 0.01,
            }),
            None => Err(SyncError::TimeServerUnreachable {
                server: server.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}
