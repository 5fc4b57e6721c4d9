//! Dispatch of a plate crop to the configured engines and reconciliation of
//! their answers.

use super::{EngineSet, OcrEngine, RecognitionHints};
use crate::cache::{fingerprint_with_context, CachedOcr, ResultCache};
use crate::config::{EngineSelector, OcrMethod, PipelineConfig, TextConfig};
use crate::error::RecognitionError;
use crate::text::{clean_plate_text, is_valid_length};
use common::plates::{OcrEngineKind, OcrResult};
use image::DynamicImage;
use std::sync::Arc;
use telemetry::metrics::{LPR_CACHE_REQUESTS, LPR_OCR_ENGINE_CALLS};
use tracing::{debug, warn};

/// Added to the best confidence when independent engines agree
pub const CONSENSUS_BONUS: f32 = 0.1;

/// Length difference above which the longer reading wins a disagreement
const LENGTH_PREFERENCE: usize = 2;

/// Outcome of arbitration for one crop
#[derive(Debug, Clone, PartialEq)]
pub struct ArbitratedText {
    /// Cleaned text
    pub text: String,
    pub confidence: f32,

    /// Winning engine; None when served from the cache
    pub engine: Option<OcrEngineKind>,

    /// Both engines agreed
    pub consensus: bool,

    pub from_cache: bool,
}

/// Reconcile the rule-based and neural readings.
///
/// Texts are cleaned before comparison. Equal non-empty texts form a
/// consensus; a single non-empty text wins alone; differing texts go to the
/// longer one when lengths differ by more than two, else to the neural one.
pub fn reconcile(
    rule_based: Option<OcrResult>,
    neural: Option<OcrResult>,
) -> Option<ArbitratedText> {
    let clean = |r: Option<OcrResult>| {
        r.map(|r| OcrResult {
            text: clean_plate_text(&r.text),
            ..r
        })
        .filter(|r| !r.text.is_empty())
    };

    let pick = |r: OcrResult, consensus: bool, confidence: f32| ArbitratedText {
        text: r.text,
        confidence: confidence.clamp(0.0, 1.0),
        engine: Some(r.engine),
        consensus,
        from_cache: false,
    };

    match (clean(rule_based), clean(neural)) {
        (Some(rule), Some(neural)) if rule.text == neural.text => {
            let confidence = rule.confidence.max(neural.confidence) + CONSENSUS_BONUS;
            Some(pick(neural, true, confidence))
        }
        (Some(rule), Some(neural)) => {
            let (rule_len, neural_len) = (rule.text.len(), neural.text.len());
            if rule_len.abs_diff(neural_len) > LENGTH_PREFERENCE && rule_len > neural_len {
                let confidence = rule.confidence;
                Some(pick(rule, false, confidence))
            } else {
                let confidence = neural.confidence;
                Some(pick(neural, false, confidence))
            }
        }
        (Some(only), None) | (None, Some(only)) => {
            let confidence = only.confidence;
            Some(pick(only, false, confidence))
        }
        (None, None) => None,
    }
}

fn call_engine(
    engine: &Arc<dyn OcrEngine>,
    image: &DynamicImage,
    hints: &RecognitionHints,
) -> Result<OcrResult, RecognitionError> {
    let result = engine.recognize(image, hints);
    let status = match &result {
        Ok(_) => "ok",
        Err(RecognitionError::EngineUnavailable { .. }) => "unavailable",
        Err(_) => "error",
    };
    LPR_OCR_ENGINE_CALLS
        .with_label_values(&[engine.kind().as_str(), status])
        .inc();
    result
}

/// Runs the configured engines over a crop, consulting the cache first
pub struct OcrArbitrator {
    engines: EngineSet,
    method: OcrMethod,
    selector: EngineSelector,
    pool: Option<rayon::ThreadPool>,
    cache: Option<Arc<dyn ResultCache>>,
    text: TextConfig,
}

impl OcrArbitrator {
    pub fn new(
        engines: EngineSet,
        config: &PipelineConfig,
        cache: Option<Arc<dyn ResultCache>>,
    ) -> Self {
        let pool = if config.performance.enable_parallel && config.ocr_method == OcrMethod::Hybrid
        {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(config.performance.max_workers)
                .thread_name(|i| format!("lpr-ocr-{}", i))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "failed to build OCR worker pool, running engines sequentially");
                    None
                }
            }
        } else {
            None
        };

        Self {
            engines,
            method: config.ocr_method,
            selector: config.ocr_engine,
            pool,
            cache,
            text: config.text.clone(),
        }
    }

    pub fn engines(&self) -> &EngineSet {
        &self.engines
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Arbitrated text of a preprocessed crop, None when nothing was read
    pub fn recognize(
        &self,
        image: &DynamicImage,
        hints: &RecognitionHints,
    ) -> Result<Option<ArbitratedText>, RecognitionError> {
        let key = self
            .cache
            .as_ref()
            .map(|_| fingerprint_with_context(image, &hints.cache_context()));

        if let (Some(cache), Some(key)) = (&self.cache, &key) {
            match cache.get(key) {
                Ok(Some(hit)) => {
                    LPR_CACHE_REQUESTS.with_label_values(&["hit"]).inc();
                    debug!(text = %hit.text, "OCR cache hit");
                    return Ok(Some(ArbitratedText {
                        text: hit.text,
                        confidence: hit.confidence,
                        engine: None,
                        consensus: false,
                        from_cache: true,
                    }));
                }
                Ok(None) => {
                    LPR_CACHE_REQUESTS.with_label_values(&["miss"]).inc();
                }
                Err(e) => {
                    LPR_CACHE_REQUESTS.with_label_values(&["error"]).inc();
                    warn!(error = %e, "OCR cache lookup failed, running engines");
                }
            }
        }

        let arbitrated = match self.method {
            OcrMethod::Single => self.recognize_single(image, hints)?,
            OcrMethod::Hybrid => self.recognize_hybrid(image, hints)?,
        };

        if let (Some(cache), Some(key), Some(result)) = (&self.cache, &key, &arbitrated) {
            if is_valid_length(
                &result.text,
                self.text.min_plate_length,
                self.text.max_plate_length,
            ) {
                let value = CachedOcr {
                    text: result.text.clone(),
                    confidence: result.confidence,
                };
                if let Err(e) = cache.put(key, value) {
                    warn!(error = %e, "failed to store OCR result in cache");
                }
            }
        }

        Ok(arbitrated)
    }

    fn recognize_single(
        &self,
        image: &DynamicImage,
        hints: &RecognitionHints,
    ) -> Result<Option<ArbitratedText>, RecognitionError> {
        let engine = self
            .engines
            .resolve(self.selector)
            .ok_or(RecognitionError::NoEngineAvailable)?;
        let result = call_engine(engine, image, hints)?;
        Ok(reconcile(Some(result), None))
    }

    fn recognize_hybrid(
        &self,
        image: &DynamicImage,
        hints: &RecognitionHints,
    ) -> Result<Option<ArbitratedText>, RecognitionError> {
        let (rule, neural) = match (self.engines.rule_side(), self.engines.neural_side()) {
            (Some(rule), Some(neural)) => (rule, neural),
            // Only one side available: behave like single mode with it
            (Some(only), None) | (None, Some(only)) => {
                let result = call_engine(only, image, hints)?;
                return Ok(reconcile(Some(result), None));
            }
            (None, None) => return Err(RecognitionError::NoEngineAvailable),
        };

        let (rule_result, neural_result) = match &self.pool {
            Some(pool) => pool.join(
                || call_engine(rule, image, hints),
                || call_engine(neural, image, hints),
            ),
            None => (
                call_engine(rule, image, hints),
                call_engine(neural, image, hints),
            ),
        };

        match (rule_result, neural_result) {
            (Err(rule_err), Err(neural_err)) => {
                warn!(rule = %rule_err, neural = %neural_err, "both OCR engines failed");
                Err(neural_err)
            }
            (rule_result, neural_result) => {
                let rule_ok = rule_result
                    .map_err(|e| warn!(error = %e, "rule-based OCR failed"))
                    .ok();
                let neural_ok = neural_result
                    .map_err(|e| warn!(error = %e, "neural OCR failed"))
                    .ok();
                Ok(reconcile(rule_ok, neural_ok))
            }
        }
    }
}
