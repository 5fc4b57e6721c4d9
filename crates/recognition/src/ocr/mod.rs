//! OCR engines and the arbitrator that dispatches between them.

pub mod arbitrator;
pub mod neural;
pub mod rule_based;

pub use arbitrator::{reconcile, ArbitratedText, OcrArbitrator};
pub use neural::{AcceleratedOcrEngine, NeuralOcrEngine};
pub use rule_based::{GlyphTemplates, RuleBasedOcrEngine};

use crate::config::{EngineSelector, PipelineConfig};
use crate::error::RecognitionError;
use crate::regional::RegionalAdapter;
use common::plates::{OcrEngineKind, OcrResult};
use image::DynamicImage;
use regex::Regex;
use std::sync::Arc;
use tracing::{info, warn};

/// Region context passed to the engines for one recognition attempt
#[derive(Debug, Clone, Default)]
pub struct RecognitionHints {
    pub region_code: Option<String>,

    /// Characters the plate can contain
    pub charset: Option<String>,

    /// Anchored plate grammar
    pub grammar: Option<Regex>,
}

impl RecognitionHints {
    /// Hints for `region_code` (the active region when None)
    pub fn for_region(adapter: &RegionalAdapter, region_code: Option<&str>) -> Self {
        let region = match region_code {
            Some(code) => adapter.region(code),
            None => adapter.active(),
        };
        Self {
            region_code: region.map(|r| r.code.clone()),
            charset: region.map(|r| r.charset.clone()),
            grammar: adapter.grammar(region.map(|r| r.code.as_str())).cloned(),
        }
    }

    /// Identity of these hints in cache keys; engines may read the same
    /// crop differently under different hints
    pub fn cache_context(&self) -> [&str; 3] {
        [
            self.region_code.as_deref().unwrap_or(""),
            self.charset.as_deref().unwrap_or(""),
            self.grammar.as_ref().map(Regex::as_str).unwrap_or(""),
        ]
    }
}

/// Common contract of every OCR backend
pub trait OcrEngine: Send + Sync {
    fn kind(&self) -> OcrEngineKind;

    /// Read the text of a preprocessed plate crop
    fn recognize(
        &self,
        image: &DynamicImage,
        hints: &RecognitionHints,
    ) -> Result<OcrResult, RecognitionError>;
}

/// Engines that could be initialized at startup
#[derive(Clone)]
pub struct EngineSet {
    rule_based: Option<Arc<dyn OcrEngine>>,
    neural: Option<Arc<dyn OcrEngine>>,
    accelerated: Option<Arc<dyn OcrEngine>>,
}

impl std::fmt::Debug for EngineSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSet")
            .field("available", &self.available())
            .finish()
    }
}

impl EngineSet {
    /// At least one engine is required
    pub fn new(
        rule_based: Option<Arc<dyn OcrEngine>>,
        neural: Option<Arc<dyn OcrEngine>>,
        accelerated: Option<Arc<dyn OcrEngine>>,
    ) -> Result<Self, RecognitionError> {
        if rule_based.is_none() && neural.is_none() && accelerated.is_none() {
            return Err(RecognitionError::NoEngineAvailable);
        }
        Ok(Self {
            rule_based,
            neural,
            accelerated,
        })
    }

    /// Initialize every engine the configuration allows; unavailable ones
    /// are logged and left out.
    pub fn initialize(config: &PipelineConfig) -> Result<Self, RecognitionError> {
        let rule_based: Option<Arc<dyn OcrEngine>> =
            match RuleBasedOcrEngine::from_config(&config.rule_based) {
                Ok(engine) => Some(Arc::new(engine)),
                Err(e) => {
                    warn!(error = %e, "rule-based OCR engine unavailable");
                    None
                }
            };

        let neural_cpu = match NeuralOcrEngine::new(&config.neural) {
            Ok(engine) => Some(Arc::new(engine)),
            Err(e) => {
                warn!(error = %e, "neural OCR engine unavailable");
                None
            }
        };

        let accelerated: Option<Arc<dyn OcrEngine>> = if config.use_hardware_accelerator {
            match AcceleratedOcrEngine::new(&config.neural, neural_cpu.clone()) {
                Ok(engine) => Some(Arc::new(engine)),
                Err(e) => {
                    warn!(error = %e, "hardware accelerated OCR unavailable, falling back");
                    None
                }
            }
        } else {
            None
        };

        let neural: Option<Arc<dyn OcrEngine>> = neural_cpu.map(|e| e as Arc<dyn OcrEngine>);
        let set = Self::new(rule_based, neural, accelerated)?;
        info!(engines = ?set.available(), "OCR engines initialized");
        Ok(set)
    }

    pub fn available(&self) -> Vec<OcrEngineKind> {
        [
            (OcrEngineKind::Accelerated, self.accelerated.is_some()),
            (OcrEngineKind::Neural, self.neural.is_some()),
            (OcrEngineKind::RuleBased, self.rule_based.is_some()),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .map(|(kind, _)| kind)
        .collect()
    }

    pub fn get(&self, kind: OcrEngineKind) -> Option<&Arc<dyn OcrEngine>> {
        match kind {
            OcrEngineKind::RuleBased => self.rule_based.as_ref(),
            OcrEngineKind::Neural => self.neural.as_ref(),
            OcrEngineKind::Accelerated => self.accelerated.as_ref(),
        }
    }

    /// Best neural engine: accelerated when present, else CPU
    pub fn neural_side(&self) -> Option<&Arc<dyn OcrEngine>> {
        self.accelerated.as_ref().or(self.neural.as_ref())
    }

    pub fn rule_side(&self) -> Option<&Arc<dyn OcrEngine>> {
        self.rule_based.as_ref()
    }

    /// Engine for `selector`, walking accelerated -> neural -> rule-based
    /// from the requested engine when it is missing.
    pub fn resolve(&self, selector: EngineSelector) -> Option<&Arc<dyn OcrEngine>> {
        let chain: &[OcrEngineKind] = match selector {
            EngineSelector::Auto | EngineSelector::Accelerated => &[
                OcrEngineKind::Accelerated,
                OcrEngineKind::Neural,
                OcrEngineKind::RuleBased,
            ],
            EngineSelector::Neural => &[OcrEngineKind::Neural, OcrEngineKind::RuleBased],
            EngineSelector::RuleBased => &[OcrEngineKind::RuleBased, OcrEngineKind::Neural],
        };
        chain.iter().find_map(|kind| self.get(*kind))
    }
}
