//! Multi-factor confidence scoring and the accept / review / reject decision.

use crate::config::ScoringConfig;
use crate::text::{has_letter_digit_mix, is_valid_length};
use common::plates::{
    ConfidenceLevel, ConfidenceScore, Decision, DecisionOutcome, PlateDetection, QualityMetrics,
    RejectReason, ScoreFactors, ScoreWeights,
};
use image::{DynamicImage, GrayImage};

/// Standard deviation of intensities treated as full contrast
const FULL_CONTRAST_STDDEV: f32 = 64.0;

/// Agreement of a detection with what was seen before
pub trait ConsistencySource: Send + Sync {
    /// Score in [0, 1]
    fn consistency(&self, detection: &PlateDetection) -> f32;
}

/// Neutral source used when nothing tracks plates
#[derive(Debug, Default, Clone, Copy)]
pub struct NeutralConsistency;

impl ConsistencySource for NeutralConsistency {
    fn consistency(&self, _detection: &PlateDetection) -> f32 {
        0.5
    }
}

fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (width, height) = gray.dimensions();
    if width < 3 || height < 3 {
        return 0.0;
    }

    let px = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f32;
    let mut values = Vec::with_capacity(((width - 2) * (height - 2)) as usize);
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let lap = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            values.push(lap);
        }
    }

    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n
}

fn mean_and_stddev(gray: &GrayImage) -> (f32, f32) {
    let n = (gray.width() * gray.height()) as f32;
    if n == 0.0 {
        return (0.0, 0.0);
    }
    let mean = gray.pixels().map(|p| p[0] as f32).sum::<f32>() / n;
    let var = gray
        .pixels()
        .map(|p| (p[0] as f32 - mean).powi(2))
        .sum::<f32>()
        / n;
    (mean, var.sqrt())
}

pub struct ConfidenceScorer {
    config: ScoringConfig,
}

impl ConfidenceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn weights(&self) -> ScoreWeights {
        self.config.weights
    }

    /// Sharpness, brightness, contrast and resolution of a plate crop
    pub fn assess_quality(&self, crop: &DynamicImage) -> QualityMetrics {
        let gray = crop.to_luma8();
        if gray.width() == 0 || gray.height() == 0 {
            return QualityMetrics::default();
        }
        let c = &self.config;

        let sharpness = (laplacian_variance(&gray) / c.blur_threshold.max(f32::EPSILON)).clamp(0.0, 1.0);

        let (mean, stddev) = mean_and_stddev(&gray);
        let brightness = if mean < c.min_brightness {
            mean / c.min_brightness.max(f32::EPSILON)
        } else if mean > c.max_brightness {
            (255.0 - mean) / (255.0 - c.max_brightness).max(f32::EPSILON)
        } else {
            1.0
        }
        .clamp(0.0, 1.0);

        let contrast = (stddev / FULL_CONTRAST_STDDEV).clamp(0.0, 1.0);

        let width_ratio = (gray.width() as f32 / c.min_width.max(1) as f32).min(1.0);
        let height_ratio = (gray.height() as f32 / c.min_height.max(1) as f32).min(1.0);
        let resolution = ((width_ratio + height_ratio) / 2.0).clamp(0.0, 1.0);

        QualityMetrics {
            sharpness,
            brightness,
            contrast,
            resolution,
            overall: (sharpness + brightness + contrast + resolution) / 4.0,
        }
    }

    /// Length, letter/digit mix and grammar agreement of cleaned text
    pub fn format_score(&self, text: &str, grammar_valid: bool) -> f32 {
        let mut score = 0.0;
        if is_valid_length(text, 4, 10) {
            score += 0.4;
        }
        if has_letter_digit_mix(text) {
            score += 0.3;
        }
        if grammar_valid {
            score += 0.3;
        }
        score
    }

    pub fn score(
        &self,
        detection: &PlateDetection,
        consistency: &dyn ConsistencySource,
    ) -> ConfidenceScore {
        let factors = ScoreFactors {
            ocr: detection.ocr_confidence,
            quality: detection.quality.overall,
            format: self.format_score(&detection.text, detection.region_code.is_some()),
            consistency: consistency.consistency(detection),
        };
        combine(factors, self.config.weights)
    }
}

/// Weighted sum of clamped factors, clamped again
pub fn combine(factors: ScoreFactors, weights: ScoreWeights) -> ConfidenceScore {
    let clamp = |v: f32| if v.is_finite() { v.clamp(0.0, 1.0) } else { 0.0 };
    let factors = ScoreFactors {
        ocr: clamp(factors.ocr),
        quality: clamp(factors.quality),
        format: clamp(factors.format),
        consistency: clamp(factors.consistency),
    };
    let overall = factors.ocr * weights.ocr
        + factors.quality * weights.quality
        + factors.format * weights.format
        + factors.consistency * weights.consistency;

    ConfidenceScore {
        overall: clamp(overall),
        factors,
        weights,
    }
}

pub struct DecisionMaker {
    high: f32,
    medium: f32,
    low: f32,
    min_quality: f32,
}

impl DecisionMaker {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            high: config.high_threshold,
            medium: config.medium_threshold,
            low: config.low_threshold,
            min_quality: config.min_quality,
        }
    }

    fn level(&self, overall: f32) -> ConfidenceLevel {
        if overall >= self.high {
            ConfidenceLevel::High
        } else if overall >= self.medium {
            ConfidenceLevel::Medium
        } else if overall >= self.low {
            ConfidenceLevel::Low
        } else {
            ConfidenceLevel::VeryLow
        }
    }

    pub fn decide(&self, score: &ConfidenceScore) -> DecisionOutcome {
        let confidence_level = self.level(score.overall);

        if score.factors.quality < self.min_quality {
            return DecisionOutcome {
                decision: Decision::Reject,
                confidence_level,
                needs_review: false,
                reason: Some(RejectReason::PoorImageQuality),
                score: score.overall,
            };
        }

        let (decision, needs_review, reason) = match confidence_level {
            ConfidenceLevel::High => (Decision::AcceptHigh, false, None),
            ConfidenceLevel::Medium => (Decision::AcceptMedium, true, None),
            ConfidenceLevel::Low => (Decision::Review, true, None),
            ConfidenceLevel::VeryLow => (Decision::Reject, false, Some(RejectReason::LowConfidence)),
        };

        DecisionOutcome {
            decision,
            confidence_level,
            needs_review,
            reason,
            score: score.overall,
        }
    }

    /// Accepted detections go on to tracking and correlation
    pub fn should_process(&self, score: &ConfidenceScore) -> bool {
        self.decide(score).decision.is_accepted()
    }
}
