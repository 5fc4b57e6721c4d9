//! Template-matching OCR.
//!
//! The crop is binarized at Otsu's level, glyphs are cut out by column
//! projection and each glyph is compared cell by cell against a table of
//! character templates. When the resulting string violates the region grammar,
//! visually confusable characters are swapped until it fits.

use super::{OcrEngine, RecognitionHints};
use crate::config::RuleEngineConfig;
use crate::error::RecognitionError;
use common::plates::{OcrEngineKind, OcrResult};
use image::{DynamicImage, GrayImage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pairs the template matcher mixes up most often
const CONFUSIONS: [(char, char); 6] = [
    ('0', 'O'),
    ('1', 'I'),
    ('2', 'Z'),
    ('5', 'S'),
    ('8', 'B'),
    ('6', 'G'),
];

/// More confusable positions than this are left alone
const MAX_REPAIR_POSITIONS: usize = 10;

/// Glyphs shorter than this fraction of the crop height are noise
const MIN_GLYPH_HEIGHT_RATIO: f32 = 0.35;

/// Character template table as stored on disk.
///
/// Every glyph is `height` rows of `width` cells; `#` or `1` marks ink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlyphTemplates {
    pub width: usize,
    pub height: usize,
    pub glyphs: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
struct CompiledGlyph {
    ch: char,
    cells: Vec<bool>,
}

impl GlyphTemplates {
    fn compile(&self) -> Result<Vec<CompiledGlyph>, String> {
        if self.width == 0 || self.height == 0 {
            return Err("template grid must be at least 1x1".to_string());
        }

        let mut compiled = Vec::with_capacity(self.glyphs.len());
        for (key, rows) in &self.glyphs {
            let mut chars = key.chars();
            let ch = match (chars.next(), chars.next()) {
                (Some(ch), None) => ch.to_ascii_uppercase(),
                _ => return Err(format!("template key '{}' is not a single character", key)),
            };
            if rows.len() != self.height || rows.iter().any(|r| r.chars().count() != self.width)
            {
                return Err(format!(
                    "template '{}' does not match the {}x{} grid",
                    key, self.width, self.height
                ));
            }
            let cells = rows
                .iter()
                .flat_map(|r| r.chars().map(|c| c == '#' || c == '1'))
                .collect();
            compiled.push(CompiledGlyph { ch, cells });
        }

        if compiled.is_empty() {
            return Err("template table is empty".to_string());
        }
        Ok(compiled)
    }
}

fn confusion_partner(c: char) -> Option<char> {
    CONFUSIONS.iter().find_map(|&(a, b)| {
        if c == a {
            Some(b)
        } else if c == b {
            Some(a)
        } else {
            None
        }
    })
}

/// Swap confusable characters until `text` satisfies `grammar`.
///
/// Candidates with fewer swaps are tried first; the input is returned
/// unchanged when nothing fits.
pub fn repair_confusions(text: &str, grammar: &Regex, charset: Option<&str>) -> String {
    if grammar.is_match(text) {
        return text.to_string();
    }

    let chars: Vec<char> = text.chars().collect();
    let positions: Vec<usize> = chars
        .iter()
        .enumerate()
        .filter(|(_, c)| confusion_partner(**c).is_some())
        .map(|(i, _)| i)
        .take(MAX_REPAIR_POSITIONS)
        .collect();

    let mut masks: Vec<u32> = (1..(1u32 << positions.len())).collect();
    masks.sort_by_key(|m| (m.count_ones(), *m));

    for mask in masks {
        let mut candidate = chars.clone();
        for (bit, &pos) in positions.iter().enumerate() {
            if mask & (1 << bit) != 0 {
                if let Some(partner) = confusion_partner(candidate[pos]) {
                    candidate[pos] = partner;
                }
            }
        }
        if let Some(set) = charset {
            if !candidate.iter().all(|c| set.contains(*c)) {
                continue;
            }
        }
        let candidate: String = candidate.into_iter().collect();
        if grammar.is_match(&candidate) {
            return candidate;
        }
    }
    text.to_string()
}

pub struct RuleBasedOcrEngine {
    templates: Vec<CompiledGlyph>,
    grid_width: usize,
    grid_height: usize,
    min_similarity: f32,
}

impl RuleBasedOcrEngine {
    pub fn from_templates(
        templates: &GlyphTemplates,
        min_similarity: f32,
    ) -> Result<Self, RecognitionError> {
        let compiled = templates
            .compile()
            .map_err(|e| RecognitionError::unavailable(OcrEngineKind::RuleBased.as_str(), e))?;
        Ok(Self {
            templates: compiled,
            grid_width: templates.width,
            grid_height: templates.height,
            min_similarity,
        })
    }

    /// Load the template table named by the configuration
    pub fn from_config(config: &RuleEngineConfig) -> Result<Self, RecognitionError> {
        let engine = OcrEngineKind::RuleBased.as_str();
        let path = config
            .templates_path
            .as_deref()
            .ok_or_else(|| RecognitionError::unavailable(engine, "no glyph templates configured"))?;

        let raw = std::fs::read_to_string(path)
            .map_err(|e| RecognitionError::unavailable(engine, format!("{}: {}", path, e)))?;
        let templates: GlyphTemplates = serde_json::from_str(&raw)
            .map_err(|e| RecognitionError::unavailable(engine, format!("{}: {}", path, e)))?;

        let engine = Self::from_templates(&templates, config.min_glyph_similarity)?;
        tracing::info!(path = %path, glyphs = engine.templates.len(), "loaded glyph templates");
        Ok(engine)
    }

    /// Foreground mask; the minority side of the Otsu split is ink
    fn binarize(gray: &GrayImage) -> Vec<bool> {
        let level = imageproc::contrast::otsu_level(gray);
        let dark: Vec<bool> = gray.pixels().map(|p| p[0] <= level).collect();
        let dark_count = dark.iter().filter(|d| **d).count();
        let ink_is_dark = dark_count * 2 <= dark.len();
        dark.into_iter().map(|d| d == ink_is_dark).collect()
    }

    /// Glyph boxes `(x0, y0, x1, y1)`, inclusive, left to right
    fn segment(mask: &[bool], width: usize, height: usize) -> Vec<(usize, usize, usize, usize)> {
        let column_has_ink = |x: usize| (0..height).any(|y| mask[y * width + x]);

        let mut runs = Vec::new();
        let mut start = None;
        for x in 0..width {
            match (column_has_ink(x), start) {
                (true, None) => start = Some(x),
                (false, Some(s)) => {
                    runs.push((s, x - 1));
                    start = None;
                }
                _ => {}
            }
        }
        if let Some(s) = start {
            runs.push((s, width - 1));
        }

        let min_height = (height as f32 * MIN_GLYPH_HEIGHT_RATIO).ceil() as usize;
        runs.into_iter()
            .filter_map(|(x0, x1)| {
                let rows: Vec<usize> = (0..height)
                    .filter(|&y| (x0..=x1).any(|x| mask[y * width + x]))
                    .collect();
                let (y0, y1) = (*rows.first()?, *rows.last()?);
                let glyph_height = y1 - y0 + 1;
                let glyph_width = x1 - x0 + 1;
                (glyph_height >= min_height && glyph_width <= glyph_height * 2)
                    .then_some((x0, y0, x1, y1))
            })
            .collect()
    }

    /// Downsample a glyph box onto the template grid
    fn sample(&self, mask: &[bool], width: usize, bbox: (usize, usize, usize, usize)) -> Vec<bool> {
        let (x0, y0, x1, y1) = bbox;
        let (w, h) = (x1 - x0 + 1, y1 - y0 + 1);
        let mut cells = Vec::with_capacity(self.grid_width * self.grid_height);

        for gy in 0..self.grid_height {
            let ys = y0 + gy * h / self.grid_height;
            let ye = (y0 + (gy + 1) * h / self.grid_height).max(ys + 1);
            for gx in 0..self.grid_width {
                let xs = x0 + gx * w / self.grid_width;
                let xe = (x0 + (gx + 1) * w / self.grid_width).max(xs + 1);

                let mut ink = 0usize;
                let mut total = 0usize;
                for y in ys..ye.min(y1 + 1) {
                    for x in xs..xe.min(x1 + 1) {
                        total += 1;
                        if mask[y * width + x] {
                            ink += 1;
                        }
                    }
                }
                cells.push(total > 0 && ink * 2 >= total);
            }
        }
        cells
    }

    fn classify(&self, cells: &[bool], charset: Option<&str>) -> Option<(char, f32)> {
        let allowed = |g: &&CompiledGlyph| charset.map_or(true, |set| set.contains(g.ch));
        let restricted = self.templates.iter().any(|g| allowed(&g));

        self.templates
            .iter()
            .filter(|g| !restricted || allowed(g))
            .map(|g| {
                let agree = g.cells.iter().zip(cells).filter(|(a, b)| a == b).count();
                (g.ch, agree as f32 / g.cells.len() as f32)
            })
            .fold(None, |best: Option<(char, f32)>, (ch, sim)| match best {
                Some((_, best_sim)) if best_sim >= sim => best,
                _ => Some((ch, sim)),
            })
    }
}

impl OcrEngine for RuleBasedOcrEngine {
    fn kind(&self) -> OcrEngineKind {
        OcrEngineKind::RuleBased
    }

    fn recognize(
        &self,
        image: &DynamicImage,
        hints: &RecognitionHints,
    ) -> Result<OcrResult, RecognitionError> {
        let gray = image.to_luma8();
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        if width == 0 || height == 0 {
            return Ok(OcrResult {
                text: String::new(),
                confidence: 0.0,
                engine: self.kind(),
            });
        }

        let mask = Self::binarize(&gray);
        let charset = hints.charset.as_deref();

        let mut text = String::new();
        let mut similarities = Vec::new();
        for bbox in Self::segment(&mask, width, height) {
            let cells = self.sample(&mask, width, bbox);
            if let Some((ch, similarity)) = self.classify(&cells, charset) {
                if similarity >= self.min_similarity {
                    text.push(ch);
                    similarities.push(similarity);
                }
            }
        }

        if let Some(grammar) = &hints.grammar {
            text = repair_confusions(&text, grammar, charset);
        }

        let confidence = if similarities.is_empty() {
            0.0
        } else {
            similarities.iter().sum::<f32>() / similarities.len() as f32
        };

        tracing::trace!(text = %text, glyphs = similarities.len(), "rule-based OCR finished");
        Ok(OcrResult {
            text,
            confidence,
            engine: self.kind(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{render, templates};
    use super::*;

    fn engine() -> RuleBasedOcrEngine {
        RuleBasedOcrEngine::from_templates(&templates(), 0.6).unwrap()
    }

    #[test]
    fn test_reads_rendered_plate() {
        let result = engine()
            .recognize(&render("A17L", 6), &RecognitionHints::default())
            .unwrap();
        assert_eq!(result.text, "A17L");
        assert!((result.confidence - 1.0).abs() < 1e-6);
        assert_eq!(result.engine, OcrEngineKind::RuleBased);
    }

    #[test]
    fn test_blank_crop_reads_nothing() {
        let blank = DynamicImage::ImageLuma8(GrayImage::from_pixel(60, 20, image::Luma([200u8])));
        let result = engine().recognize(&blank, &RecognitionHints::default()).unwrap();
        assert_eq!(result.text, "");
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_charset_restricts_templates() {
        // Without a restriction the square zero reads as '0'
        let unrestricted = engine()
            .recognize(&render("0", 6), &RecognitionHints::default())
            .unwrap();
        assert_eq!(unrestricted.text, "0");

        let hints = RecognitionHints {
            charset: Some("O17L".to_string()),
            ..RecognitionHints::default()
        };
        let restricted = engine().recognize(&render("0", 6), &hints).unwrap();
        assert_eq!(restricted.text, "O");
    }

    #[test]
    fn test_repair_confusions() {
        let uk = Regex::new(r"^(?:[A-Z]{2}[0-9]{2}[A-Z]{3})$").unwrap();
        assert_eq!(repair_confusions("A812CDE", &uk, None), "AB12CDE");
        assert_eq!(repair_confusions("AB12CDE", &uk, None), "AB12CDE");
        assert_eq!(repair_confusions("5O1ZCDE", &uk, None), "SO12CDE");
        // Nothing fits
        assert_eq!(repair_confusions("XYZ", &uk, None), "XYZ");
    }

    #[test]
    fn test_repair_respects_charset() {
        let grammar = Regex::new(r"^(?:[A-Z]{3})$").unwrap();
        assert_eq!(repair_confusions("AB0", &grammar, Some("ABC")), "AB0");
        assert_eq!(repair_confusions("AB0", &grammar, Some("ABO")), "ABO");
    }

    #[test]
    fn test_bad_templates_rejected() {
        let mut broken = templates();
        broken.glyphs.insert("XY".to_string(), vec!["###".to_string(); 5]);
        assert!(RuleBasedOcrEngine::from_templates(&broken, 0.6).is_err());

        let mut broken = templates();
        broken.glyphs.insert("X".to_string(), vec!["##".to_string(); 5]);
        assert!(RuleBasedOcrEngine::from_templates(&broken, 0.6).is_err());
    }

    #[test]
    fn test_missing_template_file_is_unavailable() {
        let config = RuleEngineConfig {
            templates_path: Some("/nonexistent/glyphs.json".to_string()),
            ..RuleEngineConfig::default()
        };
        assert!(matches!(
            RuleBasedOcrEngine::from_config(&config),
            Err(RecognitionError::EngineUnavailable { .. })
        ));
        assert!(RuleBasedOcrEngine::from_config(&RuleEngineConfig::default()).is_err());
    }

    #[test]
    fn test_templates_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_string(&templates()).unwrap()).unwrap();
        let config = RuleEngineConfig {
            templates_path: Some(file.path().display().to_string()),
            ..RuleEngineConfig::default()
        };
        let engine = RuleBasedOcrEngine::from_config(&config).unwrap();
        let result = engine
            .recognize(&render("HALL", 5), &RecognitionHints::default())
            .unwrap();
        assert_eq!(result.text, "HALL");
    }
}
