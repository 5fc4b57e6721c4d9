//! Region-specific plate grammars and character sets.
//!
//! The built-in grammars are illustrative; deployments are expected to supply
//! a `regions_file` validated against real plates of their area.

use crate::config::RegionalConfig;
use crate::preprocess::PreprocessHints;
use crate::text::clean_plate_text;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

const ALNUM: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// One entry of the region table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDefinition {
    pub code: String,
    pub name: String,

    /// Characters that can appear on a plate of this region
    pub charset: String,

    /// Plate grammar; matched against the whole cleaned text
    pub format: String,

    pub min_length: usize,
    pub max_length: usize,

    #[serde(default)]
    pub preprocessing: PreprocessHints,
}

impl RegionDefinition {
    fn new(code: &str, name: &str, charset: &str, format: &str, min: usize, max: usize) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            charset: charset.to_string(),
            format: format.to_string(),
            min_length: min,
            max_length: max,
            preprocessing: PreprocessHints::default(),
        }
    }
}

fn builtin_regions() -> Vec<RegionDefinition> {
    let mut uk = RegionDefinition::new(
        "UK",
        "United Kingdom",
        "ABCDEFGHJKLMNOPRSTUVWXYZ0123456789",
        r"[A-Z]{2}[0-9]{2}[A-Z]{3}",
        7,
        7,
    );
    uk.preprocessing.contrast_enhancement = Some(true);

    let mut india = RegionDefinition::new(
        "IN",
        "India",
        ALNUM,
        r"[A-Z]{2}[0-9]{1,2}[A-Z]{1,3}[0-9]{4}",
        8,
        10,
    );
    india.preprocessing.resize_factor = Some(2.5);

    vec![
        uk,
        RegionDefinition::new(
            "BR",
            "Brazil (Mercosur)",
            ALNUM,
            r"[A-Z]{3}[0-9][A-Z0-9][0-9]{2}",
            7,
            7,
        ),
        india,
        RegionDefinition::new(
            "DE",
            "Germany",
            "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
            r"[A-Z]{1,3}[A-Z]{1,2}[0-9]{1,4}[EH]?",
            4,
            8,
        ),
        RegionDefinition::new("US", "United States", ALNUM, r"[A-Z0-9]{4,8}", 4, 8),
        RegionDefinition::new(
            "EU",
            "European Union (generic)",
            ALNUM,
            r"[A-Z0-9]{4,9}",
            4,
            9,
        ),
        RegionDefinition::new("GENERIC", "Generic", ALNUM, r"[A-Z0-9]{4,10}", 4, 10),
    ]
}

#[derive(Debug, Clone)]
struct CompiledRegion {
    definition: RegionDefinition,
    pattern: Regex,
}

impl CompiledRegion {
    fn compile(definition: RegionDefinition) -> Result<Self> {
        let pattern = Regex::new(&format!("^(?:{})$", definition.format))
            .with_context(|| format!("Invalid plate format for region {}", definition.code))?;
        Ok(Self {
            definition,
            pattern,
        })
    }

    fn matches(&self, text: &str) -> bool {
        let len = text.chars().count();
        len >= self.definition.min_length
            && len <= self.definition.max_length
            && self.pattern.is_match(text)
    }
}

/// Table of region definitions plus the currently active region
#[derive(Debug, Clone)]
pub struct RegionalAdapter {
    regions: Vec<CompiledRegion>,
    active: String,
    default_region: String,
}

impl RegionalAdapter {
    pub fn new(
        definitions: Vec<RegionDefinition>,
        active: &str,
        default_region: &str,
    ) -> Result<Self> {
        let regions = definitions
            .into_iter()
            .map(CompiledRegion::compile)
            .collect::<Result<Vec<_>>>()?;

        let mut adapter = Self {
            regions,
            active: default_region.to_uppercase(),
            default_region: default_region.to_uppercase(),
        };
        if adapter.find(&adapter.default_region).is_none() {
            anyhow::bail!("Default region '{}' is not defined", default_region);
        }
        adapter.set_region(active);
        Ok(adapter)
    }

    /// Built-in table with `US` active
    pub fn builtin() -> Self {
        let regions = builtin_regions()
            .into_iter()
            .filter_map(|d| CompiledRegion::compile(d).ok())
            .collect();
        Self {
            regions,
            active: "US".to_string(),
            default_region: "US".to_string(),
        }
    }

    /// Built-in table, merged with the optional regions file, with the
    /// configured grammar override and active region applied
    pub fn from_config(config: &RegionalConfig) -> Result<Self> {
        let mut definitions = builtin_regions();

        if let Some(path) = &config.regions_file {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read regions file {}", path))?;
            let external: Vec<RegionDefinition> = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid regions file {}", path))?;
            info!(path = %path, regions = external.len(), "loaded region table");

            for region in external {
                match definitions.iter_mut().find(|d| d.code == region.code) {
                    Some(existing) => *existing = region,
                    None => definitions.push(region),
                }
            }
        }

        if let Some(format) = &config.plate_format {
            let code = config.country_code.to_uppercase();
            if let Some(active) = definitions.iter_mut().find(|d| d.code == code) {
                active.format = format.clone();
            }
        }

        Self::new(definitions, &config.country_code, &config.default_region)
    }

    fn find(&self, code: &str) -> Option<&CompiledRegion> {
        self.regions
            .iter()
            .find(|r| r.definition.code.eq_ignore_ascii_case(code))
    }

    fn resolve(&self, region: Option<&str>) -> Option<&CompiledRegion> {
        self.find(region.unwrap_or(&self.active))
    }

    /// Switch the active region; unknown codes fall back to the default region
    pub fn set_region(&mut self, code: &str) -> &str {
        match self.find(code) {
            Some(region) => {
                self.active = region.definition.code.clone();
            }
            None => {
                warn!(
                    requested = %code,
                    fallback = %self.default_region,
                    "unknown region, using default"
                );
                self.active = self.default_region.clone();
            }
        }
        &self.active
    }

    pub fn active_code(&self) -> &str {
        &self.active
    }

    pub fn active(&self) -> Option<&RegionDefinition> {
        self.find(&self.active).map(|r| &r.definition)
    }

    pub fn region(&self, code: &str) -> Option<&RegionDefinition> {
        self.find(code).map(|r| &r.definition)
    }

    /// Region codes in table order
    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.regions.iter().map(|r| r.definition.code.as_str())
    }

    /// Length bounds and grammar check against `region` (active when None)
    pub fn validate_format(&self, text: &str, region: Option<&str>) -> bool {
        self.resolve(region).is_some_and(|r| r.matches(text))
    }

    /// Clean `text` and drop characters outside the region's character set
    pub fn normalize(&self, text: &str, region: Option<&str>) -> String {
        let cleaned = clean_plate_text(text);
        match self.resolve(region) {
            Some(r) => cleaned
                .chars()
                .filter(|c| r.definition.charset.contains(*c))
                .collect(),
            None => cleaned,
        }
    }

    /// First region (table order) whose grammar the cleaned text satisfies
    pub fn detect_region_from_text(&self, text: &str) -> Option<&str> {
        let cleaned = clean_plate_text(text);
        self.regions
            .iter()
            .find(|r| r.matches(&cleaned))
            .map(|r| r.definition.code.as_str())
    }

    /// Compiled grammar of a region, for engines that repair against it
    pub fn grammar(&self, region: Option<&str>) -> Option<&Regex> {
        self.resolve(region).map(|r| &r.pattern)
    }

    /// Active region first, then the rest in table order
    fn attempt_order(&self) -> Vec<&RegionDefinition> {
        let mut order: Vec<&RegionDefinition> = Vec::with_capacity(self.regions.len());
        if let Some(active) = self.active() {
            order.push(active);
        }
        order.extend(
            self.regions
                .iter()
                .map(|r| &r.definition)
                .filter(|d| d.code != self.active),
        );
        order
    }
}

/// Result of a dynamic region search
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchOutcome<T> {
    /// Normalized, grammar-valid text; empty when no region accepted it
    pub text: String,
    pub region: Option<String>,
    /// Whatever the attempt returned alongside the winning text
    pub payload: Option<T>,
}

/// Retries recognition region by region until one grammar accepts the text
#[derive(Debug, Clone, Copy)]
pub struct DynamicSwitcher {
    max_regions: usize,
}

impl Default for DynamicSwitcher {
    fn default() -> Self {
        Self {
            max_regions: usize::MAX,
        }
    }
}

impl DynamicSwitcher {
    pub fn new(max_regions: usize) -> Self {
        Self {
            max_regions: max_regions.max(1),
        }
    }

    /// `attempt` runs OCR with a region's settings and returns the raw text
    /// plus a payload (typically the arbitrated result).
    pub fn recognize<T, F>(&self, adapter: &RegionalAdapter, mut attempt: F) -> SwitchOutcome<T>
    where
        F: FnMut(&RegionDefinition) -> Option<(String, T)>,
    {
        for region in adapter.attempt_order().into_iter().take(self.max_regions) {
            let Some((raw, payload)) = attempt(region) else {
                debug!(region = %region.code, "no text from OCR attempt");
                continue;
            };

            let text = adapter.normalize(&raw, Some(&region.code));
            if adapter.validate_format(&text, Some(&region.code)) {
                if region.code != adapter.active_code() {
                    debug!(
                        region = %region.code,
                        active = %adapter.active_code(),
                        text = %text,
                        "plate matched after region switch"
                    );
                }
                return SwitchOutcome {
                    text,
                    region: Some(region.code.clone()),
                    payload: Some(payload),
                };
            }
        }

        SwitchOutcome {
            text: String::new(),
            region: None,
            payload: None,
        }
    }
}
