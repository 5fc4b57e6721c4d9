//! Region preprocessing applied to a cropped candidate before OCR.

use image::{imageops::FilterType, DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};

/// Options recognized by a [`RegionPreprocessor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhanceConfig {
    /// Upscale factor applied when no fixed target size is set
    #[serde(default = "default_resize_factor")]
    pub resize_factor: f32,

    /// Histogram equalisation
    #[serde(default = "default_true")]
    pub apply_contrast_enhancement: bool,

    /// 3x3 median filter
    #[serde(default = "default_true")]
    pub apply_noise_reduction: bool,

    /// Trim flat borders left around the plate by the detector
    #[serde(default)]
    pub apply_perspective_correction: bool,

    #[serde(default)]
    pub target_width: Option<u32>,

    #[serde(default)]
    pub target_height: Option<u32>,
}

fn default_resize_factor() -> f32 {
    2.0
}

fn default_true() -> bool {
    true
}

impl Default for EnhanceConfig {
    fn default() -> Self {
        Self {
            resize_factor: default_resize_factor(),
            apply_contrast_enhancement: true,
            apply_noise_reduction: true,
            apply_perspective_correction: false,
            target_width: None,
            target_height: None,
        }
    }
}

/// Region-specific overrides carried by a region definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreprocessHints {
    #[serde(default)]
    pub resize_factor: Option<f32>,

    #[serde(default)]
    pub contrast_enhancement: Option<bool>,
}

impl EnhanceConfig {
    /// Copy of this config with region hints applied on top
    pub fn with_hints(&self, hints: &PreprocessHints) -> Self {
        let mut merged = self.clone();
        if let Some(factor) = hints.resize_factor {
            merged.resize_factor = factor;
        }
        if let Some(contrast) = hints.contrast_enhancement {
            merged.apply_contrast_enhancement = contrast;
        }
        merged
    }
}

/// Normalizes a cropped plate region before it reaches the OCR engines
pub trait RegionPreprocessor: Send + Sync {
    fn enhance(&self, image: &DynamicImage, config: &EnhanceConfig) -> DynamicImage;
}

/// Default grayscale enhancer built on `imageproc`
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageEnhancer;

/// Rows/columns with an intensity range below this count as flat border
const FLAT_RANGE: u8 = 32;

impl ImageEnhancer {
    pub fn new() -> Self {
        Self
    }

    fn trim_flat_border(gray: &GrayImage) -> GrayImage {
        let (width, height) = gray.dimensions();
        let row_has_content = |y: u32| {
            let (lo, hi) = (0..width).fold((u8::MAX, 0u8), |(lo, hi), x| {
                let v = gray.get_pixel(x, y)[0];
                (lo.min(v), hi.max(v))
            });
            hi.saturating_sub(lo) > FLAT_RANGE
        };
        let col_has_content = |x: u32| {
            let (lo, hi) = (0..height).fold((u8::MAX, 0u8), |(lo, hi), y| {
                let v = gray.get_pixel(x, y)[0];
                (lo.min(v), hi.max(v))
            });
            hi.saturating_sub(lo) > FLAT_RANGE
        };

        let rows: Vec<u32> = (0..height).filter(|&y| row_has_content(y)).collect();
        let cols: Vec<u32> = (0..width).filter(|&x| col_has_content(x)).collect();

        match (rows.first(), rows.last(), cols.first(), cols.last()) {
            (Some(&top), Some(&bottom), Some(&left), Some(&right)) => {
                image::imageops::crop_imm(gray, left, top, right - left + 1, bottom - top + 1)
                    .to_image()
            }
            _ => gray.clone(),
        }
    }
}

impl RegionPreprocessor for ImageEnhancer {
    fn enhance(&self, image: &DynamicImage, config: &EnhanceConfig) -> DynamicImage {
        let mut gray = image.to_luma8();
        if gray.width() == 0 || gray.height() == 0 {
            return DynamicImage::ImageLuma8(gray);
        }

        if config.apply_perspective_correction {
            gray = Self::trim_flat_border(&gray);
        }

        if config.apply_noise_reduction {
            gray = imageproc::filter::median_filter(&gray, 1, 1);
        }

        if config.apply_contrast_enhancement {
            gray = imageproc::contrast::equalize_histogram(&gray);
        }

        let (width, height) = match (config.target_width, config.target_height) {
            (Some(w), Some(h)) => (w, h),
            (Some(w), None) => {
                let h = (gray.height() as f32 * w as f32 / gray.width() as f32).round() as u32;
                (w, h)
            }
            (None, Some(h)) => {
                let w = (gray.width() as f32 * h as f32 / gray.height() as f32).round() as u32;
                (w, h)
            }
            (None, None) => {
                let factor = config.resize_factor.max(0.1);
                (
                    (gray.width() as f32 * factor).round() as u32,
                    (gray.height() as f32 * factor).round() as u32,
                )
            }
        };

        let (width, height) = (width.max(1), height.max(1));
        if (width, height) != gray.dimensions() {
            gray = image::imageops::resize(&gray, width, height, FilterType::Lanczos3);
        }

        DynamicImage::ImageLuma8(gray)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    fn plate_like(width: u32, height: u32) -> DynamicImage {
        let mut img = GrayImage::from_pixel(width, height, Luma([200u8]));
        for x in (width / 4)..(width / 2) {
            for y in (height / 4)..(3 * height / 4) {
                img.put_pixel(x, y, Luma([20u8]));
            }
        }
        DynamicImage::ImageLuma8(img)
    }

    #[test]
    fn test_resize_factor() {
        let enhancer = ImageEnhancer::new();
        let out = enhancer.enhance(&plate_like(40, 10), &EnhanceConfig::default());
        assert_eq!(out.width(), 80);
        assert_eq!(out.height(), 20);
    }

    #[test]
    fn test_fixed_target_size() {
        let enhancer = ImageEnhancer::new();
        let config = EnhanceConfig {
            target_width: Some(200),
            target_height: Some(64),
            ..EnhanceConfig::default()
        };
        let out = enhancer.enhance(&plate_like(50, 20), &config);
        assert_eq!((out.width(), out.height()), (200, 64));
    }

    #[test]
    fn test_border_trim() {
        let mut img = GrayImage::from_pixel(60, 30, Luma([120u8]));
        for x in 20..40 {
            for y in 10..20 {
                img.put_pixel(x, y, Luma([250u8]));
            }
        }
        let trimmed = ImageEnhancer::trim_flat_border(&img);
        assert_eq!(trimmed.dimensions(), (20, 10));
    }

    #[test]
    fn test_hints_override() {
        let hints = PreprocessHints {
            resize_factor: Some(3.0),
            contrast_enhancement: Some(false),
        };
        let merged = EnhanceConfig::default().with_hints(&hints);
        assert_eq!(merged.resize_factor, 3.0);
        assert!(!merged.apply_contrast_enhancement);
        assert!(merged.apply_noise_reduction);
    }

    #[test]
    fn test_empty_image() {
        let enhancer = ImageEnhancer::new();
        let out = enhancer.enhance(
            &DynamicImage::ImageLuma8(GrayImage::new(0, 0)),
            &EnhanceConfig::default(),
        );
        assert_eq!(out.width(), 0);
    }
}
