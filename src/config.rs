//! Engine configuration.
//!
//! Every tunable constant the engine uses lives here with its default, so a
//! caller can reproduce a run exactly by passing the same `EngineConfig`.

use crate::error::{CompressError, Result};
use crate::ladder::QualityLadder;

/// Options for standalone image recompression.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    /// Lossy presets, tried in order.
    pub ladder: QualityLadder,
    /// Longest allowed side after decode; larger images are downscaled once.
    pub max_dimension: u32,
    /// If the best lossy candidate is still at or above this share of the
    /// input, a lossless PNG encode is attempted.
    pub png_fallback_ratio: f64,
    /// A candidate replaces the input only below this share of its size.
    pub accept_ratio: f64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            ladder: QualityLadder::default(),
            max_dimension: 2048,
            png_fallback_ratio: 0.8,
            accept_ratio: 0.95,
        }
    }
}

/// Options for the PDF pipeline.
#[derive(Debug, Clone)]
pub struct PdfConfig {
    /// Embedded image spans at or below this many bytes are ignored.
    pub min_image_span: usize,
    /// Whole-document acceptance threshold.
    pub accept_ratio: f64,
    /// Per-image acceptance threshold for embedded images.
    pub embedded_accept_ratio: f64,
    /// Collapse blank lines and trailing whitespace outside stream bodies.
    pub normalize_whitespace: bool,
    /// Fall back to a lopdf load/prune/compress/save pass.
    pub object_rewrite: bool,
    /// Drop oversized image objects and duplicate metadata objects.
    /// May remove visible content.
    pub aggressive: bool,
    /// Body size above which the aggressive pass drops an image object.
    pub aggressive_object_ceiling: usize,
    /// Also recompress image signatures buried inside some other stream body.
    /// Signatures outside every stream are always taken.
    pub loose_image_spans: bool,
    /// Recompress embedded images on the rayon pool.
    pub parallel: bool,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            min_image_span: 1000,
            accept_ratio: 0.95,
            embedded_accept_ratio: 0.95,
            normalize_whitespace: true,
            object_rewrite: true,
            aggressive: false,
            aggressive_object_ceiling: 100_000,
            loose_image_spans: false,
            parallel: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub image: ImageConfig,
    pub pdf: PdfConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        check_ratio("image.png_fallback_ratio", self.image.png_fallback_ratio)?;
        check_ratio("image.accept_ratio", self.image.accept_ratio)?;
        check_ratio("pdf.accept_ratio", self.pdf.accept_ratio)?;
        check_ratio("pdf.embedded_accept_ratio", self.pdf.embedded_accept_ratio)?;

        if self.image.max_dimension == 0 {
            return Err(CompressError::InvalidConfig(
                "image.max_dimension must be positive".to_string(),
            ));
        }
        self.image.ladder.validate()
    }
}

fn check_ratio(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(CompressError::InvalidConfig(format!(
            "{} must be in (0, 1], got {}",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_ratio_above_one() {
        let mut config = EngineConfig::default();
        config.pdf.accept_ratio = 1.2;
        assert!(matches!(
            config.validate(),
            Err(CompressError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_zero_dimension() {
        let mut config = EngineConfig::default();
        config.image.max_dimension = 0;
        assert!(config.validate().is_err());
    }
}
