//! Size reduction for PDF documents and raster images.
//!
//! Every entry point returns either a smaller buffer that still decodes to
//! equivalent content or the input unchanged, byte for byte.

pub mod codec;
pub mod config;
pub mod error;
pub mod ladder;
pub mod pdf;
pub mod progress;
pub mod recompress;
pub mod scanner;
pub mod select;
pub mod trim;
pub mod wasm;

use log::info;

pub use codec::RasterFormat;
pub use config::{EngineConfig, ImageConfig, PdfConfig};
pub use error::{CompressError, DecodeError, EncodeError, Result};
pub use pdf::strategy::StrategyKind;
pub use progress::{Monotonic, NoProgress, ProgressSink};

use recompress::{recompress, Policy};

/// PDF-only figures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdfStats {
    /// Page objects in the input.
    pub page_count: usize,
    /// Embedded images that decoded and were evaluated.
    pub processed_pages: usize,
    /// Strategy whose output was kept; `None` when the input came back.
    pub strategy: Option<StrategyKind>,
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub data: Vec<u8>,
    pub original_size: usize,
    pub compressed_size: usize,
    /// `compressed_size / original_size`, 1.0 for an empty original.
    pub compression_ratio: f64,
    /// Output raster format for images; `None` for PDFs.
    pub format: Option<RasterFormat>,
    pub pdf: Option<PdfStats>,
}

impl CompressionResult {
    fn new(original_size: usize, data: Vec<u8>, format: Option<RasterFormat>, pdf: Option<PdfStats>) -> Self {
        let compressed_size = data.len();
        let compression_ratio = if original_size == 0 {
            1.0
        } else {
            compressed_size as f64 / original_size as f64
        };
        Self {
            data,
            original_size,
            compressed_size,
            compression_ratio,
            format,
            pdf,
        }
    }

    /// True if `data` differs from the input.
    pub fn is_reduced(&self) -> bool {
        self.compressed_size < self.original_size
    }
}

fn require_content(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        Err(CompressError::InvalidInput("empty buffer".to_string()))
    } else {
        Ok(())
    }
}

/// Compresses a PDF with the default configuration.
pub fn compress_pdf(bytes: &[u8], progress: &mut impl ProgressSink) -> Result<CompressionResult> {
    compress_pdf_with_config(bytes, &EngineConfig::default(), progress)
}

/// Compresses a PDF. Input without the `%PDF` magic is returned unchanged.
pub fn compress_pdf_with_config(
    bytes: &[u8],
    config: &EngineConfig,
    progress: &mut impl ProgressSink,
) -> Result<CompressionResult> {
    require_content(bytes)?;
    config.validate()?;
    let mut progress = Monotonic::new(progress);

    if !pdf::is_pdf(bytes) {
        info!("no PDF header, returning input unchanged");
        progress.finish();
        let stats = PdfStats {
            page_count: 0,
            processed_pages: 0,
            strategy: None,
        };
        return Ok(CompressionResult::new(bytes.len(), bytes.to_vec(), None, Some(stats)));
    }
    progress.report(10);

    let page_count = pdf::page_count(bytes);
    let outcome = pdf::strategy::run(bytes, config, &mut progress);
    let data = select::select(bytes, &outcome.data, config.pdf.accept_ratio).to_vec();
    progress.finish();

    info!(
        "PDF: {} pages, {} images evaluated, {} -> {} bytes",
        page_count,
        outcome.processed,
        bytes.len(),
        data.len()
    );
    let stats = PdfStats {
        page_count,
        processed_pages: outcome.processed,
        strategy: outcome.accepted,
    };
    Ok(CompressionResult::new(bytes.len(), data, None, Some(stats)))
}

/// Compresses a standalone raster image with the default configuration.
pub fn compress_image(bytes: &[u8], mime_hint: &str, progress: &mut impl ProgressSink) -> Result<CompressionResult> {
    compress_image_with_config(bytes, mime_hint, &EngineConfig::default(), progress)
}

/// Compresses a standalone raster image. `mime_hint` may be empty or
/// generic, in which case the format is sniffed.
pub fn compress_image_with_config(
    bytes: &[u8],
    mime_hint: &str,
    config: &EngineConfig,
    progress: &mut impl ProgressSink,
) -> Result<CompressionResult> {
    require_content(bytes)?;
    config.validate()?;
    let mut progress = Monotonic::new(progress);

    let hint = RasterFormat::from_mime(mime_hint);
    let policy = Policy::standalone(&config.image);
    let outcome = recompress(bytes, hint, &policy, Some(&mut progress))?;
    progress.finish();

    let format = outcome.output_format();
    Ok(CompressionResult::new(bytes.len(), outcome.candidate.data, Some(format), None))
}

/// Routes to the PDF or image path: `%PDF` at offset 0 is a PDF, anything
/// with an image MIME hint or image signature is an image.
pub fn compress(bytes: &[u8], mime_hint: &str, progress: &mut impl ProgressSink) -> Result<CompressionResult> {
    compress_with_config(bytes, mime_hint, &EngineConfig::default(), progress)
}

pub fn compress_with_config(
    bytes: &[u8],
    mime_hint: &str,
    config: &EngineConfig,
    progress: &mut impl ProgressSink,
) -> Result<CompressionResult> {
    require_content(bytes)?;
    if pdf::is_pdf(bytes) {
        return compress_pdf_with_config(bytes, config, progress);
    }
    if RasterFormat::from_mime(mime_hint).is_some() || RasterFormat::sniff(bytes).is_some() {
        return compress_image_with_config(bytes, mime_hint, config, progress);
    }
    Err(CompressError::InvalidInput(
        "neither a PDF nor a recognised image".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_rejected() {
        assert!(matches!(
            compress_pdf(&[], &mut NoProgress),
            Err(CompressError::InvalidInput(_))
        ));
        assert!(matches!(
            compress_image(&[], "image/png", &mut NoProgress),
            Err(CompressError::InvalidInput(_))
        ));
    }

    #[test]
    fn unknown_bytes_are_rejected_by_dispatcher() {
        assert!(matches!(
            compress(b"plain text", "", &mut NoProgress),
            Err(CompressError::InvalidInput(_))
        ));
    }

    #[test]
    fn invalid_config_is_reported() {
        let mut config = EngineConfig::default();
        config.pdf.accept_ratio = 1.5;
        assert!(matches!(
            compress_pdf_with_config(b"%PDF-1.4", &config, &mut NoProgress),
            Err(CompressError::InvalidConfig(_))
        ));
    }

    #[test]
    fn ratio_of_unchanged_output_is_one() {
        let result = compress_pdf(b"not a pdf", &mut NoProgress).unwrap();
        assert_eq!(result.data, b"not a pdf");
        assert_eq!(result.compression_ratio, 1.0);
        assert!(!result.is_reduced());
    }
}
