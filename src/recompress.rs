//! Image recompression: decode once, walk the quality ladder, keep the
//! smallest acceptable candidate.

use log::{debug, info};

use crate::codec::{self, RasterFormat, TargetFormat};
use crate::config::ImageConfig;
use crate::error::DecodeError;
use crate::ladder::{BestCandidate, CompressionCandidate, Encoding, QualityLadder};
use crate::progress::Monotonic;
use crate::select;
use crate::trim;

/// What a recompression run may do to a resource.
#[derive(Debug, Clone)]
pub struct Policy<'a> {
    pub ladder: &'a QualityLadder,
    pub max_dimension: Option<u32>,
    /// Try lossless PNG when the best lossy result is still at or above this
    /// share of the input. `None` disables the fallback.
    pub png_fallback_ratio: Option<f64>,
    pub accept_ratio: f64,
    /// Output must stay in the source format and keep its component layout.
    pub lock_format: bool,
    /// Offer a metadata-trimmed copy of the input before re-encoding.
    pub trim_first: bool,
}

impl<'a> Policy<'a> {
    /// Policy for a standalone image.
    pub fn standalone(config: &'a ImageConfig) -> Self {
        Self {
            ladder: &config.ladder,
            max_dimension: Some(config.max_dimension),
            png_fallback_ratio: Some(config.png_fallback_ratio),
            accept_ratio: config.accept_ratio,
            lock_format: false,
            trim_first: false,
        }
    }

    /// Policy for an image embedded in a container that records its format
    /// and dimensions elsewhere.
    pub fn embedded(ladder: &'a QualityLadder, accept_ratio: f64) -> Self {
        Self {
            ladder,
            max_dimension: None,
            png_fallback_ratio: None,
            accept_ratio,
            lock_format: true,
            trim_first: true,
        }
    }
}

/// Outcome of one recompression call.
#[derive(Debug)]
pub struct Recompressed {
    /// The retained candidate; `Encoding::Original` if nothing beat the input.
    pub candidate: CompressionCandidate,
    pub source_format: RasterFormat,
}

impl Recompressed {
    pub fn output_format(&self) -> RasterFormat {
        match self.candidate.encoding {
            Encoding::Jpeg { .. } => RasterFormat::Jpeg,
            Encoding::Png => RasterFormat::Png,
            Encoding::Original | Encoding::Trimmed => self.source_format,
        }
    }

    pub fn is_improved(&self) -> bool {
        self.candidate.encoding != Encoding::Original
    }
}

/// Recompresses `bytes`. Only a failure to decode is an error; failed
/// encodes are skipped.
pub fn recompress(
    bytes: &[u8],
    hint: Option<RasterFormat>,
    policy: &Policy<'_>,
    mut progress: Option<&mut Monotonic<'_>>,
) -> Result<Recompressed, DecodeError> {
    let mut report = |value: u8| {
        if let Some(p) = progress.as_deref_mut() {
            p.report(value);
        }
    };
    let original_len = bytes.len();
    report(20);

    let mut resource = codec::decode(bytes, hint)?;
    let source_format = resource.source_format();
    report(40);

    if let Some(max) = policy.max_dimension {
        resource.fit_within(max);
    }
    report(60);

    let max_dimension = policy.max_dimension;
    let mut best = BestCandidate::new(original_len);

    if policy.trim_first {
        let trimmed = match source_format {
            RasterFormat::Jpeg => trim::trim_jpeg(bytes),
            RasterFormat::Png => trim::trim_png(bytes),
            RasterFormat::Other(_) => None,
        };
        if let Some(data) = trimmed {
            best.offer(CompressionCandidate {
                data,
                encoding: Encoding::Trimmed,
                max_dimension: None,
            });
        }
    }

    let lossy_allowed = !resource.has_alpha()
        && (!policy.lock_format
            || (source_format == RasterFormat::Jpeg && codec::jpeg_components(bytes) != Some(4)));

    if lossy_allowed {
        let steps = policy.ladder.len();
        let ladder_report = policy.ladder.run(
            &mut best,
            |preset| {
                codec::encode(&resource, TargetFormat::Jpeg, preset.quality).map(|data| {
                    CompressionCandidate {
                        data,
                        encoding: Encoding::Jpeg {
                            quality: preset.quality,
                        },
                        max_dimension,
                    }
                })
            },
            |index| report_band(&mut progress, 60, 90, index + 1, steps),
        );
        if ladder_report.all_failed() {
            debug!("every ladder preset failed to encode");
        }
    }

    let png_allowed = if policy.lock_format {
        source_format == RasterFormat::Png
    } else {
        let weak_lossy = policy.png_fallback_ratio.map_or(false, |ratio| {
            best.best_len() as f64 >= original_len as f64 * ratio
        });
        resource.has_alpha() || (weak_lossy && source_format != RasterFormat::Png)
    };
    if png_allowed {
        match codec::encode(&resource, TargetFormat::Png, 0) {
            Ok(data) => {
                let len = data.len();
                if best.offer(CompressionCandidate {
                    data,
                    encoding: Encoding::Png,
                    max_dimension,
                }) {
                    debug!("PNG -> {} bytes (best so far)", len);
                }
            }
            Err(e) => debug!("PNG encode skipped: {}", e),
        }
    }
    report_band(&mut progress, 60, 90, 1, 1);

    let candidate = match best.into_inner() {
        Some(c) if select::accepts(original_len, c.len(), policy.accept_ratio) => {
            info!(
                "{} {} -> {} bytes ({:.1}% reduction)",
                c.encoding,
                original_len,
                c.len(),
                (1.0 - c.len() as f64 / original_len as f64) * 100.0
            );
            c
        }
        Some(c) => {
            debug!(
                "best candidate {} ({} bytes) is not a real gain over {} bytes, keeping original",
                c.encoding,
                c.len(),
                original_len
            );
            CompressionCandidate::original(bytes.to_vec())
        }
        None => CompressionCandidate::original(bytes.to_vec()),
    };

    Ok(Recompressed {
        candidate,
        source_format,
    })
}

fn report_band(progress: &mut Option<&mut Monotonic<'_>>, from: u8, to: u8, step: usize, total: usize) {
    if let Some(p) = progress.as_deref_mut() {
        p.report_within(from, to, step, total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn noisy(w: u32, h: u32) -> DynamicImage {
        let mut state: u32 = 0x1234_5678;
        DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let n = (state >> 24) as u8 / 4;
            Rgb([
                (x * 3) as u8 ^ n,
                (y * 5) as u8 ^ n,
                ((x + y) * 2) as u8 ^ n,
            ])
        }))
    }

    fn encoded(img: &DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn jpeg_at(img: &DynamicImage, quality: u8) -> Vec<u8> {
        let mut out = Vec::new();
        let rgb = img.to_rgb8();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
            .encode(rgb.as_raw(), rgb.width(), rgb.height(), image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    #[test]
    fn high_quality_jpeg_shrinks() {
        let config = ImageConfig::default();
        let input = jpeg_at(&noisy(96, 96), 100);
        let out = recompress(&input, Some(RasterFormat::Jpeg), &Policy::standalone(&config), None).unwrap();
        assert!(out.is_improved());
        assert!(matches!(out.candidate.encoding, Encoding::Jpeg { .. }));
        assert!((out.candidate.len() as f64) < input.len() as f64 * 0.95);
        assert_eq!(out.output_format(), RasterFormat::Jpeg);
    }

    #[test]
    fn undecodable_input_is_fatal() {
        let config = ImageConfig::default();
        let err = recompress(b"\xFF\xD8\xFF garbage", Some(RasterFormat::Jpeg), &Policy::standalone(&config), None);
        assert!(err.is_err());
    }

    #[test]
    fn tiny_png_comes_back_unchanged() {
        let config = ImageConfig::default();
        let input = encoded(&DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([200, 10, 10]))), ImageFormat::Png);
        let out = recompress(&input, Some(RasterFormat::Png), &Policy::standalone(&config), None).unwrap();
        assert!(!out.is_improved());
        assert_eq!(out.candidate.data, input);
    }

    #[test]
    fn alpha_images_never_become_jpeg() {
        let config = ImageConfig::default();
        let img = DynamicImage::ImageRgba8(RgbaImage::from_fn(64, 64, |x, y| {
            Rgba([x as u8, y as u8, 0, if (x + y) % 2 == 0 { 255 } else { 0 }])
        }));
        let input = encoded(&img, ImageFormat::Png);
        let out = recompress(&input, None, &Policy::standalone(&config), None).unwrap();
        assert!(!matches!(out.candidate.encoding, Encoding::Jpeg { .. }));
    }

    #[test]
    fn oversized_image_is_fitted_to_max_dimension() {
        let mut config = ImageConfig::default();
        config.max_dimension = 32;
        let input = jpeg_at(&noisy(128, 64), 95);
        let out = recompress(&input, None, &Policy::standalone(&config), None).unwrap();
        assert!(out.is_improved());
        let back = image::load_from_memory(&out.candidate.data).unwrap();
        assert_eq!((back.width(), back.height()), (32, 16));
        assert_eq!(out.candidate.max_dimension, Some(32));
    }

    #[test]
    fn embedded_policy_keeps_jpeg_format_and_size() {
        let ladder = QualityLadder::default();
        let input = jpeg_at(&noisy(80, 40), 100);
        let out = recompress(&input, Some(RasterFormat::Jpeg), &Policy::embedded(&ladder, 0.95), None).unwrap();
        assert_eq!(out.output_format(), RasterFormat::Jpeg);
        let back = image::load_from_memory(&out.candidate.data).unwrap();
        assert_eq!((back.width(), back.height()), (80, 40));
    }

    #[test]
    fn progress_is_monotonic_and_bounded() {
        let config = ImageConfig::default();
        let input = jpeg_at(&noisy(32, 32), 90);
        let mut seen = Vec::new();
        {
            let mut sink = |v: u8| seen.push(v);
            let mut progress = Monotonic::new(&mut sink);
            recompress(&input, None, &Policy::standalone(&config), Some(&mut progress)).unwrap();
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.first(), Some(&20));
        assert_eq!(seen.last(), Some(&90));
    }
}
