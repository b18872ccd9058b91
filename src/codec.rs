//! Raster decode/encode on top of the `image` crate.

use std::fmt;
use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{ColorType, DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat};
use log::debug;

use crate::error::{DecodeError, EncodeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RasterFormat {
    Jpeg,
    Png,
    /// Anything else the `image` crate can read. Never an encode target.
    Other(ImageFormat),
}

impl RasterFormat {
    fn from_image_format(format: ImageFormat) -> Self {
        match format {
            ImageFormat::Jpeg => RasterFormat::Jpeg,
            ImageFormat::Png => RasterFormat::Png,
            other => RasterFormat::Other(other),
        }
    }

    fn image_format(self) -> ImageFormat {
        match self {
            RasterFormat::Jpeg => ImageFormat::Jpeg,
            RasterFormat::Png => ImageFormat::Png,
            RasterFormat::Other(f) => f,
        }
    }

    /// Interprets a MIME hint. Generic or unknown hints give `None`.
    pub fn from_mime(hint: &str) -> Option<Self> {
        let hint = hint.trim().to_ascii_lowercase();
        if hint.contains("jpeg") || hint.contains("jpg") {
            return Some(RasterFormat::Jpeg);
        }
        if hint.contains("png") {
            return Some(RasterFormat::Png);
        }
        ImageFormat::from_mime_type(&hint).map(Self::from_image_format)
    }

    /// Identifies the format from leading signature bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        image::guess_format(bytes).ok().map(Self::from_image_format)
    }

    pub fn mime_type(self) -> &'static str {
        self.image_format().to_mime_type()
    }
}

impl fmt::Display for RasterFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RasterFormat::Jpeg => write!(f, "JPEG"),
            RasterFormat::Png => write!(f, "PNG"),
            RasterFormat::Other(format) => write!(f, "{:?}", format),
        }
    }
}

/// Lossy or lossless encode target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetFormat {
    Jpeg,
    Png,
}

/// A decoded raster image. Owned by one recompression call.
#[derive(Debug)]
pub struct ImageResource {
    image: DynamicImage,
    source_format: RasterFormat,
    resized: bool,
}

impl ImageResource {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn color(&self) -> ColorType {
        self.image.color()
    }

    pub fn has_alpha(&self) -> bool {
        self.image.color().has_alpha()
    }

    pub fn source_format(&self) -> RasterFormat {
        self.source_format
    }

    /// Downscales so neither side exceeds `max_dim`, keeping the aspect
    /// ratio. Only the first call on a resource can resize. Returns true if
    /// the pixels changed.
    pub fn fit_within(&mut self, max_dim: u32) -> bool {
        if self.resized {
            return false;
        }
        self.resized = true;
        let (w, h) = self.image.dimensions();
        if w <= max_dim && h <= max_dim {
            return false;
        }
        self.image = self.image.resize(max_dim, max_dim, FilterType::Lanczos3);
        debug!(
            "resize {}x{} -> {}x{}",
            w,
            h,
            self.image.width(),
            self.image.height()
        );
        true
    }
}

/// Decodes `bytes`, trying the hinted format first and falling back to
/// signature sniffing.
pub fn decode(bytes: &[u8], hint: Option<RasterFormat>) -> Result<ImageResource, DecodeError> {
    let sniffed = RasterFormat::sniff(bytes);
    let first = hint.or(sniffed).ok_or(DecodeError::UnsupportedFormat)?;

    let decoded = match decode_as(bytes, first) {
        Ok(image) => (image, first),
        Err(err) => match sniffed.filter(|s| *s != first) {
            Some(alt) => (decode_as(bytes, alt).map_err(|_| err)?, alt),
            None => return Err(err),
        },
    };

    let (image, source_format) = decoded;
    if image.width() == 0 || image.height() == 0 {
        return Err(DecodeError::EmptyImage);
    }
    Ok(ImageResource {
        image,
        source_format,
        resized: false,
    })
}

fn decode_as(bytes: &[u8], format: RasterFormat) -> Result<DynamicImage, DecodeError> {
    image::load_from_memory_with_format(bytes, format.image_format())
        .map_err(|source| DecodeError::Malformed { format, source })
}

/// Encodes `resource` as `target`. `quality` applies to JPEG only and must
/// be in `1..=100`; PNG output is lossless.
pub fn encode(resource: &ImageResource, target: TargetFormat, quality: u8) -> Result<Vec<u8>, EncodeError> {
    encode_image(&resource.image, target, quality)
}

/// Same as [`encode`] for pixels that did not come from an encoded buffer.
pub fn encode_image(img: &DynamicImage, target: TargetFormat, quality: u8) -> Result<Vec<u8>, EncodeError> {
    match target {
        TargetFormat::Jpeg => encode_jpeg(img, quality),
        TargetFormat::Png => encode_png(img),
    }
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if !(1..=100).contains(&quality) {
        return Err(EncodeError::QualityOutOfRange(quality));
    }
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality);
    match img.color() {
        ColorType::L8 | ColorType::L16 | ColorType::La8 | ColorType::La16 => {
            let gray = img.to_luma8();
            encoder.encode(gray.as_raw(), gray.width(), gray.height(), ExtendedColorType::L8)?;
        }
        _ => {
            let rgb = img.to_rgb8();
            encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)?;
        }
    }
    Ok(buffer)
}

fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, EncodeError> {
    let converted;
    let img = match img.color() {
        ColorType::Rgb32F | ColorType::Rgba32F => {
            converted = DynamicImage::ImageRgba8(img.to_rgba8());
            &converted
        }
        _ => img,
    };
    let mut buffer = Cursor::new(Vec::new());
    let encoder = PngEncoder::new_with_quality(&mut buffer, CompressionType::Best, PngFilter::Adaptive);
    encoder.write_image(img.as_bytes(), img.width(), img.height(), img.color().into())?;
    Ok(buffer.into_inner())
}

/// Number of colour components declared in a JPEG's frame header.
pub fn jpeg_components(bytes: &[u8]) -> Option<u8> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut pos = 2;
    loop {
        if *bytes.get(pos)? != 0xFF {
            return None;
        }
        while bytes.get(pos) == Some(&0xFF) {
            pos += 1;
        }
        let marker = *bytes.get(pos)?;
        pos += 1;
        if matches!(marker, 0x01 | 0xD0..=0xD7) {
            continue;
        }
        if matches!(marker, 0xD9 | 0xDA) {
            return None;
        }
        let seg = bytes.get(pos..pos + 2)?;
        let seg_len = u16::from_be_bytes([seg[0], seg[1]]) as usize;
        let is_frame = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_frame {
            // length(2) precision(1) height(2) width(2) components(1)
            return bytes.get(pos + 7).copied();
        }
        pos += seg_len.max(2);
    }
}
