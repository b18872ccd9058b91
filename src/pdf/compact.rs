//! Structural compaction: embedded image recompression, metadata removal and
//! whitespace cleanup, each stage producing the next buffer generation.

use std::panic::{self, AssertUnwindSafe};

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::codec::RasterFormat;
use crate::config::PdfConfig;
use crate::error::Result;
use crate::ladder::QualityLadder;
use crate::pdf::xref::{self, LengthField};
use crate::pdf::{self, apply_edits, metadata, object_headers, Edit};
use crate::progress::Monotonic;
use crate::recompress::{recompress, Policy, Recompressed};
use crate::scanner::{self, ByteSpan, ImageKind, ImageSpans, ProtectedRegions, StreamBodies, PNG_SIGNATURE};

#[derive(Debug)]
pub struct Compacted {
    pub data: Vec<u8>,
    /// Embedded images that decoded and were evaluated.
    pub processed: usize,
    /// Embedded images replaced by a smaller encoding.
    pub replaced: usize,
}

/// An embedded image eligible for recompression.
#[derive(Debug, Clone)]
struct ImageTarget {
    kind: ImageKind,
    span: ByteSpan,
    /// `None` for loose spans and for streams that declare no length.
    length: Option<LengthField>,
}

impl ImageTarget {
    fn hint(&self) -> RasterFormat {
        match self.kind {
            ImageKind::Jpeg => RasterFormat::Jpeg,
            ImageKind::Png => RasterFormat::Png,
        }
    }
}

/// Runs stages 1 to 3. Input without the PDF magic comes back unchanged.
pub fn compact(
    buf: &[u8],
    config: &PdfConfig,
    ladder: &QualityLadder,
    progress: &mut Monotonic<'_>,
) -> Result<Compacted> {
    if !pdf::is_pdf(buf) {
        return Ok(Compacted {
            data: buf.to_vec(),
            processed: 0,
            replaced: 0,
        });
    }

    let targets = find_targets(buf, config);
    progress.report(20);
    debug!("{} embedded image candidates", targets.len());

    let (data, processed, replaced) = recompress_images(buf, &targets, config, ladder)?;
    progress.report(50);
    info!(
        "images: {} evaluated, {} replaced, {} -> {} bytes",
        processed,
        replaced,
        buf.len(),
        data.len()
    );

    let data = metadata::strip(&data)?;
    progress.report(70);

    let data = if config.normalize_whitespace {
        normalize_whitespace(&data)
    } else {
        data
    };
    progress.report(90);

    Ok(Compacted {
        data,
        processed,
        replaced,
    })
}

/// Whole stream bodies holding an image, plus raster signatures that sit
/// outside every stream. Signatures buried inside some other stream body are
/// only taken when `loose_image_spans` is set.
fn find_targets(buf: &[u8], config: &PdfConfig) -> Vec<ImageTarget> {
    let regions = ProtectedRegions::scan(buf);
    let headers = object_headers(buf, &regions);
    let bodies: Vec<ByteSpan> = StreamBodies::new(buf, 0).collect();
    let mut targets: Vec<ImageTarget> = bodies
        .iter()
        .enumerate()
        .filter_map(|(i, &body)| {
            let floor = i.checked_sub(1).map_or(0, |prev| bodies[prev].end);
            stream_image(buf, body, floor, &headers, config.min_image_span)
        })
        .collect();

    let loose: Vec<ImageTarget> = ImageSpans::new(buf, 0, config.min_image_span)
        .filter(|(_, span)| !targets.iter().any(|t| t.span.overlaps(span)))
        .filter(|(_, span)| config.loose_image_spans || !bodies.iter().any(|b| b.overlaps(span)))
        .map(|(kind, span)| ImageTarget {
            kind,
            span,
            length: None,
        })
        .collect();
    if !loose.is_empty() {
        debug!("{} loose image spans", loose.len());
        targets.extend(loose);
        targets.sort_by_key(|t| t.span.start);
    }
    targets
}

/// The image filling `body`, if the stream declares a filter that matches it
/// and any `/Length` it declares can be kept in step. `floor` bounds the
/// backwards search for the stream dictionary when no object header precedes
/// the keyword.
fn stream_image(
    buf: &[u8],
    body: ByteSpan,
    floor: usize,
    headers: &[pdf::ObjectHeader],
    min_len: usize,
) -> Option<ImageTarget> {
    let bytes = &buf[body.range()];
    let (kind, end) = if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        (ImageKind::Jpeg, scanner::jpeg_end(buf, body.start)?)
    } else if bytes.starts_with(PNG_SIGNATURE) {
        (ImageKind::Png, scanner::png_end(buf, body.start)?)
    } else {
        return None;
    };
    if end > body.end || !buf[end..body.end].iter().all(|&b| scanner::is_whitespace(b)) {
        return None;
    }
    let span = ByteSpan::new(body.start, end);
    if span.len() <= min_len {
        return None;
    }

    let keyword = stream_keyword(buf, body.start)?;
    let dict_start = headers[..headers.partition_point(|h| h.span.end <= keyword)]
        .last()
        .map(|h| h.span.end)
        .filter(|&start| start >= floor)
        .unwrap_or(floor)
        .min(keyword);
    let dict = ByteSpan::new(dict_start, keyword);
    let filters = pdf::filter_names(&buf[dict.range()]);
    let filter_matches = match kind {
        ImageKind::Jpeg => matches!(filters.as_slice(), [b"DCTDecode"] | [b"DCT"]),
        ImageKind::Png => filters.is_empty(),
    };
    if !filter_matches {
        debug!("{:?} at {} skipped: filter chain does not match", kind, span.start);
        return None;
    }
    let length = if scanner::find_token(&buf[dict.range()], b"/Length", 0).is_some() {
        match xref::stream_length(buf, dict, headers) {
            Some(length) => Some(length),
            None => {
                debug!("{:?} at {} skipped: /Length not resolvable", kind, span.start);
                return None;
            }
        }
    } else {
        None
    };
    Some(ImageTarget { kind, span, length })
}

/// Offset of the `stream` keyword whose body starts at `body_start`.
fn stream_keyword(buf: &[u8], body_start: usize) -> Option<usize> {
    let mut k = body_start;
    if k > 0 && buf[k - 1] == b'\n' {
        k -= 1;
    }
    if k > 0 && buf[k - 1] == b'\r' {
        k -= 1;
    }
    let at = k.checked_sub(b"stream".len())?;
    (&buf[at..k] == b"stream").then_some(at)
}

fn recompress_target(buf: &[u8], target: &ImageTarget, policy: &Policy<'_>) -> Option<Recompressed> {
    let bytes = &buf[target.span.range()];
    let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
        recompress(bytes, Some(target.hint()), policy, None)
    }));
    match attempt {
        Ok(Ok(outcome)) => Some(outcome),
        Ok(Err(e)) => {
            warn!("embedded {:?} at {} skipped: {}", target.kind, target.span.start, e);
            None
        }
        Err(_) => {
            warn!("embedded {:?} at {} skipped: codec panicked", target.kind, target.span.start);
            None
        }
    }
}

/// Stage 1. Images are recompressed independently and their results are
/// spliced back in span order, so scheduling never changes the output.
fn recompress_images(
    buf: &[u8],
    targets: &[ImageTarget],
    config: &PdfConfig,
    ladder: &QualityLadder,
) -> Result<(Vec<u8>, usize, usize)> {
    let policy = Policy::embedded(ladder, config.embedded_accept_ratio);
    let outcomes: Vec<Option<Recompressed>> = if config.parallel {
        targets
            .par_iter()
            .map(|t| recompress_target(buf, t, &policy))
            .collect()
    } else {
        targets
            .iter()
            .map(|t| recompress_target(buf, t, &policy))
            .collect()
    };

    let mut edits = Vec::new();
    let mut processed = 0;
    let mut replaced = 0;
    for (target, outcome) in targets.iter().zip(outcomes) {
        let Some(outcome) = outcome else {
            continue;
        };
        processed += 1;
        if !outcome.is_improved() || outcome.output_format() != target.hint() {
            continue;
        }
        let new_len = outcome.candidate.len();
        debug!(
            "{:?} at {}: {} -> {} bytes ({})",
            target.kind,
            target.span.start,
            target.span.len(),
            new_len,
            outcome.candidate.encoding
        );
        if let Some(length) = &target.length {
            edits.push(length.edit(target.span.len(), new_len));
        }
        edits.push(Edit::new(target.span, outcome.candidate.data));
        replaced += 1;
    }
    Ok((apply_edits(buf, edits)?, processed, replaced))
}

/// Stage 3. Outside stream bodies, xref tables and string literals: line
/// endings become LF, spaces and tabs before a line break are dropped, and
/// runs of blank lines collapse to one.
pub fn normalize_whitespace(buf: &[u8]) -> Vec<u8> {
    let regions = ProtectedRegions::scan(buf);
    let mut out = Vec::with_capacity(buf.len());
    let mut cursor = 0;
    for gap in regions.gaps(buf.len()) {
        out.extend_from_slice(&buf[cursor..gap.start]);
        normalize_gap(&buf[gap.range()], &mut out);
        cursor = gap.end;
    }
    out.extend_from_slice(&buf[cursor..]);
    out
}

fn normalize_gap(text: &[u8], out: &mut Vec<u8>) {
    let mut pending_blanks = 0usize;
    let mut newlines = 0usize;
    let mut i = 0;
    while i < text.len() {
        match text[i] {
            b' ' | b'\t' => pending_blanks += 1,
            b'\r' | b'\n' => {
                if text[i] == b'\r' && text.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                pending_blanks = 0;
                newlines += 1;
                if newlines <= 2 {
                    out.push(b'\n');
                }
            }
            b => {
                out.extend_from_slice(&text[i - pending_blanks..i]);
                pending_blanks = 0;
                newlines = 0;
                if b == b'(' {
                    let end = pdf::literal_string_end(text, i).unwrap_or(text.len());
                    out.extend_from_slice(&text[i..end]);
                    i = end;
                    continue;
                }
                out.push(b);
            }
        }
        i += 1;
    }
    out.extend_from_slice(&text[text.len() - pending_blanks..]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use image::{DynamicImage, Rgb, RgbImage};

    fn noisy_jpeg(w: u32, h: u32, quality: u8) -> Vec<u8> {
        let mut state: u32 = 7;
        let img = DynamicImage::ImageRgb8(RgbImage::from_fn(w, h, |x, y| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let n = (state >> 25) as u8;
            Rgb([(x * 4) as u8 ^ n, (y * 4) as u8, n])
        }));
        let rgb = img.to_rgb8();
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, quality)
            .encode(rgb.as_raw(), w, h, image::ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    fn pdf_with_stream(dict: &str, body: &[u8]) -> Vec<u8> {
        let mut pdf = b"%PDF-1.4\n1 0 obj\n".to_vec();
        pdf.extend_from_slice(dict.replace("{len}", &body.len().to_string()).as_bytes());
        pdf.extend_from_slice(b"\nstream\n");
        pdf.extend_from_slice(body);
        pdf.extend_from_slice(b"\nendstream\nendobj\n%%EOF\n");
        pdf
    }

    fn run(buf: &[u8], config: &PdfConfig) -> Compacted {
        let mut sink = NoProgress;
        let mut progress = Monotonic::new(&mut sink);
        compact(buf, config, &QualityLadder::default(), &mut progress).unwrap()
    }

    #[test]
    fn whitespace_rules() {
        let input = b"1 0 obj  \r\n<< /A 1 >>\t\r\n\r\n\r\n\n\nendobj\rx  y\n";
        let out = normalize_whitespace(input);
        assert_eq!(out, b"1 0 obj\n<< /A 1 >>\n\nendobj\nx  y\n");
    }

    #[test]
    fn whitespace_inside_strings_and_streams_is_kept() {
        let input = b"<< /T (a  \r\n\r\n\r\nb) /Length 8 >>\nstream\nq  \r\n\n\n\nendstream\n";
        let out = normalize_whitespace(input);
        assert_eq!(out, input.to_vec());
    }

    #[test]
    fn dct_stream_image_is_replaced_and_length_follows() {
        let jpeg = noisy_jpeg(64, 64, 100);
        let pdf = pdf_with_stream(
            "<< /Type /XObject /Subtype /Image /Width 64 /Height 64 /ColorSpace /DeviceRGB \
             /BitsPerComponent 8 /Filter /DCTDecode /Length {len} >>",
            &jpeg,
        );
        let out = run(&pdf, &PdfConfig::default());
        assert_eq!(out.processed, 1);
        assert_eq!(out.replaced, 1);
        assert!(out.data.len() < pdf.len());

        let body = StreamBodies::new(&out.data, 0).next().unwrap();
        let image_end = scanner::jpeg_end(&out.data, body.start).unwrap();
        let declared = format!("/Length {} ", image_end - body.start);
        assert!(String::from_utf8_lossy(&out.data).contains(&declared));
        let back = image::load_from_memory(&out.data[body.start..image_end]).unwrap();
        assert_eq!((back.width(), back.height()), (64, 64));
    }

    #[test]
    fn sequential_and_parallel_agree() {
        let jpeg = noisy_jpeg(48, 48, 98);
        let pdf = pdf_with_stream("<< /Subtype /Image /Filter /DCTDecode /Length {len} >>", &jpeg);
        let parallel = run(&pdf, &PdfConfig::default());
        let sequential = run(
            &pdf,
            &PdfConfig {
                parallel: false,
                ..PdfConfig::default()
            },
        );
        assert_eq!(parallel.data, sequential.data);
    }

    #[test]
    fn jpeg_under_other_filters_is_left_alone() {
        let jpeg = noisy_jpeg(64, 64, 100);
        let pdf = pdf_with_stream("<< /Filter /FlateDecode /Length {len} >>", &jpeg);
        let out = run(&pdf, &PdfConfig::default());
        assert_eq!(out.processed, 0);
        assert!(out.data.windows(jpeg.len()).any(|w| w == &jpeg[..]));
    }

    #[test]
    fn small_images_are_ignored() {
        let flat = RgbImage::from_pixel(8, 8, Rgb([40, 80, 120]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 100)
            .encode(flat.as_raw(), 8, 8, image::ExtendedColorType::Rgb8)
            .unwrap();
        assert!(jpeg.len() <= 1000);
        let pdf = pdf_with_stream("<< /Filter /DCTDecode /Length {len} >>", &jpeg);
        assert_eq!(run(&pdf, &PdfConfig::default()).processed, 0);
    }

    #[test]
    fn raw_image_outside_streams_is_recompressed() {
        let jpeg = noisy_jpeg(64, 64, 100);
        let mut pdf = b"%PDF-1.4\n% raw image follows\n".to_vec();
        pdf.extend_from_slice(&jpeg);
        pdf.extend_from_slice(b"\n%%EOF\n");

        let out = run(&pdf, &PdfConfig::default());
        assert_eq!(out.processed, 1);
        assert_eq!(out.replaced, 1);
        assert!(out.data.len() < pdf.len());
    }

    #[test]
    fn image_buried_in_other_stream_is_opt_in() {
        let jpeg = noisy_jpeg(64, 64, 100);
        let mut body = b"junk before the image ".to_vec();
        body.extend_from_slice(&jpeg);
        let pdf = pdf_with_stream("<< /Length {len} >>", &body);

        assert_eq!(run(&pdf, &PdfConfig::default()).processed, 0);
        let loose = run(
            &pdf,
            &PdfConfig {
                loose_image_spans: true,
                ..PdfConfig::default()
            },
        );
        assert_eq!(loose.processed, 1);
        assert!(loose.data.len() < pdf.len());
    }

    #[test]
    fn dct_stream_without_length_is_recompressed() {
        let jpeg = noisy_jpeg(64, 64, 100);
        let pdf = pdf_with_stream("<< /Subtype /Image /Filter /DCTDecode >>", &jpeg);
        let out = run(&pdf, &PdfConfig::default());
        assert_eq!(out.processed, 1);
        assert_eq!(out.replaced, 1);
        assert!(out.data.len() < pdf.len());
        assert!(!String::from_utf8_lossy(&out.data).contains("/Length"));
    }

    #[test]
    fn unresolvable_length_is_skipped() {
        let jpeg = noisy_jpeg(64, 64, 100);
        let pdf = pdf_with_stream("<< /Filter /DCTDecode /Length 9 0 R >>", &jpeg);
        assert_eq!(run(&pdf, &PdfConfig::default()).processed, 0);
    }

    #[test]
    fn content_stream_mentioning_endstream_is_kept_whole() {
        let body = b"BT (see endstream) Tj   \nET   \n\n\n";
        let pdf = pdf_with_stream("<< /Length {len} >>", body);
        let out = normalize_whitespace(&pdf);
        assert!(out.windows(body.len()).any(|w| w == &body[..]));
    }

    #[test]
    fn corrupt_image_is_skipped_not_fatal() {
        let mut fake = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        fake.extend(std::iter::repeat(0x41).take(14));
        fake.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02]);
        fake.extend(std::iter::repeat(0x42).take(2000));
        fake.extend_from_slice(&[0xFF, 0xD9]);
        let pdf = pdf_with_stream("<< /Filter /DCTDecode /Length {len} >>", &fake);
        let out = run(&pdf, &PdfConfig::default());
        assert_eq!(out.processed, 0);
        assert!(out.data.windows(fake.len()).any(|w| w == &fake[..]));
    }

    #[test]
    fn non_pdf_is_returned_unchanged() {
        let out = run(b"GIF89a not a pdf", &PdfConfig::default());
        assert_eq!(out.data, b"GIF89a not a pdf");
    }
}
