use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::panic;

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use log::{debug, info, warn};
use lopdf::{Document, Object, ObjectId, Stream};
use rayon::prelude::*;

use crate::codec::{self, TargetFormat};
use crate::ladder::{BestCandidate, CompressionCandidate, Encoding, QualityLadder};
use crate::pdf::metadata::METADATA_KEYS;
use crate::select;

#[derive(Debug)]
pub struct Rewritten {
    pub data: Vec<u8>,
    pub images_evaluated: usize,
    pub images_replaced: usize,
    pub objects_pruned: usize,
    pub info_entries_removed: usize,
}

/// Decoded pixels of one Flate image XObject.
struct RasterJob {
    id: ObjectId,
    image: DynamicImage,
    original_len: usize,
}

/// Loads a document through lopdf. The parser is not trusted with hostile
/// input, so a panic inside it is reported as a load failure.
pub fn load_document(buf: &[u8]) -> Result<Document> {
    match panic::catch_unwind(|| Document::load_from(Cursor::new(buf))) {
        Ok(loaded) => loaded.context("Failed to load PDF"),
        Err(_) => Err(anyhow!("PDF parser panicked")),
    }
}

/// Object-level rewrite: drops document-information entries, re-encodes
/// plain 8-bit Flate images as JPEG when that is a real gain, prunes
/// unreferenced objects and Flate-compresses unfiltered streams.
pub fn rewrite(buf: &[u8], ladder: &QualityLadder, accept_ratio: f64, parallel: bool) -> Result<Rewritten> {
    let mut doc = load_document(buf)?;
    if doc.is_encrypted() {
        bail!("encrypted documents are not rewritten");
    }

    let info_entries_removed = strip_info(&mut doc);

    let masks = mask_ids(&doc);
    let ids: Vec<ObjectId> = doc
        .objects
        .iter()
        .filter_map(|(id, object)| match object {
            Object::Stream(stream) if !masks.contains(id) && flate_image_components(stream).is_some() => Some(*id),
            _ => None,
        })
        .collect();

    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
        match extract_raster(&doc, id) {
            Ok(job) => jobs.push(job),
            Err(e) => warn!("image object {} skipped: {:#}", id.0, e),
        }
    }
    let images_evaluated = jobs.len();

    let shrunk: Vec<Option<CompressionCandidate>> = if parallel {
        jobs.par_iter().map(|job| shrink(job, ladder, accept_ratio)).collect()
    } else {
        jobs.iter().map(|job| shrink(job, ladder, accept_ratio)).collect()
    };

    let mut images_replaced = 0;
    for (job, candidate) in jobs.iter().zip(shrunk) {
        if let Some(candidate) = candidate {
            debug!(
                "image object {}: {} -> {} bytes ({})",
                job.id.0,
                job.original_len,
                candidate.len(),
                candidate.encoding
            );
            install_jpeg(&mut doc, job.id, candidate.data);
            images_replaced += 1;
        }
    }

    let objects_pruned = doc.prune_objects().len();
    doc.compress();

    let mut data = Vec::new();
    doc.save_to(&mut data).context("Failed to save PDF")?;
    info!(
        "object rewrite: {} info entries, {}/{} images re-encoded, {} objects pruned, {} -> {} bytes",
        info_entries_removed,
        images_replaced,
        images_evaluated,
        objects_pruned,
        buf.len(),
        data.len()
    );
    Ok(Rewritten {
        data,
        images_evaluated,
        images_replaced,
        objects_pruned,
        info_entries_removed,
    })
}

fn strip_info(doc: &mut Document) -> usize {
    let Ok(info_id) = doc.trailer.get(b"Info").and_then(|o| o.as_reference()) else {
        return 0;
    };
    let Ok(info) = doc.get_object_mut(info_id).and_then(|o| o.as_dict_mut()) else {
        return 0;
    };
    let mut removed = 0;
    for key in METADATA_KEYS {
        if info.remove(&key[1..]).is_some() {
            removed += 1;
        }
    }
    if info.len() == 0 {
        doc.trailer.remove(b"Info");
    }
    removed
}

/// Objects used as soft masks or stencil masks by some image.
fn mask_ids(doc: &Document) -> HashSet<ObjectId> {
    let mut masks = HashSet::new();
    for object in doc.objects.values() {
        if let Object::Stream(stream) = object {
            for key in [&b"SMask"[..], b"Mask"] {
                if let Ok(Object::Reference(id)) = stream.dict.get(key) {
                    masks.insert(*id);
                }
            }
        }
    }
    masks
}

/// Component count of an 8-bit DeviceGray/DeviceRGB image compressed with a
/// single FlateDecode filter and carrying no mask, decode array or predictor.
fn flate_image_components(stream: &Stream) -> Option<usize> {
    let dict = &stream.dict;
    let name = |key: &[u8]| dict.get(key).ok().and_then(|o| o.as_name().ok());
    if name(b"Subtype") != Some(&b"Image"[..]) {
        return None;
    }
    let flate = match dict.get(b"Filter") {
        Ok(Object::Name(n)) => n == b"FlateDecode",
        Ok(Object::Array(filters)) => matches!(filters.as_slice(), [Object::Name(n)] if n == b"FlateDecode"),
        _ => false,
    };
    if !flate || dict.get(b"BitsPerComponent").and_then(|o| o.as_i64()).ok() != Some(8) {
        return None;
    }
    if [&b"SMask"[..], b"Mask", b"Decode", b"DecodeParms"]
        .iter()
        .any(|key| dict.has(key))
        || matches!(dict.get(b"ImageMask"), Ok(Object::Boolean(true)))
    {
        return None;
    }
    match name(b"ColorSpace")? {
        b"DeviceGray" => Some(1),
        b"DeviceRGB" => Some(3),
        _ => None,
    }
}

fn decompress_stream(stream: &Stream, object_id: u32) -> Result<Vec<u8>> {
    match stream.decompressed_content() {
        Ok(content) => Ok(content),
        Err(e) => {
            debug!("image object {}: lopdf inflate failed ({:?}), retrying with zlib", object_id, e);
            let mut decoder = flate2::read::ZlibDecoder::new(&stream.content[..]);
            let mut buffer = Vec::new();
            decoder
                .read_to_end(&mut buffer)
                .with_context(|| format!("Manual zlib failed for object {}", object_id))?;
            Ok(buffer)
        }
    }
}

fn extract_raster(doc: &Document, id: ObjectId) -> Result<RasterJob> {
    let stream = match doc.objects.get(&id) {
        Some(Object::Stream(s)) => s,
        _ => bail!("Object not a stream"),
    };
    let components = flate_image_components(stream).ok_or_else(|| anyhow!("Not a plain Flate image"))?;
    let dimension = |key: &[u8]| -> Result<u32> {
        let value = stream.dict.get(key).and_then(|o| o.as_i64()).context("Missing dimension")?;
        u32::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| anyhow!("Bad dimension {}", value))
    };
    let (width, height) = (dimension(b"Width")?, dimension(b"Height")?);

    let mut content = decompress_stream(stream, id.0)?;
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(components))
        .ok_or_else(|| anyhow!("Image too large"))?;
    if content.len() < expected {
        bail!("Image data holds {} bytes, expected {}", content.len(), expected);
    }
    content.truncate(expected);

    let image = match components {
        1 => DynamicImage::ImageLuma8(
            GrayImage::from_raw(width, height, content).ok_or_else(|| anyhow!("Failed Gray"))?,
        ),
        _ => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, content).ok_or_else(|| anyhow!("Failed RGB"))?,
        ),
    };
    Ok(RasterJob {
        id,
        image,
        original_len: stream.content.len(),
    })
}

/// Best JPEG encoding of the job's pixels that the selector accepts against
/// the current compressed stream.
fn shrink(job: &RasterJob, ladder: &QualityLadder, accept_ratio: f64) -> Option<CompressionCandidate> {
    let mut best = BestCandidate::new(job.original_len);
    let report = ladder.run(
        &mut best,
        |preset| {
            codec::encode_image(&job.image, TargetFormat::Jpeg, preset.quality).map(|data| {
                CompressionCandidate {
                    data,
                    encoding: Encoding::Jpeg {
                        quality: preset.quality,
                    },
                    max_dimension: None,
                }
            })
        },
        |_| {},
    );
    if report.all_failed() {
        debug!("image object {}: no preset could be encoded", job.id.0);
    }
    best.into_inner()
        .filter(|c| select::accepts(job.original_len, c.len(), accept_ratio))
}

fn install_jpeg(doc: &mut Document, id: ObjectId, jpeg: Vec<u8>) {
    if let Some(Object::Stream(stream)) = doc.objects.get_mut(&id) {
        stream.dict.set("Length", Object::Integer(jpeg.len() as i64));
        stream.content = jpeg;
        stream.dict.set("Filter", Object::Name(b"DCTDecode".to_vec()));
        stream.dict.remove(b"DecodeParms");
    }
}
