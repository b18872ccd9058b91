//! Opt-in lossy pass: drops oversized image objects and repeated metadata
//! objects. References to a dropped object resolve to null, so pages that
//! draw a dropped image lose it.

use lazy_static::lazy_static;
use log::{debug, info};
use regex::bytes::Regex;

use crate::error::Result;
use crate::pdf::{apply_edits, find_endobj, object_headers, Edit};
use crate::scanner::{self, ByteSpan, ProtectedRegions};

lazy_static! {
    static ref SUBTYPE_IMAGE: Regex =
        Regex::new(r"(?-u)/Subtype[\x00\t\n\x0c\r ]*/Image(?:[\x00\t\n\x0c\r ()<>\[\]{}/%]|$)").unwrap();
    static ref TYPE_METADATA: Regex =
        Regex::new(r"(?-u)/Type[\x00\t\n\x0c\r ]*/Metadata(?:[\x00\t\n\x0c\r ()<>\[\]{}/%]|$)").unwrap();
}

#[derive(Debug)]
pub struct Pruned {
    pub data: Vec<u8>,
    pub images_dropped: usize,
    pub metadata_dropped: usize,
}

/// Replaces every image object larger than `ceiling` bytes, and every
/// metadata object after the first, with a comment line.
pub fn drop_heavy_objects(buf: &[u8], ceiling: usize) -> Result<Pruned> {
    let regions = ProtectedRegions::scan(buf);
    let headers = object_headers(buf, &regions);
    let mut edits = Vec::new();
    let mut images_dropped = 0;
    let mut metadata_dropped = 0;
    let mut seen_metadata = false;
    let mut cursor = 0;

    for (i, header) in headers.iter().enumerate() {
        if header.span.start < cursor {
            continue;
        }
        let Some(end) = find_endobj(buf, header.span.end, &regions) else {
            continue;
        };
        if headers.get(i + 1).map_or(false, |next| next.span.start < end) {
            debug!("object {} {} has no endobj of its own", header.number, header.generation);
            continue;
        }
        let object = ByteSpan::new(header.span.start, end);
        let dict_end = scanner::find_token(buf, b"stream", header.span.end)
            .filter(|&at| at < end)
            .unwrap_or(end);
        let dict = &buf[header.span.end..dict_end];

        let placeholder = if SUBTYPE_IMAGE.is_match(dict) && object.len() > ceiling {
            images_dropped += 1;
            format!("% large image object {} {} removed\n", header.number, header.generation)
        } else if TYPE_METADATA.is_match(dict) {
            if !seen_metadata {
                seen_metadata = true;
                continue;
            }
            metadata_dropped += 1;
            format!("% duplicate metadata object {} {} removed\n", header.number, header.generation)
        } else {
            continue;
        };
        debug!("{}", placeholder.trim_end());
        edits.push(Edit::new(object, placeholder.into_bytes()));
        cursor = end;
    }

    let data = apply_edits(buf, edits)?;
    info!(
        "aggressive pass: {} image objects and {} metadata objects dropped, {} -> {} bytes",
        images_dropped,
        metadata_dropped,
        buf.len(),
        data.len()
    );
    Ok(Pruned {
        data,
        images_dropped,
        metadata_dropped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(number: u32, dict: &str, body_len: usize) -> Vec<u8> {
        let mut v = format!("{} 0 obj\n{}\nstream\n", number, dict).into_bytes();
        v.extend(std::iter::repeat(b'Z').take(body_len));
        v.extend_from_slice(b"\nendstream\nendobj\n");
        v
    }

    #[test]
    fn large_images_go_small_ones_stay() {
        let mut pdf = b"%PDF-1.4\n".to_vec();
        pdf.extend(object(1, "<< /Type /XObject /Subtype /Image /Length 5000 >>", 5000));
        pdf.extend(object(2, "<< /Subtype /Image /Length 50 >>", 50));
        pdf.extend(object(3, "<< /Subtype /Form /Length 5000 >>", 5000));

        let out = drop_heavy_objects(&pdf, 1000).unwrap();
        assert_eq!(out.images_dropped, 1);
        let text = String::from_utf8(out.data).unwrap();
        assert!(text.contains("% large image object 1 0 removed\n"));
        assert!(text.contains("2 0 obj"));
        assert!(text.contains("3 0 obj"));
        assert!(!text.contains("1 0 obj"));
    }

    #[test]
    fn first_metadata_object_is_kept() {
        let mut pdf = b"%PDF-1.4\n".to_vec();
        pdf.extend(object(4, "<< /Type /Metadata /Subtype /XML /Length 10 >>", 10));
        pdf.extend(object(5, "<< /Type/Metadata/Subtype/XML /Length 10 >>", 10));
        pdf.extend(object(6, "<< /Type /MetadataX /Length 10 >>", 10));

        let out = drop_heavy_objects(&pdf, 100_000).unwrap();
        assert_eq!(out.metadata_dropped, 1);
        let text = String::from_utf8(out.data).unwrap();
        assert!(text.contains("4 0 obj"));
        assert!(!text.contains("5 0 obj"));
        assert!(text.contains("6 0 obj"));
    }

    #[test]
    fn image_tag_inside_a_stream_body_does_not_count() {
        let mut pdf = b"%PDF-1.4\n7 0 obj\n<< /Length 30 >>\nstream\n".to_vec();
        pdf.extend_from_slice(b"/Subtype /Image ");
        pdf.extend(std::iter::repeat(b'Q').take(3000));
        pdf.extend_from_slice(b"\nendstream\nendobj\n");
        let out = drop_heavy_objects(&pdf, 1000).unwrap();
        assert_eq!(out.images_dropped, 0);
        assert_eq!(out.data, pdf);
    }
}
