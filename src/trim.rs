//! Lossless trimming of metadata segments from JPEG and PNG containers.
//!
//! Only segments that never carry pixel data are dropped, and only when they
//! are large enough to matter. Pixels are untouched.

use log::debug;

use crate::scanner::PNG_SIGNATURE;

const EXIF_LIMIT: usize = 10 * 1024;
const COMMENT_LIMIT: usize = 1024;
const APP_LIMIT: usize = 20 * 1024;
const PNG_TEXT_LIMIT: usize = 1024;
const PNG_PHYS_LIMIT: usize = 512;

/// Drops oversized EXIF, comment and APP2..APP15 segments from the header of
/// a JPEG. Returns `None` when nothing was removed or the header is malformed.
pub fn trim_jpeg(jpeg: &[u8]) -> Option<Vec<u8>> {
    if !jpeg.starts_with(&[0xFF, 0xD8]) {
        return None;
    }
    let mut out = Vec::with_capacity(jpeg.len());
    out.extend_from_slice(&jpeg[..2]);
    let mut pos = 2;
    let mut removed = 0;

    while pos + 4 <= jpeg.len() {
        if jpeg[pos] != 0xFF {
            return None;
        }
        let marker = jpeg[pos + 1];
        if matches!(marker, 0xD9 | 0xDA) {
            break;
        }
        let seg_len = u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]) as usize;
        let end = pos + 2 + seg_len;
        if seg_len < 2 || end > jpeg.len() {
            return None;
        }
        let droppable = match marker {
            0xE1 => seg_len > EXIF_LIMIT,
            0xFE => seg_len > COMMENT_LIMIT,
            0xE2..=0xEF => seg_len > APP_LIMIT,
            _ => false,
        };
        if droppable {
            debug!("dropping JPEG segment 0x{:02X}: {} bytes", marker, seg_len);
            removed += end - pos;
        } else {
            out.extend_from_slice(&jpeg[pos..end]);
        }
        pos = end;
    }

    if removed == 0 {
        return None;
    }
    out.extend_from_slice(&jpeg[pos..]);
    Some(out)
}

/// Drops timestamp chunks and oversized text/pHYs chunks from a PNG. A
/// truncated chunk list is copied through as-is. Returns `None` when nothing
/// was removed.
pub fn trim_png(png: &[u8]) -> Option<Vec<u8>> {
    if !png.starts_with(PNG_SIGNATURE) {
        return None;
    }
    let mut out = Vec::with_capacity(png.len());
    out.extend_from_slice(PNG_SIGNATURE);
    let mut pos = PNG_SIGNATURE.len();
    let mut removed = 0;

    while pos < png.len() {
        if pos + 8 > png.len() {
            out.extend_from_slice(&png[pos..]);
            break;
        }
        let chunk_len =
            u32::from_be_bytes([png[pos], png[pos + 1], png[pos + 2], png[pos + 3]]) as usize;
        let chunk_type = &png[pos + 4..pos + 8];
        let end = match pos.checked_add(12 + chunk_len) {
            Some(end) if end <= png.len() => end,
            _ => {
                out.extend_from_slice(&png[pos..]);
                break;
            }
        };
        let droppable = match chunk_type {
            b"tIME" => true,
            b"tEXt" | b"zTXt" | b"iTXt" => chunk_len > PNG_TEXT_LIMIT,
            b"pHYs" => chunk_len > PNG_PHYS_LIMIT,
            _ => false,
        };
        if droppable {
            debug!(
                "dropping PNG chunk {}: {} bytes",
                String::from_utf8_lossy(chunk_type),
                chunk_len
            );
            removed += end - pos;
        } else {
            out.extend_from_slice(&png[pos..end]);
        }
        pos = end;
    }

    if removed == 0 {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(marker: u8, payload_len: usize) -> Vec<u8> {
        let mut v = vec![0xFF, marker];
        v.extend_from_slice(&((payload_len + 2) as u16).to_be_bytes());
        v.extend(std::iter::repeat(0xAA).take(payload_len));
        v
    }

    fn chunk(kind: &[u8; 4], payload_len: usize) -> Vec<u8> {
        let mut v = (payload_len as u32).to_be_bytes().to_vec();
        v.extend_from_slice(kind);
        v.extend(std::iter::repeat(0x55).take(payload_len));
        v.extend_from_slice(&[0, 0, 0, 0]);
        v
    }

    #[test]
    fn large_exif_is_dropped_small_kept() {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend(segment(0xE0, 14));
        jpeg.extend(segment(0xE1, 12_000));
        jpeg.extend(segment(0xFE, 10));
        jpeg.extend_from_slice(&[0xFF, 0xDA, 0x00, 0x02, 0x11, 0x22, 0xFF, 0xD9]);

        let trimmed = trim_jpeg(&jpeg).unwrap();
        assert_eq!(trimmed.len(), jpeg.len() - (12_000 + 4));
        assert!(trimmed.ends_with(&[0xFF, 0xDA, 0x00, 0x02, 0x11, 0x22, 0xFF, 0xD9]));
    }

    #[test]
    fn nothing_to_drop_gives_none() {
        let mut jpeg = vec![0xFF, 0xD8];
        jpeg.extend(segment(0xE1, 100));
        jpeg.extend_from_slice(&[0xFF, 0xD9]);
        assert!(trim_jpeg(&jpeg).is_none());
        assert!(trim_jpeg(b"not a jpeg").is_none());
    }

    #[test]
    fn png_time_and_big_text_are_dropped() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend(chunk(b"IHDR", 13));
        png.extend(chunk(b"tIME", 7));
        png.extend(chunk(b"tEXt", 2000));
        png.extend(chunk(b"tEXt", 20));
        png.extend(chunk(b"IDAT", 30));
        png.extend(chunk(b"IEND", 0));

        let trimmed = trim_png(&png).unwrap();
        assert_eq!(trimmed.len(), png.len() - (7 + 12) - (2000 + 12));
        assert!(trimmed.ends_with(&chunk(b"IEND", 0)));
    }

    #[test]
    fn truncated_png_tail_is_copied() {
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend(chunk(b"tIME", 7));
        png.extend_from_slice(&[0, 0, 1]);
        let trimmed = trim_png(&png).unwrap();
        assert!(trimmed.ends_with(&[0, 0, 1]));
    }
}
