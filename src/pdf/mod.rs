//! Byte-level PDF compaction.
//!
//! The buffer is never parsed into an object graph here. Objects, streams
//! and dictionary entries are located by byte-pattern search, edits are
//! collected as non-overlapping span replacements, and each stage produces a
//! new buffer generation.

pub mod aggressive;
pub mod compact;
pub mod metadata;
pub mod rewrite;
pub mod strategy;
pub mod xref;

use lazy_static::lazy_static;
use log::debug;
use regex::bytes::Regex;

use crate::error::{CompressError, Result};
use crate::scanner::{self, ByteSpan, ProtectedRegions};

pub const PDF_MAGIC: &[u8; 4] = b"%PDF";

lazy_static! {
    static ref OBJECT_HEADER: Regex =
        Regex::new(r"(?-u)(\d{1,10})[\x00\t\n\x0c\r ]+(\d{1,5})[\x00\t\n\x0c\r ]+obj").unwrap();
    static ref PAGE_TYPE: Regex = Regex::new(r"(?-u)/Type[\x00\t\n\x0c\r ]*/Page").unwrap();
}

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(PDF_MAGIC)
}

/// Replace `span` of the current buffer generation with `replacement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    pub span: ByteSpan,
    pub replacement: Vec<u8>,
}

impl Edit {
    pub fn new(span: ByteSpan, replacement: Vec<u8>) -> Self {
        Self { span, replacement }
    }

    pub fn delete(span: ByteSpan) -> Self {
        Self::new(span, Vec::new())
    }
}

/// Builds the next buffer generation. Edits are applied in span order;
/// overlapping or out-of-range spans are an internal fault and nothing is
/// produced.
pub fn apply_edits(buf: &[u8], mut edits: Vec<Edit>) -> Result<Vec<u8>> {
    edits.sort_by_key(|e| e.span.start);
    let mut out = Vec::with_capacity(buf.len());
    let mut cursor = 0;
    for edit in &edits {
        let span = edit.span;
        if span.start < cursor || span.start > span.end || span.end > buf.len() {
            return Err(CompressError::InternalFault(format!(
                "edit {}..{} does not fit buffer of {} bytes (cursor {})",
                span.start,
                span.end,
                buf.len(),
                cursor
            )));
        }
        out.extend_from_slice(&buf[cursor..span.start]);
        out.extend_from_slice(&edit.replacement);
        cursor = span.end;
    }
    out.extend_from_slice(&buf[cursor..]);
    Ok(out)
}

/// An `N G obj` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub number: u32,
    pub generation: u16,
    pub span: ByteSpan,
}

fn is_regular(b: u8) -> bool {
    !scanner::is_whitespace(b) && !scanner::is_delimiter(b)
}

/// Object headers outside protected regions, in buffer order.
pub fn object_headers(buf: &[u8], regions: &ProtectedRegions) -> Vec<ObjectHeader> {
    let mut headers = Vec::new();
    let mut pos = 0;
    while let Some(caps) = OBJECT_HEADER.captures_at(buf, pos) {
        let (Some(whole), Some(num), Some(generation_digits)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            break;
        };
        let (start, end) = (whole.start(), whole.end());
        let rejected = (start > 0 && is_regular(buf[start - 1]))
            || buf.get(end).map_or(false, |&b| is_regular(b))
            || regions.containing(start).is_some();
        if rejected {
            // A rejected match may still hide a header in its tail.
            pos = start + 1;
            continue;
        }
        pos = end;
        let number = parse_decimal(num.as_bytes()).and_then(|n| u32::try_from(n).ok());
        let generation = parse_decimal(generation_digits.as_bytes()).and_then(|g| u16::try_from(g).ok());
        if let (Some(number), Some(generation)) = (number, generation) {
            headers.push(ObjectHeader {
                number,
                generation,
                span: ByteSpan::new(start, end),
            });
        }
    }
    headers
}

/// Offset just past the `endobj` that closes an object whose header ends at
/// `from`. Occurrences inside protected regions are skipped.
pub fn find_endobj(buf: &[u8], from: usize, regions: &ProtectedRegions) -> Option<usize> {
    let mut pos = from;
    loop {
        let at = scanner::find_token(buf, b"endobj", pos)?;
        match regions.containing(at) {
            Some(region) => pos = region.end,
            None => return Some(at + b"endobj".len()),
        }
    }
}

pub fn parse_decimal(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || digits.len() > 19 {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Number of page objects visible outside stream bodies. Falls back to the
/// page tree as loaded by lopdf when pages live in compressed object streams.
pub fn page_count(buf: &[u8]) -> usize {
    let regions = ProtectedRegions::scan(buf);
    let visible = PAGE_TYPE
        .find_iter(buf)
        .filter(|m| buf.get(m.end()).map_or(true, |&b| !is_regular(b)))
        .filter(|m| regions.containing(m.start()).is_none())
        .count();
    if visible > 0 {
        return visible;
    }
    match rewrite::load_document(buf) {
        Ok(doc) => doc.get_pages().len(),
        Err(e) => {
            debug!("page tree unavailable: {}", e);
            0
        }
    }
}

const MAX_NESTING: usize = 64;

pub fn skip_whitespace(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && scanner::is_whitespace(buf[pos]) {
        pos += 1;
    }
    pos
}

fn regular_run_end(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && is_regular(buf[pos]) {
        pos += 1;
    }
    pos
}

/// End (exclusive) of the literal string opening at `start`. Balanced
/// parentheses nest and a backslash escapes the next byte.
pub fn literal_string_end(buf: &[u8], start: usize) -> Option<usize> {
    if buf.get(start) != Some(&b'(') {
        return None;
    }
    let mut depth = 0usize;
    let mut i = start;
    while i < buf.len() {
        match buf[i] {
            b'\\' => i += 1,
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// End (exclusive) of the single object starting at `start`: a string,
/// dictionary, array, name, number, keyword or `N G R` reference.
/// Unterminated or unrecognised input gives `None`.
pub fn value_end(buf: &[u8], start: usize) -> Option<usize> {
    value_end_at(buf, start, 0)
}

fn value_end_at(buf: &[u8], start: usize, nesting: usize) -> Option<usize> {
    if nesting > MAX_NESTING {
        return None;
    }
    match *buf.get(start)? {
        b'(' => literal_string_end(buf, start),
        b'<' if buf.get(start + 1) == Some(&b'<') => container_end(buf, start + 2, b">>", nesting),
        b'<' => scanner::find(buf, b">", start).map(|at| at + 1),
        b'[' => container_end(buf, start + 1, b"]", nesting),
        b'/' => Some(regular_run_end(buf, start + 1)),
        b if is_regular(b) => {
            let end = regular_run_end(buf, start);
            Some(reference_end(buf, start, end).unwrap_or(end))
        }
        _ => None,
    }
}

fn container_end(buf: &[u8], mut pos: usize, close: &[u8], nesting: usize) -> Option<usize> {
    loop {
        pos = skip_whitespace(buf, pos);
        if pos >= buf.len() {
            return None;
        }
        if buf[pos..].starts_with(close) {
            return Some(pos + close.len());
        }
        pos = value_end_at(buf, pos, nesting + 1)?;
    }
}

/// If the integer at `start..end` opens an `N G R` reference, the end of it.
fn reference_end(buf: &[u8], start: usize, end: usize) -> Option<usize> {
    let is_int = |s: &[u8]| !s.is_empty() && s.iter().all(u8::is_ascii_digit);
    if !is_int(&buf[start..end]) {
        return None;
    }
    let gen_start = skip_whitespace(buf, end);
    let gen_end = regular_run_end(buf, gen_start);
    if gen_start == end || !is_int(&buf[gen_start..gen_end]) {
        return None;
    }
    let r = skip_whitespace(buf, gen_end);
    let after = r + 1;
    if r == gen_end || buf.get(r) != Some(&b'R') || buf.get(after).map_or(false, |&b| is_regular(b)) {
        return None;
    }
    Some(after)
}

/// Names listed under `/Filter` in a stream dictionary, without the slash.
pub fn filter_names(dict: &[u8]) -> Vec<&[u8]> {
    let Some(at) = scanner::find_token(dict, b"/Filter", 0) else {
        return Vec::new();
    };
    let mut pos = skip_whitespace(dict, at + b"/Filter".len());
    let in_array = dict.get(pos) == Some(&b'[');
    if in_array {
        pos += 1;
    }
    let mut names = Vec::new();
    loop {
        pos = skip_whitespace(dict, pos);
        if dict.get(pos) != Some(&b'/') {
            break;
        }
        let end = regular_run_end(dict, pos + 1);
        names.push(&dict[pos + 1..end]);
        pos = end;
        if !in_array {
            break;
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edits_apply_in_order() {
        let buf = b"0123456789";
        let out = apply_edits(
            buf,
            vec![
                Edit::new(ByteSpan::new(6, 8), b"x".to_vec()),
                Edit::delete(ByteSpan::new(1, 3)),
            ],
        )
        .unwrap();
        assert_eq!(out, b"0345x89");
    }

    #[test]
    fn overlapping_edits_are_a_fault() {
        let err = apply_edits(
            b"0123456789",
            vec![
                Edit::delete(ByteSpan::new(1, 5)),
                Edit::delete(ByteSpan::new(4, 6)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, CompressError::InternalFault(_)));
        assert!(apply_edits(b"abc", vec![Edit::delete(ByteSpan::new(2, 9))]).is_err());
    }

    #[test]
    fn headers_skip_stream_bodies_and_partial_numbers() {
        let buf = b"%PDF-1.4\n1 0 obj\n<< >>\nendobj\n12 0 obj\n<< /Length 9 >>\nstream\n3 0 obj\n\nendstream\nendobj\n";
        let regions = ProtectedRegions::scan(buf);
        let headers = object_headers(buf, &regions);
        let numbers: Vec<u32> = headers.iter().map(|h| h.number).collect();
        assert_eq!(numbers, vec![1, 12]);
        assert_eq!(object_headers(b"%PDF-1.41 0 obj", &ProtectedRegions::default()).len(), 0);
        assert_eq!(object_headers(b"x41 0 obj\n7 0 obj", &ProtectedRegions::default())[0].number, 7);
        let end = find_endobj(buf, headers[1].span.end, &regions).unwrap();
        assert_eq!(&buf[end - 6..end], b"endobj");
        assert!(end > regions.spans()[0].end);
    }

    #[test]
    fn page_count_ignores_pages_node() {
        let buf = b"%PDF-1.4\n1 0 obj << /Type /Pages /Kids [2 0 R 3 0 R] >> endobj\n\
                    2 0 obj << /Type /Page >> endobj\n3 0 obj << /Type/Page/Parent 1 0 R >> endobj\n";
        assert_eq!(page_count(buf), 2);
    }

    #[test]
    fn page_count_of_garbage_is_zero() {
        assert_eq!(page_count(b"%PDF-1.4 nothing else"), 0);
    }

    #[test]
    fn value_ends() {
        let buf = b"(a (nested) \\) str) /Next";
        assert_eq!(value_end(buf, 0), Some(19));
        assert_eq!(value_end(b"<< /A << /B 1 >> /C [1 2 (x)] >> tail", 0), Some(32));
        assert_eq!(value_end(b"12 0 R /X", 0), Some(6));
        assert_eq!(value_end(b"12 /X", 0), Some(2));
        assert_eq!(value_end(b"<48656C6C6F>", 0), Some(12));
        assert_eq!(value_end(b"/Name/Other", 0), Some(5));
        assert_eq!(value_end(b"(unterminated", 0), None);
        assert_eq!(value_end(b"<< /A 1", 0), None);
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let buf = b"<<".repeat(200);
        assert_eq!(value_end(&buf, 0), None);
    }

    #[test]
    fn filters_direct_and_array() {
        assert_eq!(filter_names(b"<< /Filter /DCTDecode /Length 3 >>"), vec![&b"DCTDecode"[..]]);
        assert_eq!(
            filter_names(b"<< /Filter [/FlateDecode /DCTDecode] >>"),
            vec![&b"FlateDecode"[..], &b"DCTDecode"[..]]
        );
        assert!(filter_names(b"<< /Length 3 >>").is_empty());
    }
}
