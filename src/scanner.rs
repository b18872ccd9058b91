//! Byte-level scanning of opaque buffers.
//!
//! Nothing here decodes text: every search is a byte-pattern match. Spans are
//! half-open and refer to the buffer they were produced from; any rewrite of
//! that buffer invalidates them.

use std::ops::Range;

pub const PNG_SIGNATURE: &[u8; 8] = b"\x89PNG\r\n\x1a\n";
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// A half-open `[start, end)` range into a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSpan {
    pub start: usize,
    pub end: usize,
}

impl ByteSpan {
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    pub fn contains(&self, pos: usize) -> bool {
        self.start <= pos && pos < self.end
    }

    pub fn overlaps(&self, other: &ByteSpan) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// PDF whitespace characters.
pub fn is_whitespace(b: u8) -> bool {
    matches!(b, b'\0' | b'\t' | b'\n' | b'\x0c' | b'\r' | b' ')
}

/// PDF delimiter characters.
pub fn is_delimiter(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'<' | b'>' | b'[' | b']' | b'{' | b'}' | b'/' | b'%'
    )
}

/// First occurrence of `needle` at or after `from`.
pub fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    Jpeg,
    Png,
}

/// End (exclusive) of a JPEG starting at `start`, found by walking marker
/// segments and skipping entropy-coded data. `None` if the stream is
/// malformed or runs off the end of the buffer.
pub fn jpeg_end(buf: &[u8], start: usize) -> Option<usize> {
    if buf.get(start..start + 2)? != JPEG_SOI {
        return None;
    }
    let len = buf.len();
    let mut pos = start + 2;
    loop {
        if *buf.get(pos)? != 0xFF {
            return None;
        }
        while pos < len && buf[pos] == 0xFF {
            pos += 1;
        }
        let marker = *buf.get(pos)?;
        pos += 1;
        match marker {
            0xD9 => return Some(pos),
            0x00 | 0xD8 => return None,
            0x01 | 0xD0..=0xD7 => continue,
            _ => {
                let seg = buf.get(pos..pos + 2)?;
                let seg_len = u16::from_be_bytes([seg[0], seg[1]]) as usize;
                if seg_len < 2 {
                    return None;
                }
                pos += seg_len;
                if pos > len {
                    return None;
                }
                if marker == 0xDA {
                    pos = skip_entropy_data(buf, pos)?;
                }
            }
        }
    }
}

/// Returns the offset of the next real marker after entropy-coded data.
fn skip_entropy_data(buf: &[u8], mut pos: usize) -> Option<usize> {
    while pos + 1 < buf.len() {
        if buf[pos] == 0xFF {
            match buf[pos + 1] {
                0x00 | 0xD0..=0xD7 => pos += 2,
                0xFF => pos += 1,
                _ => return Some(pos),
            }
        } else {
            pos += 1;
        }
    }
    None
}

/// End (exclusive) of a PNG starting at `start`: the IEND chunk including
/// its CRC. Chunks are walked by length, so `IEND` bytes inside image data
/// do not end the span.
pub fn png_end(buf: &[u8], start: usize) -> Option<usize> {
    if buf.get(start..start + 8)? != PNG_SIGNATURE {
        return None;
    }
    let mut pos = start + 8;
    loop {
        let header = buf.get(pos..pos + 8)?;
        let chunk_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let chunk_type = &header[4..8];
        if chunk_len > i32::MAX as usize || !chunk_type.iter().all(u8::is_ascii_alphabetic) {
            return None;
        }
        let end = pos.checked_add(12 + chunk_len)?;
        if end > buf.len() {
            return None;
        }
        if chunk_type == b"IEND" {
            return Some(end);
        }
        pos = end;
    }
}

/// Lazily yields non-overlapping embedded image spans, earliest first.
///
/// A signature whose span cannot be closed, or whose span is not longer than
/// `min_len`, is skipped and scanning resumes one byte later.
pub struct ImageSpans<'a> {
    buf: &'a [u8],
    pos: usize,
    min_len: usize,
}

impl<'a> ImageSpans<'a> {
    pub fn new(buf: &'a [u8], from: usize, min_len: usize) -> Self {
        Self {
            buf,
            pos: from,
            min_len,
        }
    }

    fn next_signature(&self) -> Option<(ImageKind, usize)> {
        let buf = self.buf;
        let mut i = self.pos;
        while i < buf.len() {
            match buf[i] {
                0xFF if buf.get(i + 1) == Some(&0xD8) && buf.get(i + 2) == Some(&0xFF) => {
                    return Some((ImageKind::Jpeg, i))
                }
                0x89 if buf[i..].starts_with(PNG_SIGNATURE) => return Some((ImageKind::Png, i)),
                _ => i += 1,
            }
        }
        None
    }
}

impl Iterator for ImageSpans<'_> {
    type Item = (ImageKind, ByteSpan);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (kind, start) = self.next_signature()?;
            let end = match kind {
                ImageKind::Jpeg => jpeg_end(self.buf, start),
                ImageKind::Png => png_end(self.buf, start),
            };
            match end {
                Some(end) if end - start > self.min_len => {
                    self.pos = end;
                    return Some((kind, ByteSpan::new(start, end)));
                }
                _ => self.pos = start + 1,
            }
        }
    }
}

/// Offset of the next `keyword` at or after `from` that stands as its own
/// token (not part of a longer name or keyword).
pub fn find_token(buf: &[u8], keyword: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;
    while let Some(at) = find(buf, keyword, pos) {
        let before_ok = at == 0 || {
            let b = buf[at - 1];
            is_whitespace(b) || is_delimiter(b) || keyword[0] == b'/'
        };
        let after_ok = buf
            .get(at + keyword.len())
            .map_or(true, |&b| is_whitespace(b) || is_delimiter(b));
        if before_ok && after_ok {
            return Some(at);
        }
        pos = at + 1;
    }
    None
}

/// Lazily yields stream body spans: from just after the EOL following a
/// `stream` keyword up to the `endstream` keyword.
///
/// When the stream dictionary declares a direct `/Length` and an `endstream`
/// keyword follows the body it delimits, that keyword closes the body, so
/// `endstream` bytes inside the data do not end it early. Otherwise the first
/// `endstream` after the body closes it; if further `stream` openings appear
/// before that keyword, the last of them is paired instead. A body is only
/// emitted once it is closed.
pub struct StreamBodies<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> StreamBodies<'a> {
    pub fn new(buf: &'a [u8], from: usize) -> Self {
        Self { buf, pos: from }
    }
}

/// Offset of the body start for a `stream` keyword at `at`, if the keyword is
/// well formed there.
fn stream_body_start(buf: &[u8], at: usize) -> Option<usize> {
    if at > 0 && !(is_whitespace(buf[at - 1]) || is_delimiter(buf[at - 1])) {
        return None;
    }
    let after = at + b"stream".len();
    match (buf.get(after), buf.get(after + 1)) {
        (Some(b'\r'), Some(b'\n')) => Some(after + 2),
        (Some(b'\n'), _) | (Some(b'\r'), _) => Some(after + 1),
        _ => None,
    }
}

/// First well-formed `stream` keyword starting in `from..limit`.
fn next_stream_open(buf: &[u8], from: usize, limit: usize) -> Option<(usize, usize)> {
    let window = &buf[..limit.min(buf.len())];
    let mut pos = from;
    while let Some(at) = find(window, b"stream", pos) {
        if let Some(body) = stream_body_start(buf, at) {
            return Some((at, body));
        }
        pos = at + 1;
    }
    None
}

/// Direct `/Length` of the dictionary that ends at `to`, looking no further
/// back than `from` or the last `obj` keyword. `None` for indirect lengths.
fn declared_length(buf: &[u8], from: usize, to: usize) -> Option<usize> {
    let dict = &buf[from..to];
    let mut start = 0;
    while let Some(at) = find_token(dict, b"obj", start) {
        start = at + b"obj".len();
    }
    let mut key = None;
    let mut pos = start;
    while let Some(at) = find_token(dict, b"/Length", pos) {
        pos = at + b"/Length".len();
        key = Some(pos);
    }

    let mut i = key?;
    while i < dict.len() && is_whitespace(dict[i]) {
        i += 1;
    }
    let digits_start = i;
    while i < dict.len() && dict[i].is_ascii_digit() {
        i += 1;
    }
    if i == digits_start || i - digits_start > 18 {
        return None;
    }
    let value = std::str::from_utf8(&dict[digits_start..i]).ok()?.parse().ok()?;
    while i < dict.len() && is_whitespace(dict[i]) {
        i += 1;
    }
    if dict.get(i).map_or(false, u8::is_ascii_digit) {
        return None;
    }
    Some(value)
}

/// Offset of the `endstream` keyword that follows a body of `len` bytes
/// starting at `body`, allowing only whitespace in between.
fn endstream_after(buf: &[u8], body: usize, len: usize) -> Option<usize> {
    let mut i = body.checked_add(len)?;
    if i > buf.len() {
        return None;
    }
    while i < buf.len() && is_whitespace(buf[i]) {
        i += 1;
    }
    buf[i..].starts_with(b"endstream").then_some(i)
}

impl Iterator for StreamBodies<'_> {
    type Item = ByteSpan;

    fn next(&mut self) -> Option<ByteSpan> {
        let buf = self.buf;
        let (at, mut body) = next_stream_open(buf, self.pos, buf.len())?;
        let declared = declared_length(buf, self.pos.min(at), at)
            .and_then(|len| endstream_after(buf, body, len));
        let close = match declared {
            Some(close) => close,
            None => {
                let close = find(buf, b"endstream", body)?;
                while let Some((_, later)) = next_stream_open(buf, body, close) {
                    body = later;
                }
                close
            }
        };
        self.pos = close + b"endstream".len();
        Some(ByteSpan::new(body, close))
    }
}

/// Span of a classic cross-reference table: from the `xref` keyword up to the
/// `trailer` keyword.
pub fn xref_tables(buf: &[u8]) -> Vec<ByteSpan> {
    let mut tables = Vec::new();
    let mut pos = 0;
    while let Some(at) = find_token(buf, b"xref", pos) {
        let line_start = at == 0 || matches!(buf[at - 1], b'\n' | b'\r');
        let followed_by_eol = matches!(buf.get(at + 4), Some(b'\n' | b'\r' | b' '));
        if line_start && followed_by_eol {
            let Some(trailer) = find(buf, b"trailer", at) else {
                break;
            };
            tables.push(ByteSpan::new(at, trailer));
            pos = trailer;
            continue;
        }
        pos = at + 4;
    }
    tables
}

/// Byte ranges that textual passes must not touch: stream bodies, xref
/// tables, and raster images sitting outside any stream. Sorted and
/// non-overlapping.
#[derive(Debug, Clone, Default)]
pub struct ProtectedRegions {
    spans: Vec<ByteSpan>,
}

impl ProtectedRegions {
    pub fn scan(buf: &[u8]) -> Self {
        let mut spans: Vec<ByteSpan> = StreamBodies::new(buf, 0).collect();
        for table in xref_tables(buf) {
            if !spans.iter().any(|s| s.overlaps(&table)) {
                spans.push(table);
            }
        }
        spans.sort();
        let mut regions = Self { spans };
        let loose: Vec<ByteSpan> = ImageSpans::new(buf, 0, 0)
            .map(|(_, span)| span)
            .filter(|span| !regions.overlaps(span))
            .collect();
        if !loose.is_empty() {
            regions.spans.extend(loose);
            regions.spans.sort();
        }
        regions
    }

    fn overlaps(&self, span: &ByteSpan) -> bool {
        let idx = self.spans.partition_point(|s| s.end <= span.start);
        self.spans.get(idx).map_or(false, |s| s.overlaps(span))
    }

    pub fn spans(&self) -> &[ByteSpan] {
        &self.spans
    }

    /// The protected span containing `pos`, if any.
    pub fn containing(&self, pos: usize) -> Option<ByteSpan> {
        let idx = self.spans.partition_point(|s| s.end <= pos);
        self.spans.get(idx).filter(|s| s.contains(pos)).copied()
    }

    /// The unprotected stretches of a buffer of length `len`, in order.
    pub fn gaps(&self, len: usize) -> Vec<ByteSpan> {
        let mut gaps = Vec::with_capacity(self.spans.len() + 1);
        let mut cursor = 0;
        for span in &self.spans {
            if span.start > cursor {
                gaps.push(ByteSpan::new(cursor, span.start.min(len)));
            }
            cursor = cursor.max(span.end);
        }
        if cursor < len {
            gaps.push(ByteSpan::new(cursor, len));
        }
        gaps
    }
}
