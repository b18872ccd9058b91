//! Keeping offsets honest after byte-level edits: stream `/Length` entries
//! and the classic cross-reference table.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use lazy_static::lazy_static;
use log::{debug, info};
use regex::bytes::{NoExpand, Regex};

use crate::pdf::{object_headers, parse_decimal, skip_whitespace, value_end, Edit, ObjectHeader};
use crate::scanner::{self, ByteSpan, ProtectedRegions};

/// Largest object number a conforming reader has to accept.
const MAX_OBJECT_NUMBER: u32 = 8_388_607;

lazy_static! {
    static ref LENGTH: Regex =
        Regex::new(r"(?-u)/Length[\x00\t\n\x0c\r ]+(\d+)(?:[\x00\t\n\x0c\r ]+(\d+)[\x00\t\n\x0c\r ]+R)?").unwrap();
    static ref SIZE: Regex = Regex::new(r"(?-u)/Size[\x00\t\n\x0c\r ]+\d+").unwrap();
    static ref PREV: Regex = Regex::new(r"(?-u)/Prev[\x00\t\n\x0c\r ]+\d+[\x00\t\n\x0c\r ]*").unwrap();
    static ref XREF_STREAM: Regex =
        Regex::new(r"(?-u)/Type[\x00\t\n\x0c\r ]*/XRef(?:[\x00\t\n\x0c\r /<>\[\]()]|$)").unwrap();
}

/// The digits holding a stream's length, either in its own dictionary or in
/// the indirect object it refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthField {
    pub digits: ByteSpan,
    pub value: u64,
}

impl LengthField {
    /// Edit that keeps the declared length in step with a body segment of
    /// `old_len` bytes being replaced by `new_len` bytes.
    pub fn edit(&self, old_len: usize, new_len: usize) -> Edit {
        let value = self
            .value
            .checked_sub(old_len as u64)
            .map_or(new_len as u64, |rest| rest + new_len as u64);
        Edit::new(self.digits, value.to_string().into_bytes())
    }
}

/// Locates `/Length` in the stream dictionary `dict`. Indirect lengths are
/// resolved through `headers`, the last definition of an object winning.
pub fn stream_length(buf: &[u8], dict: ByteSpan, headers: &[ObjectHeader]) -> Option<LengthField> {
    let caps = LENGTH.captures(&buf[dict.range()])?;
    let first = caps.get(1)?;
    let Some(generation) = caps.get(2) else {
        return Some(LengthField {
            digits: ByteSpan::new(dict.start + first.start(), dict.start + first.end()),
            value: parse_decimal(first.as_bytes())?,
        });
    };

    let number = u32::try_from(parse_decimal(first.as_bytes())?).ok()?;
    let generation = u16::try_from(parse_decimal(generation.as_bytes())?).ok()?;
    let header = headers
        .iter()
        .rev()
        .find(|h| h.number == number && h.generation == generation)?;
    let start = skip_whitespace(buf, header.span.end);
    let mut end = start;
    while end < buf.len() && buf[end].is_ascii_digit() {
        end += 1;
    }
    let after = skip_whitespace(buf, end);
    if end == start || !buf[after..].starts_with(b"endobj") {
        return None;
    }
    Some(LengthField {
        digits: ByteSpan::new(start, end),
        value: parse_decimal(&buf[start..end])?,
    })
}

/// Whether offsets live in cross-reference streams, which byte edits cannot
/// keep in step: a hybrid `/XRefStm` trailer, or an `/XRef` object and no
/// classic table at all.
pub fn uses_xref_streams(buf: &[u8]) -> bool {
    scanner::find_token(buf, b"/XRefStm", 0).is_some()
        || (XREF_STREAM.is_match(buf) && scanner::xref_tables(buf).is_empty())
}

/// Rewrites the last classic cross-reference table from the object headers
/// actually present, then the trailer's `/Size` and the `startxref` offset.
/// Earlier sections are orphaned by dropping `/Prev`.
///
/// Returns `None` when the document uses cross-reference streams, has no
/// classic table, or its trailer cannot be read.
pub fn rebuild(buf: &[u8]) -> Option<Vec<u8>> {
    if scanner::find_token(buf, b"/XRefStm", 0).is_some() {
        debug!("hybrid cross-reference, table left as is");
        return None;
    }
    let table = *scanner::xref_tables(buf).last()?;
    let dict_start = skip_whitespace(buf, table.end + b"trailer".len());
    if !buf[dict_start..].starts_with(b"<<") {
        return None;
    }
    let dict_end = value_end(buf, dict_start)?;

    let regions = ProtectedRegions::scan(buf);
    let mut offsets: BTreeMap<u32, (usize, u16)> = BTreeMap::new();
    for header in object_headers(buf, &regions) {
        if header.span.start >= table.start {
            break;
        }
        offsets.insert(header.number, (header.span.start, header.generation));
    }
    let size = offsets.keys().next_back().map_or(1, |n| n + 1);
    if size > MAX_OBJECT_NUMBER || size as usize * 20 > buf.len().saturating_mul(4) {
        debug!("object numbering too sparse to tabulate ({} entries)", size);
        return None;
    }

    let mut out = Vec::with_capacity(table.start + size as usize * 20 + 128);
    out.extend_from_slice(&buf[..table.start]);
    if !matches!(out.last(), Some(b'\n' | b'\r')) {
        out.push(b'\n');
    }
    let xref_offset = out.len();

    let mut section = String::with_capacity(size as usize * 20 + 16);
    let _ = write!(section, "xref\n0 {}\n0000000000 65535 f \n", size);
    for number in 1..size {
        match offsets.get(&number) {
            Some((offset, generation)) => {
                let _ = write!(section, "{:010} {:05} n \n", offset, generation);
            }
            None => section.push_str("0000000000 65535 f \n"),
        }
    }
    section.push_str("trailer\n");
    out.extend_from_slice(section.as_bytes());

    let trailer = &buf[dict_start..dict_end];
    let size_entry = format!("/Size {}", size);
    let trailer = if SIZE.is_match(trailer) {
        SIZE.replace(trailer, NoExpand(size_entry.as_bytes())).into_owned()
    } else {
        let mut with_size = b"<< ".to_vec();
        with_size.extend_from_slice(size_entry.as_bytes());
        with_size.extend_from_slice(&trailer[2..]);
        with_size
    };
    let trailer = PREV.replace_all(&trailer, NoExpand(b"")).into_owned();
    out.extend_from_slice(&trailer);
    out.extend_from_slice(format!("\nstartxref\n{}\n%%EOF\n", xref_offset).as_bytes());

    info!(
        "cross-reference table rebuilt: {} objects, startxref {}",
        offsets.len(),
        xref_offset
    );
    Some(out)
}
