//! Removal of document-information entries from the textual parts of a PDF.

use log::debug;

use crate::error::Result;
use crate::pdf::{self, apply_edits, Edit};
use crate::scanner::{self, ByteSpan, ProtectedRegions};

/// Keys whose entries carry no rendering information.
pub const METADATA_KEYS: [&[u8]; 8] = [
    b"/Creator",
    b"/Producer",
    b"/CreationDate",
    b"/ModDate",
    b"/Title",
    b"/Author",
    b"/Subject",
    b"/Keywords",
];

/// Removes every metadata key together with its value. Only names in key
/// position of a dictionary (or standing loose outside any dictionary) count
/// as entries, so a `/Title` used as a value is kept. Stream bodies and xref
/// tables are never touched, and a key whose value cannot be delimited is left
/// alone. The result is never longer than the input.
pub fn strip(bytes: &[u8]) -> Result<Vec<u8>> {
    let regions = ProtectedRegions::scan(bytes);
    let edits = entries(bytes, &regions);
    if edits.is_empty() {
        return Ok(bytes.to_vec());
    }
    debug!("metadata: {} entries", edits.len());
    apply_edits(bytes, edits)
}

/// Keywords that end whatever object was being parsed.
const OBJECT_KEYWORDS: [&[u8]; 7] = [
    b"obj",
    b"endobj",
    b"stream",
    b"endstream",
    b"trailer",
    b"xref",
    b"startxref",
];

enum Frame {
    Dict { expect_key: bool },
    Array,
}

/// Marks the value of the innermost dictionary entry as consumed.
fn value_done(stack: &mut [Frame]) {
    if let Some(Frame::Dict { expect_key }) = stack.last_mut() {
        *expect_key = true;
    }
}

/// One deletion per metadata entry found outside protected regions, in
/// buffer order and never overlapping.
fn entries(buf: &[u8], regions: &ProtectedRegions) -> Vec<Edit> {
    let mut edits = Vec::new();
    for gap in regions.gaps(buf.len()) {
        let window = &buf[..gap.end];
        let mut stack: Vec<Frame> = Vec::new();
        let mut i = gap.start;
        while i < gap.end {
            match buf[i] {
                b'(' => {
                    i = pdf::literal_string_end(window, i).unwrap_or(gap.end);
                    value_done(&mut stack);
                }
                b'<' if window.get(i + 1) == Some(&b'<') => {
                    stack.push(Frame::Dict { expect_key: true });
                    i += 2;
                }
                b'<' => {
                    i = scanner::find(window, b">", i).map_or(gap.end, |at| at + 1);
                    value_done(&mut stack);
                }
                b'>' if window.get(i + 1) == Some(&b'>') => {
                    if matches!(stack.last(), Some(Frame::Dict { .. })) {
                        stack.pop();
                    }
                    value_done(&mut stack);
                    i += 2;
                }
                b'[' => {
                    stack.push(Frame::Array);
                    i += 1;
                }
                b']' => {
                    if matches!(stack.last(), Some(Frame::Array)) {
                        stack.pop();
                    }
                    value_done(&mut stack);
                    i += 1;
                }
                b'%' => {
                    while i < gap.end && !matches!(buf[i], b'\n' | b'\r') {
                        i += 1;
                    }
                }
                b'/' => {
                    let name_end = name_end(window, i + 1);
                    match stack.last_mut() {
                        Some(Frame::Dict { expect_key }) if !*expect_key => {
                            *expect_key = true;
                            i = name_end;
                        }
                        Some(Frame::Array) => i = name_end,
                        frame => {
                            let is_metadata = METADATA_KEYS.iter().any(|key| *key == &buf[i..name_end]);
                            match is_metadata.then(|| entry_end(buf, name_end, gap.end)).flatten() {
                                Some(end) => {
                                    edits.push(Edit::delete(ByteSpan::new(i, end)));
                                    i = end;
                                }
                                None => {
                                    if let Some(Frame::Dict { expect_key }) = frame {
                                        *expect_key = false;
                                    }
                                    i = name_end;
                                }
                            }
                        }
                    }
                }
                b if scanner::is_whitespace(b) || scanner::is_delimiter(b) => i += 1,
                _ => {
                    let run = name_end(window, i);
                    if OBJECT_KEYWORDS.contains(&&buf[i..run]) {
                        stack.clear();
                        i = run;
                    } else if matches!(stack.last(), Some(Frame::Dict { expect_key: false })) {
                        i = pdf::value_end(window, i).unwrap_or(run);
                        value_done(&mut stack);
                    } else {
                        i = run;
                    }
                }
            }
        }
    }
    edits
}

fn name_end(buf: &[u8], mut pos: usize) -> usize {
    while pos < buf.len() && !scanner::is_whitespace(buf[pos]) && !scanner::is_delimiter(buf[pos]) {
        pos += 1;
    }
    pos
}

/// End of the value following a key that ends at `key_end`, plus trailing
/// whitespace. The value must close before `limit`.
fn entry_end(buf: &[u8], key_end: usize, limit: usize) -> Option<usize> {
    let value_start = pdf::skip_whitespace(buf, key_end);
    if value_start >= limit || buf[value_start..].starts_with(b">>") {
        return None;
    }
    let end = pdf::value_end(&buf[..limit], value_start)?;
    let word = &buf[value_start..end];
    if buf[value_start].is_ascii_alphabetic() && !matches!(word, b"true" | b"false" | b"null") {
        return None;
    }
    Some(pdf::skip_whitespace(&buf[..limit], end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stripped(input: &[u8]) -> String {
        String::from_utf8(strip(input).unwrap()).unwrap()
    }

    #[test]
    fn removes_info_entries() {
        let out = stripped(b"<< /Title (Quarterly report) /Author (Somebody) /Pages 2 0 R >>");
        assert_eq!(out, "<< /Pages 2 0 R >>");
    }

    #[test]
    fn handles_compact_syntax_and_every_key() {
        let out = stripped(
            b"<</Creator(a)/Producer<FEFF0041>/CreationDate(D:2020)/ModDate(D:2021)\
              /Subject(s)/Keywords(k)/Type/Catalog>>",
        );
        assert_eq!(out, "<</Type/Catalog>>");
    }

    #[test]
    fn value_with_nested_parens_and_slashes() {
        let out = stripped(b"<< /Title (a (b) /Author c) /Root 1 0 R >>");
        assert_eq!(out, "<< /Root 1 0 R >>");
    }

    #[test]
    fn indirect_value_is_removed_whole() {
        let out = stripped(b"<< /Info 9 0 R /Title 7 0 R >>\n");
        assert_eq!(out, "<< /Info 9 0 R >>\n");
    }

    #[test]
    fn similar_names_are_kept() {
        let input = b"<< /Titles (x) /AuthorName (y) /Creator >>";
        assert_eq!(strip(input).unwrap(), input.to_vec());
    }

    #[test]
    fn stream_bodies_are_untouched() {
        let input = b"1 0 obj\n<< /Length 20 >>\nstream\n/Title (inside body)\nendstream\nendobj\n";
        assert_eq!(strip(input).unwrap(), input.to_vec());
    }

    #[test]
    fn keys_inside_strings_are_not_entries() {
        let input = b"<< /Contents (see /Title (x) here) >>";
        assert_eq!(strip(input).unwrap(), input.to_vec());
    }

    #[test]
    fn unterminated_value_is_left_alone() {
        let input = b"%PDF-1.4\n<< /Title (never closed";
        assert_eq!(strip(input).unwrap(), input.to_vec());
    }

    #[test]
    fn names_in_value_position_are_kept() {
        let input = b"<< /Type /StructElem /S /Title /P 5 0 R /K 0 >>";
        assert_eq!(strip(input).unwrap(), input.to_vec());
        let input = b"<< /Names [/Title (x)] /Author /Title >>";
        assert_eq!(stripped(input), "<< /Names [/Title (x)] >>");
    }

    #[test]
    fn nested_dictionaries_are_walked() {
        let out = stripped(b"<< /Info << /Title (x) /Lang (en) >> /Kids [<< /Author (a) >>] >>");
        assert_eq!(out, "<< /Info << /Lang (en) >> /Kids [<< >>] >>");
    }

    #[test]
    fn keyword_is_not_a_value() {
        let input = b"1 0 obj\n<< /Title\nendobj\n";
        assert_eq!(strip(input).unwrap(), input.to_vec());
    }

    #[test]
    fn never_grows() {
        let input = b"%PDF-1.7\n/Creator (Test)\n%%EOF\n";
        let out = strip(input).unwrap();
        assert!(out.len() < input.len());
        assert!(!out.windows(8).any(|w| w == b"/Creator"));
    }
}
