//! `Encapsulated` header handling.
//!
//! The header value is a comma-separated list of `key=offset` pairs. Offsets
//! are relative to the start of the encapsulated area, i.e. the first byte
//! after the blank line that ends the ICAP header block. Pairs are sorted by
//! offset and turned into contiguous ranges: each range ends where the next
//! one starts, and the last one is open. Offsets above
//! [`MAX_FRAME_BYTES`](crate::MAX_FRAME_BYTES) are rejected.

use crate::MAX_FRAME_BYTES;
use crate::error::ParseErrorKind;
use crate::request::EncapsulationKind;

/// A section of the encapsulated area.
///
/// `end` is the exclusive bound, equal to the next entry's `start`; the last
/// byte of a closed range is therefore `end - 1`. `None` marks the open,
/// final range which runs to the end of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncapsulationRange {
    pub kind: EncapsulationKind,
    pub start: usize,
    pub end: Option<usize>,
}

impl EncapsulationRange {
    #[inline]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Byte length of a closed range.
    pub fn len(&self) -> Option<usize> {
        self.end.map(|e| e - self.start)
    }

    /// Inclusive index of the last byte of a non-empty closed range.
    pub fn last_byte(&self) -> Option<usize> {
        self.end.and_then(|e| e.checked_sub(1)).filter(|&e| e >= self.start)
    }
}

/// Rejected `Encapsulated` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulatedError {
    pub kind: ParseErrorKind,
    pub detail: String,
}

impl EncapsulatedError {
    fn new(kind: ParseErrorKind, detail: String) -> Self {
        Self { kind, detail }
    }
}

/// Parse the value of the `Encapsulated:` header into ordered ranges.
pub fn parse_encapsulated_value(val: &str) -> Result<Vec<EncapsulationRange>, EncapsulatedError> {
    let mut starts: Vec<(EncapsulationKind, usize)> = Vec::new();

    for part in val.split(',') {
        let p = part.trim();
        if p.is_empty() {
            continue;
        }
        let Some((name_raw, off_raw)) = p.split_once('=') else {
            return Err(EncapsulatedError::new(
                ParseErrorKind::UnparsableOffset,
                format!("Encapsulated entry without offset: {p}"),
            ));
        };

        let name = name_raw.trim().to_ascii_lowercase();
        let kind = EncapsulationKind::from_key(&name).ok_or_else(|| {
            EncapsulatedError::new(
                ParseErrorKind::UnknownEncapsulationKey,
                format!("invalid Encapsulated part name: {}", name_raw.trim()),
            )
        })?;
        let off: usize = off_raw.trim().parse().map_err(|_| {
            EncapsulatedError::new(
                ParseErrorKind::UnparsableOffset,
                format!("Encapsulated {name} value was not a number: {}", off_raw.trim()),
            )
        })?;
        if off > MAX_FRAME_BYTES {
            return Err(EncapsulatedError::new(
                ParseErrorKind::UnparsableOffset,
                format!("Encapsulated {name} offset {off} exceeds {MAX_FRAME_BYTES} bytes"),
            ));
        }
        starts.push((kind, off));
    }

    if starts.is_empty() {
        return Err(EncapsulatedError::new(
            ParseErrorKind::UnparsableOffset,
            "empty Encapsulated value".to_string(),
        ));
    }

    // stable: entries sharing an offset keep their declared order
    starts.sort_by_key(|&(_, off)| off);

    let ranges = starts
        .iter()
        .enumerate()
        .map(|(i, &(kind, start))| EncapsulationRange {
            kind,
            start,
            end: starts.get(i + 1).map(|&(_, next)| next),
        })
        .collect();
    Ok(ranges)
}

/// Find the `Encapsulated:` value in a raw ICAP header block.
pub fn find_encapsulated_value(headers_text: &str) -> Option<&str> {
    // first line is the request line
    for line in headers_text.split("\r\n").skip(1) {
        if line.is_empty() {
            break;
        }
        let Some((name, val)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("Encapsulated") {
            return Some(val);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn ranges_are_contiguous_and_last_is_open() {
        let r = parse_encapsulated_value("req-hdr=0, res-hdr=137, res-body=296").expect("parse");
        assert_eq!(r.len(), 3);
        assert_eq!(r[0].kind, EncapsulationKind::RequestHeader);
        assert_eq!(r[0].last_byte(), Some(136));
        assert_eq!(r[1].start, 137);
        assert_eq!(r[1].len(), Some(159));
        assert_eq!(r[1].last_byte().unwrap() + 1, r[2].start);
        assert!(r[2].is_open());
        assert_eq!(r[2].len(), None);
    }

    #[test]
    fn out_of_order_offsets_are_sorted() {
        let r = parse_encapsulated_value("null-body=170,req-hdr=0").expect("parse");
        assert_eq!(r[0].kind, EncapsulationKind::RequestHeader);
        assert_eq!(r[0].end, Some(170));
        assert_eq!(r[1].kind, EncapsulationKind::NullBody);
        assert!(r[1].is_open());
    }

    #[test]
    fn shared_offset_gives_empty_range() {
        let r = parse_encapsulated_value("req-hdr=0, res-hdr=0, null-body=10").expect("parse");
        assert_eq!(r[0].kind, EncapsulationKind::RequestHeader);
        assert_eq!(r[0].len(), Some(0));
        assert_eq!(r[0].last_byte(), None);
        assert_eq!(r[1].kind, EncapsulationKind::ResponseHeader);
        assert_eq!(r[1].len(), Some(10));
    }

    #[test]
    fn keys_ignore_case_and_whitespace() {
        let r = parse_encapsulated_value("  REQ-HDR = 0 ,  Null-Body=12 ").expect("parse");
        assert_eq!(r[0].kind, EncapsulationKind::RequestHeader);
        assert_eq!(r[1].start, 12);
    }

    #[rstest]
    #[case("req-hdr=0, bad=10", ParseErrorKind::UnknownEncapsulationKey)]
    #[case("req-hdr=zero", ParseErrorKind::UnparsableOffset)]
    #[case("req-hdr=-5", ParseErrorKind::UnparsableOffset)]
    #[case("req-hdr", ParseErrorKind::UnparsableOffset)]
    #[case("   ", ParseErrorKind::UnparsableOffset)]
    #[case("req-hdr=0, null-body=18446744073709551615", ParseErrorKind::UnparsableOffset)]
    #[case("req-hdr=0, null-body=18446744073709551616", ParseErrorKind::UnparsableOffset)]
    #[case("req-hdr=0, null-body=8388609", ParseErrorKind::UnparsableOffset)]
    fn rejects_invalid_values(#[case] value: &str, #[case] kind: ParseErrorKind) {
        let err = parse_encapsulated_value(value).unwrap_err();
        assert_eq!(err.kind, kind, "{}", err.detail);
    }

    #[test]
    fn offset_at_frame_limit_is_accepted() {
        let value = format!("req-hdr=0, null-body={MAX_FRAME_BYTES}");
        let r = parse_encapsulated_value(&value).expect("parse");
        assert_eq!(r[1].start, MAX_FRAME_BYTES);
    }

    #[test]
    fn finds_value_in_header_block() {
        let head = "REQMOD icap://x/ ICAP/1.0\r\nHost: x\r\nencapsulated: req-hdr=0\r\n\r\n";
        assert_eq!(find_encapsulated_value(head).map(str::trim), Some("req-hdr=0"));
        assert_eq!(find_encapsulated_value("OPTIONS icap://x/ ICAP/1.0\r\n\r\n"), None);
    }
}
