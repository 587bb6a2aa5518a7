use std::borrow::Cow;
use std::io::Write;

use crate::ICAP_VERSION;
use crate::parser::encapsulated::{self, EncapsulationRange};
use crate::response::Response;

/// Find end of a header block (position after CRLFCRLF).
#[inline]
pub fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    memchr::memmem::find(buf, b"\r\n\r\n").map(|i| i + 4)
}

/// Result of scanning an ICAP-chunked body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkScan {
    /// Body ends at this absolute position (after the terminating CRLF).
    Complete(usize),
    /// More bytes are needed.
    Incomplete,
    /// A chunk-size line is not hexadecimal, or its size cannot fit in memory.
    Invalid,
}

/// Parse a single chunk: returns (next_pos, is_final_zero).
fn parse_one_chunk(buf: &[u8], from: usize) -> Result<Option<(usize, bool)>, ()> {
    let Some(rel) = memchr::memmem::find(&buf[from..], b"\r\n") else {
        return Ok(None);
    };
    let size_line = &buf[from..from + rel];
    // chunk extensions such as `; ieof`
    let size_hex = size_line.split(|&b| b == b';').next().unwrap_or(size_line);
    let size_str = std::str::from_utf8(size_hex).map_err(|_| ())?.trim();
    let size = usize::from_str_radix(size_str, 16).map_err(|_| ())?;

    let after_size = from + rel + 2;
    let need = after_size
        .checked_add(size)
        .and_then(|n| n.checked_add(2))
        .ok_or(())?;
    if buf.len() < need {
        return Ok(None);
    }
    if size == 0 {
        if &buf[after_size..after_size + 2] != b"\r\n" {
            return Err(());
        }
        return Ok(Some((need, true)));
    }
    Ok(Some((need, false)))
}

/// Walk chunks starting at `pos` until the zero-size chunk.
pub fn scan_chunked(buf: &[u8], mut pos: usize) -> ChunkScan {
    loop {
        if pos >= buf.len() {
            return ChunkScan::Incomplete;
        }
        match parse_one_chunk(buf, pos) {
            Ok(Some((next, true))) => return ChunkScan::Complete(next),
            Ok(Some((next, false))) => pos = next,
            Ok(None) => return ChunkScan::Incomplete,
            Err(()) => return ChunkScan::Invalid,
        }
    }
}

/// Length of the first complete ICAP message in `buf`, judged by the
/// message's own header block and `Encapsulated` offsets.
///
/// Returns `None` while more bytes are needed. A header block whose
/// `Encapsulated` value cannot be read is returned on its own so the parser
/// can report it.
pub fn delimited_frame_len(buf: &[u8]) -> Option<usize> {
    let h_end = find_double_crlf(buf)?;
    let head = String::from_utf8_lossy(&buf[..h_end]);

    let Some(value) = encapsulated::find_encapsulated_value(&head) else {
        return Some(h_end);
    };
    let ranges: Vec<EncapsulationRange> = match encapsulated::parse_encapsulated_value(value) {
        Ok(r) => r,
        Err(_) => return Some(h_end),
    };
    let Some(last) = ranges.last() else {
        return Some(h_end);
    };

    let Some(last_abs) = h_end.checked_add(last.start) else {
        return Some(h_end);
    };
    if buf.len() < last_abs {
        return None;
    }

    if last.kind.is_body() {
        match scan_chunked(buf, last_abs) {
            ChunkScan::Complete(end) => Some(end),
            ChunkScan::Incomplete => None,
            ChunkScan::Invalid => Some(buf.len()),
        }
    } else if last.kind.is_header() {
        find_double_crlf(&buf[last_abs..]).map(|n| last_abs + n)
    } else {
        Some(last_abs)
    }
}

/// Write one chunk into an already-assembled buffer.
pub fn write_chunk_into(out: &mut Vec<u8>, data: &[u8]) {
    // writing into a Vec cannot fail
    let _ = write!(out, "{:X}\r\n", data.len());
    if !data.is_empty() {
        out.extend_from_slice(data);
    }
    out.extend_from_slice(b"\r\n");
}

/// Serialize a response: status line, headers without any caller `ISTag`,
/// the service `ISTag`, blank line, the body if any, then a closing CRLF.
pub fn serialize_icap_response(resp: &Response, istag: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + resp.body.as_ref().map_or(0, Vec::len));
    let _ = write!(
        out,
        "{} {} {}\r\n",
        ICAP_VERSION,
        resp.status_code.as_u16(),
        resp.status_code.reason()
    );

    for (name, value) in resp.headers.iter() {
        if name.trim().eq_ignore_ascii_case("ISTag") {
            continue;
        }
        let _ = write!(out, "{}: {}\r\n", canon_icap_header(name.trim()), value);
    }
    let _ = write!(out, "ISTag: \"{}\"\r\n", istag.trim_matches('"'));
    out.extend_from_slice(b"\r\n");

    if let Some(body) = &resp.body {
        out.extend_from_slice(body);
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Return canonical ICAP header name (title-cased, with special-cases).
pub fn canon_icap_header(name: &str) -> Cow<'_, str> {
    let lower = name.to_ascii_lowercase();
    let fixed = match lower.as_str() {
        "methods" => "Methods",
        "istag" => "ISTag",
        "encapsulated" => "Encapsulated",
        "service" => "Service",
        "max-connections" => "Max-Connections",
        "options-ttl" => "Options-TTL",
        "preview" => "Preview",
        "allow" => "Allow",
        "service-id" => "Service-ID",
        "opt-body-type" => "Opt-body-type",
        "transfer-preview" => "Transfer-Preview",
        "transfer-ignore" => "Transfer-Ignore",
        "transfer-complete" => "Transfer-Complete",
        _ => {
            if name == lower.as_str() {
                // Title-Case each hyphen-separated token.
                let mut out = String::with_capacity(name.len());
                for (i, seg) in name.split('-').enumerate() {
                    if i > 0 {
                        out.push('-');
                    }
                    let mut chars = seg.chars();
                    if let Some(c0) = chars.next() {
                        out.extend(c0.to_uppercase());
                        out.extend(chars);
                    }
                }
                return Cow::Owned(out);
            }
            return Cow::Borrowed(name);
        }
    };
    Cow::Borrowed(fixed)
}
