//! ICAP response types.
//!
//! This module defines:
//! - [`StatusCode`]: ICAP status codes (RFC 3507) with their reason phrases.
//! - [`Response`]: a response to send, consumed once by the serializer.
//!
//! Any `ISTag` a caller puts on a [`Response`] is ignored on the wire: the
//! serializer always writes exactly one `ISTag` carrying the process-wide
//! service tag.
//!
//! # Examples
//!
//! ```rust
//! use icap_filter::{Response, StatusCode};
//!
//! let resp = Response::no_content().add_header("ISTag", "ignored");
//! let raw = resp.to_raw("filter-1.0");
//! let text = String::from_utf8(raw).unwrap();
//!
//! assert!(text.starts_with("ICAP/1.0 204 No Content\r\n"));
//! assert!(text.contains("ISTag: \"filter-1.0\"\r\n"));
//! assert!(!text.contains("ignored"));
//! assert_eq!(resp.status_code, StatusCode::NoContent204);
//! ```

use std::fmt;
use std::str::FromStr;

use http::{Request as HttpRequest, Response as HttpResponse};
use tracing::trace;

use crate::ICAP_VERSION;
use crate::error::{Error, IcapResult};
use crate::headers::Headers;
use crate::parser::http_embed::{serialize_http_request_head, serialize_http_response_head};
use crate::parser::wire::{find_double_crlf, serialize_icap_response, write_chunk_into};

/// ICAP status codes as defined in RFC 3507.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Continue100,
    Ok200,
    NoContent204,
    PartialContent206,
    BadRequest400,
    NotFound404,
    MethodNotAllowed405,
    RequestTimeout408,
    RequestEntityTooLarge413,
    InternalServerError500,
    NotImplemented501,
    BadGateway502,
    ServiceUnavailable503,
    VersionNotSupported505,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        match self {
            StatusCode::Continue100 => 100,
            StatusCode::Ok200 => 200,
            StatusCode::NoContent204 => 204,
            StatusCode::PartialContent206 => 206,
            StatusCode::BadRequest400 => 400,
            StatusCode::NotFound404 => 404,
            StatusCode::MethodNotAllowed405 => 405,
            StatusCode::RequestTimeout408 => 408,
            StatusCode::RequestEntityTooLarge413 => 413,
            StatusCode::InternalServerError500 => 500,
            StatusCode::NotImplemented501 => 501,
            StatusCode::BadGateway502 => 502,
            StatusCode::ServiceUnavailable503 => 503,
            StatusCode::VersionNotSupported505 => 505,
        }
    }

    /// Reason phrase written on the status line.
    pub fn reason(&self) -> &'static str {
        match self {
            StatusCode::Continue100 => "Continue",
            StatusCode::Ok200 => "OK",
            StatusCode::NoContent204 => "No Content",
            StatusCode::PartialContent206 => "Partial Content",
            StatusCode::BadRequest400 => "Bad Request",
            StatusCode::NotFound404 => "Service Not Found",
            StatusCode::MethodNotAllowed405 => "Method Not Allowed",
            StatusCode::RequestTimeout408 => "Request Timeout",
            StatusCode::RequestEntityTooLarge413 => "Request Entity Too Large",
            StatusCode::InternalServerError500 => "Internal Server Error",
            StatusCode::NotImplemented501 => "Method Not Implemented",
            StatusCode::BadGateway502 => "Bad Gateway",
            StatusCode::ServiceUnavailable503 => "Service Unavailable",
            StatusCode::VersionNotSupported505 => "ICAP Version Not Supported",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = &'static str;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        Ok(match v {
            100 => StatusCode::Continue100,
            200 => StatusCode::Ok200,
            204 => StatusCode::NoContent204,
            206 => StatusCode::PartialContent206,
            400 => StatusCode::BadRequest400,
            404 => StatusCode::NotFound404,
            405 => StatusCode::MethodNotAllowed405,
            408 => StatusCode::RequestTimeout408,
            413 => StatusCode::RequestEntityTooLarge413,
            500 => StatusCode::InternalServerError500,
            501 => StatusCode::NotImplemented501,
            502 => StatusCode::BadGateway502,
            503 => StatusCode::ServiceUnavailable503,
            505 => StatusCode::VersionNotSupported505,
            _ => return Err("Invalid ICAP status code"),
        })
    }
}

impl FromStr for StatusCode {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().parse::<u16>().map_err(|_| "Invalid status code")?;
        StatusCode::try_from(code)
    }
}

/// An ICAP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_code: StatusCode,
    pub headers: Headers,
    /// Raw bytes written after the header block.
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn new(status_code: StatusCode) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
            body: None,
        }
    }

    /// Shortcut for `204 No Content` with `Encapsulated: null-body=0`.
    pub fn no_content() -> Self {
        Self::new(StatusCode::NoContent204).add_header("Encapsulated", "null-body=0")
    }

    /// Add or overwrite a header.
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = Some(body.to_vec());
        self
    }

    pub fn with_body_string(mut self, body: &str) -> Self {
        self.body = Some(body.as_bytes().to_vec());
        self
    }

    /// Embed an HTTP response (`res-hdr` + chunked `res-body`).
    pub fn with_http_response(self, resp: &HttpResponse<Vec<u8>>) -> Self {
        let head = serialize_http_response_head(resp);
        self.with_embedded("res-hdr", "res-body", head, resp.body())
    }

    /// Embed an HTTP request (`req-hdr` + chunked `req-body`).
    pub fn with_http_request(self, req: &HttpRequest<Vec<u8>>) -> Self {
        let head = serialize_http_request_head(req);
        self.with_embedded("req-hdr", "req-body", head, req.body())
    }

    fn with_embedded(mut self, hdr_key: &str, body_key: &str, head: Vec<u8>, body: &[u8]) -> Self {
        let encapsulated = if body.is_empty() {
            format!("{hdr_key}=0, null-body={}", head.len())
        } else {
            format!("{hdr_key}=0, {body_key}={}", head.len())
        };
        self.headers.insert("Encapsulated", encapsulated);

        let mut out = head;
        if !body.is_empty() {
            write_chunk_into(&mut out, body);
            write_chunk_into(&mut out, &[]);
        }
        self.body = Some(out);
        self
    }

    /// Serialize into wire bytes with the given service tag.
    pub fn to_raw(&self, istag: &str) -> Vec<u8> {
        serialize_icap_response(self, istag)
    }

    /// Parse an ICAP response from raw bytes.
    pub fn from_raw(raw: &[u8]) -> IcapResult<Self> {
        parse_icap_response(raw)
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains(name)
    }

    pub fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers.remove(name)
    }

    /// Whether the response indicates success (200 or 204).
    pub fn is_success(&self) -> bool {
        matches!(
            self.status_code,
            StatusCode::Ok200 | StatusCode::NoContent204
        )
    }

    /// Whether the response indicates an error (4xx/5xx).
    pub fn is_error(&self) -> bool {
        self.status_code.as_u16() >= 400
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} {}",
            ICAP_VERSION,
            self.status_code,
            self.status_code.reason()
        )?;
        write!(f, "{}", self.headers)?;
        if let Some(body) = &self.body {
            writeln!(f, "\n{}", String::from_utf8_lossy(body))?;
        }
        Ok(())
    }
}

/// Parse an ICAP response (status line, headers, remaining bytes as body).
pub fn parse_icap_response(raw: &[u8]) -> IcapResult<Response> {
    trace!("parse_icap_response: len={}", raw.len());
    if raw.is_empty() {
        return Err(Error::invalid_response("Empty response"));
    }

    let hdr_end = find_double_crlf(raw)
        .ok_or_else(|| Error::invalid_response("ICAP response headers not complete"))?;
    let head = String::from_utf8_lossy(&raw[..hdr_end]);
    let mut lines = head.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let parts: Vec<&str> = status_line.split_whitespace().collect();
    if parts.len() < 2 || !parts[0].starts_with("ICAP/") {
        return Err(Error::invalid_response(format!("Invalid status line: {status_line:?}")));
    }
    let status_code = StatusCode::from_str(parts[1])
        .map_err(|e| Error::invalid_response(format!("{e}: {}", parts[1])))?;

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim(), value.trim());
        }
    }

    // the serializer closes every response with one CRLF
    let rest = &raw[hdr_end..];
    let rest = rest.strip_suffix(b"\r\n").unwrap_or(rest);
    let body = (!rest.is_empty()).then(|| rest.to_vec());
    Ok(Response {
        status_code,
        headers,
        body,
    })
}
