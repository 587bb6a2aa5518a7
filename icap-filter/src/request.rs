//! Parsed ICAP request model.
//!
//! This module defines:
//! - [`Method`]: the three ICAP methods.
//! - [`EncapsulationKind`]: the `Encapsulated` header vocabulary.
//! - [`Encapsulation`]: one embedded section cut out of a message.
//! - [`Request`]: a fully parsed ICAP request, immutable once built.
//!
//! A [`Request`] is only ever produced by the frame parser; handlers receive
//! it behind an `Arc` and read it.
//!
//! # Example
//! ```rust
//! use icap_filter::{EncapsulationKind, Method, parse_request};
//!
//! let raw = b"REQMOD icap://icap-server.net/filter ICAP/1.0\r\n\
//!             Host: icap-server.net\r\n\
//!             Encapsulated: req-hdr=0, null-body=27\r\n\
//!             \r\n\
//!             GET / HTTP/1.1\r\nHost: x\r\n\r\n";
//!
//! let req = parse_request(raw).unwrap();
//! assert_eq!(req.method, Method::ReqMod);
//! assert_eq!(req.headers.get("host"), Some("icap-server.net"));
//! assert_eq!(req.encapsulations[0].kind, EncapsulationKind::RequestHeader);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, IcapResult};
use crate::headers::Headers;
use crate::parser::http_embed;

/// ICAP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Options,
    ReqMod,
    RespMod,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::ReqMod => "REQMOD",
            Method::RespMod => "RESPMOD",
        }
    }

    /// Exact, case-sensitive match of a request-line token.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "OPTIONS" => Some(Method::Options),
            "REQMOD" => Some(Method::ReqMod),
            "RESPMOD" => Some(Method::RespMod),
            _ => None,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lenient parse used for configuration: trims and ignores case.
impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("OPTIONS") {
            Ok(Method::Options)
        } else if t.eq_ignore_ascii_case("REQMOD") {
            Ok(Method::ReqMod)
        } else if t.eq_ignore_ascii_case("RESPMOD") {
            Ok(Method::RespMod)
        } else {
            Err(Error::configuration(format!("unknown ICAP method: {s:?}")))
        }
    }
}

/// Kind of an encapsulated section, one per `Encapsulated` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncapsulationKind {
    RequestHeader,
    ResponseHeader,
    RequestBody,
    ResponseBody,
    NullBody,
    OptionBody,
}

impl EncapsulationKind {
    /// Map a wire key (`req-hdr`, `res-body`, ...) to its kind.
    pub fn from_key(key: &str) -> Option<Self> {
        let kind = match key {
            "req-hdr" => EncapsulationKind::RequestHeader,
            "res-hdr" => EncapsulationKind::ResponseHeader,
            "req-body" => EncapsulationKind::RequestBody,
            "res-body" => EncapsulationKind::ResponseBody,
            "null-body" => EncapsulationKind::NullBody,
            "opt-body" => EncapsulationKind::OptionBody,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_key(&self) -> &'static str {
        match self {
            EncapsulationKind::RequestHeader => "req-hdr",
            EncapsulationKind::ResponseHeader => "res-hdr",
            EncapsulationKind::RequestBody => "req-body",
            EncapsulationKind::ResponseBody => "res-body",
            EncapsulationKind::NullBody => "null-body",
            EncapsulationKind::OptionBody => "opt-body",
        }
    }

    #[inline]
    pub fn is_header(&self) -> bool {
        matches!(
            self,
            EncapsulationKind::RequestHeader | EncapsulationKind::ResponseHeader
        )
    }

    #[inline]
    pub fn is_body(&self) -> bool {
        matches!(
            self,
            EncapsulationKind::RequestBody
                | EncapsulationKind::ResponseBody
                | EncapsulationKind::OptionBody
        )
    }
}

impl fmt::Display for EncapsulationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_key())
    }
}

/// One embedded section of an ICAP message.
///
/// Header sections hold the raw HTTP header block; body sections hold the raw
/// (still ICAP-chunked) body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encapsulation {
    pub kind: EncapsulationKind,
    pub data: Vec<u8>,
}

impl Encapsulation {
    pub fn new(kind: EncapsulationKind, data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Lossy text view of the section.
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    /// Decode a `req-hdr` section into an HTTP request head.
    pub fn http_request(&self) -> IcapResult<http::Request<()>> {
        if self.kind != EncapsulationKind::RequestHeader {
            return Err(Error::http_parse(format!(
                "{} section does not hold an HTTP request",
                self.kind
            )));
        }
        http_embed::parse_http_request_head(&self.data)
    }

    /// Decode a `res-hdr` section into an HTTP response head.
    pub fn http_response(&self) -> IcapResult<http::Response<()>> {
        if self.kind != EncapsulationKind::ResponseHeader {
            return Err(Error::http_parse(format!(
                "{} section does not hold an HTTP response",
                self.kind
            )));
        }
        http_embed::parse_http_response_head(&self.data)
    }
}

/// A parsed ICAP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Request URI as sent. `icap://` is not parsed as a URI.
    pub uri: String,
    /// Protocol version after `ICAP/`, e.g. `"1.0"`.
    pub version: String,
    pub headers: Headers,
    /// Sections in the order the `Encapsulated` header declares them.
    pub encapsulations: Vec<Encapsulation>,
}

impl Request {
    pub(crate) fn new(method: Method, uri: String, version: String) -> Self {
        Self {
            method,
            uri,
            version,
            headers: Headers::new(),
            encapsulations: Vec::new(),
        }
    }

    /// First section of the given kind.
    pub fn encapsulation(&self, kind: EncapsulationKind) -> Option<&Encapsulation> {
        self.encapsulations.iter().find(|e| e.kind == kind)
    }

    /// Service part of the URI: the text after the last `/`.
    pub fn service(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or_default()
    }

    /// True for REQMOD/RESPMOD.
    #[inline]
    pub fn is_mod(&self) -> bool {
        matches!(self.method, Method::ReqMod | Method::RespMod)
    }

    /// Whether the client advertised `Allow: 204`.
    pub fn allows_204(&self) -> bool {
        self.headers
            .get("Allow")
            .map(|s| s.split(',').any(|t| t.trim() == "204"))
            .unwrap_or(false)
    }

    /// Value of `Preview`, if present and numeric.
    pub fn preview_size(&self) -> Option<usize> {
        self.headers
            .get("Preview")
            .and_then(|s| s.trim().parse::<usize>().ok())
    }
}
