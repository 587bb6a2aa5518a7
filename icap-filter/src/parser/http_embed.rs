use std::fmt::Write as _;

use http::{HeaderName, HeaderValue, Request as HttpRequest, Response as HttpResponse, StatusCode};

use crate::error::{Error, IcapResult};

pub fn http_version_str(v: http::Version) -> &'static str {
    match v {
        http::Version::HTTP_09 => "HTTP/0.9",
        http::Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

fn parse_http_version(s: &str) -> http::Version {
    match s {
        "HTTP/0.9" => http::Version::HTTP_09,
        "HTTP/1.0" => http::Version::HTTP_10,
        _ => http::Version::HTTP_11,
    }
}

fn write_head_headers(out: &mut String, headers: &http::HeaderMap) {
    for (name, value) in headers.iter() {
        let _ = write!(
            out,
            "{}: {}\r\n",
            name.as_str(),
            value.to_str().unwrap_or_default()
        );
    }
    out.push_str("\r\n");
}

/// Serialize an HTTP request head for embedding into ICAP.
pub fn serialize_http_request_head<B>(req: &HttpRequest<B>) -> Vec<u8> {
    let mut out = String::new();
    let _ = write!(
        out,
        "{} {} {}\r\n",
        req.method(),
        req.uri(),
        http_version_str(req.version())
    );
    write_head_headers(&mut out, req.headers());
    out.into_bytes()
}

/// Serialize an HTTP response head for embedding into ICAP.
pub fn serialize_http_response_head<B>(resp: &HttpResponse<B>) -> Vec<u8> {
    let mut out = String::new();
    let code: StatusCode = resp.status();
    let _ = write!(
        out,
        "{} {} {}\r\n",
        http_version_str(resp.version()),
        code.as_u16(),
        code.canonical_reason().unwrap_or("")
    );
    write_head_headers(&mut out, resp.headers());
    out.into_bytes()
}

/// Split an embedded header block into its start line and header lines.
fn split_head(raw: &[u8]) -> IcapResult<(&str, impl Iterator<Item = &str>)> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| Error::http_parse("embedded HTTP head is not UTF-8"))?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));
    let start = lines
        .next()
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::http_parse("embedded HTTP head is empty"))?;
    Ok((start, lines.take_while(|l| !l.is_empty())))
}

fn fill_headers<'a>(
    map: &mut http::HeaderMap,
    lines: impl Iterator<Item = &'a str>,
) -> IcapResult<()> {
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| Error::http_parse(format!("header name {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| Error::http_parse(format!("header value for {name}: {e}")))?;
        map.append(name, value);
    }
    Ok(())
}

/// Decode an embedded `req-hdr` block.
pub fn parse_http_request_head(raw: &[u8]) -> IcapResult<HttpRequest<()>> {
    let (start, lines) = split_head(raw)?;
    let mut p = start.split_whitespace();
    let (Some(method), Some(uri)) = (p.next(), p.next()) else {
        return Err(Error::http_parse(format!("bad request line: {start:?}")));
    };
    let version = parse_http_version(p.next().unwrap_or("HTTP/1.1"));

    let mut req = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .version(version)
        .body(())
        .map_err(|e| Error::http_parse(format!("build http::Request: {e}")))?;
    fill_headers(req.headers_mut(), lines)?;
    Ok(req)
}

/// Decode an embedded `res-hdr` block.
pub fn parse_http_response_head(raw: &[u8]) -> IcapResult<HttpResponse<()>> {
    let (start, lines) = split_head(raw)?;
    let mut p = start.split_whitespace();
    let version = p.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(Error::http_parse(format!("bad status line: {start:?}")));
    }
    let code = p
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .and_then(|c| StatusCode::from_u16(c).ok())
        .ok_or_else(|| Error::http_parse(format!("bad status code in {start:?}")))?;

    let mut resp = HttpResponse::builder()
        .status(code)
        .version(parse_http_version(version))
        .body(())
        .map_err(|e| Error::http_parse(format!("build http::Response: {e}")))?;
    fill_headers(resp.headers_mut(), lines)?;
    Ok(resp)
}
