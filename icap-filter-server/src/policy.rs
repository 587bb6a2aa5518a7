//! Host blocklist: the sample business logic behind `REQMOD`.

use std::sync::Arc;

use tracing::{debug, info};

use icap_filter::error::{Error, IcapResult};
use icap_filter::{ConnectionInfo, EncapsulationKind, Method, Request, Response, StatusCode};

/// Blocks requests whose host is a listed domain or one of its subdomains.
#[derive(Debug, Clone, Default)]
pub struct HostBlocklist {
    domains: Vec<String>,
}

impl HostBlocklist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let domains = domains
            .into_iter()
            .map(|d| normalize_host(d.as_ref()))
            .filter(|d| !d.is_empty())
            .collect();
        Self { domains }
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if host.is_empty() {
            return false;
        }
        self.domains.iter().any(|d| {
            host == *d
                || host
                    .strip_suffix(d.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }

    /// Request handler entry point.
    pub async fn handle(
        self: Arc<Self>,
        conn: ConnectionInfo,
        req: Arc<Request>,
    ) -> IcapResult<Option<Response>> {
        debug!(conn = conn.id, client = %conn.peer_addr, method = %req.method, uri = %req.uri, "adapting");
        self.decide(&req)
    }

    pub fn decide(&self, req: &Request) -> IcapResult<Option<Response>> {
        match req.method {
            Method::ReqMod => {
                let Some(host) = embedded_host(req)? else {
                    return Ok(Some(unmodified(req)));
                };
                if self.is_blocked(&host) {
                    info!(%host, "blocked");
                    return blocked_page(&host).map(Some);
                }
                Ok(Some(unmodified(req)))
            }
            Method::RespMod => Ok(Some(unmodified(req))),
            Method::Options => Ok(None),
        }
    }
}

/// Lowercase, without port and trailing dot.
fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if let Some(rest) = raw.strip_prefix('[') {
        rest.split(']').next().unwrap_or_default()
    } else {
        match raw.rsplit_once(':') {
            Some((h, port)) if !h.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => h,
            _ => raw,
        }
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// `Host` header of the embedded request, else the host of its URI.
fn embedded_host(req: &Request) -> IcapResult<Option<String>> {
    let Some(section) = req.encapsulation(EncapsulationKind::RequestHeader) else {
        return Ok(None);
    };
    let http = section.http_request()?;
    let from_header = http
        .headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok(from_header.or_else(|| http.uri().host().map(str::to_string)))
}

/// "No modification": `204` when the client allows it, otherwise the
/// original sections echoed back with `200`.
fn unmodified(req: &Request) -> Response {
    if req.allows_204() || req.preview_size().is_some() {
        return Response::no_content();
    }

    let (hdr_kind, body_kind) = match req.method {
        Method::RespMod => (EncapsulationKind::ResponseHeader, EncapsulationKind::ResponseBody),
        _ => (EncapsulationKind::RequestHeader, EncapsulationKind::RequestBody),
    };

    let mut body = Vec::new();
    let mut parts = Vec::new();
    if let Some(hdr) = req.encapsulation(hdr_kind) {
        parts.push(format!("{}=0", hdr_kind.as_key()));
        body.extend_from_slice(&hdr.data);
    }
    match req.encapsulation(body_kind) {
        Some(b) => {
            parts.push(format!("{}={}", body_kind.as_key(), body.len()));
            body.extend_from_slice(&b.data);
        }
        None => parts.push(format!("null-body={}", body.len())),
    }

    let resp = Response::new(StatusCode::Ok200).add_header("Encapsulated", &parts.join(", "));
    if body.is_empty() {
        resp
    } else {
        resp.with_body(&body)
    }
}

fn blocked_page(host: &str) -> IcapResult<Response> {
    let html = format!(
        "<html><head><title>Blocked</title></head>\
         <body><h1>403 Forbidden</h1><p>Access to {host} is blocked by policy.</p></body></html>"
    );
    let page = http::Response::builder()
        .status(http::StatusCode::FORBIDDEN)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(http::header::CONTENT_LENGTH, html.len())
        .header(http::header::CONNECTION, "close")
        .body(html.into_bytes())
        .map_err(|e| Error::handler(format!("build block page: {e}")))?;
    Ok(Response::new(StatusCode::Ok200).with_http_response(&page))
}

#[cfg(test)]
mod tests {
    use super::*;
    use icap_filter::parse_request;
    use rstest::rstest;

    fn list() -> HostBlocklist {
        HostBlocklist::new(["Ads.Example.com.", "tracker.test", " "])
    }

    fn reqmod(host: &str, allow_204: bool) -> Request {
        let http = format!("GET http://{host}/x HTTP/1.1\r\nHost: {host}\r\n\r\n");
        let allow = if allow_204 { "Allow: 204\r\n" } else { "" };
        let raw = format!(
            "REQMOD icap://icap/filter ICAP/1.0\r\nHost: icap\r\n{allow}Encapsulated: req-hdr=0, null-body={}\r\n\r\n{http}",
            http.len()
        );
        parse_request(raw.as_bytes()).unwrap()
    }

    #[rstest]
    #[case("ads.example.com", true)]
    #[case("ADS.example.com:8080", true)]
    #[case("cdn.ads.example.com", true)]
    #[case("badads.example.com", false)]
    #[case("example.com", false)]
    #[case("tracker.test.", true)]
    #[case("", false)]
    fn matches_domain_and_subdomains(#[case] host: &str, #[case] blocked: bool) {
        assert_eq!(list().is_blocked(host), blocked);
    }

    #[test]
    fn blank_entries_are_dropped() {
        assert_eq!(list().len(), 2);
        assert!(HostBlocklist::default().is_empty());
    }

    #[test]
    fn blocked_host_gets_embedded_403() {
        let resp = list()
            .decide(&reqmod("cdn.ads.example.com", true))
            .unwrap()
            .unwrap();
        assert_eq!(resp.status_code, StatusCode::Ok200);
        let enc = resp.get_header("Encapsulated").unwrap();
        assert!(enc.starts_with("res-hdr=0, res-body="), "{enc}");

        let text = String::from_utf8(resp.to_raw("t")).unwrap();
        assert!(text.contains("HTTP/1.1 403 Forbidden\r\n"), "{text}");
        assert!(text.contains("cdn.ads.example.com"), "{text}");
        assert!(text.ends_with("\r\n0\r\n\r\n\r\n"), "{text}");
    }

    #[test]
    fn allowed_host_gets_204() {
        let resp = list().decide(&reqmod("example.org", true)).unwrap().unwrap();
        assert_eq!(resp.status_code, StatusCode::NoContent204);
    }

    #[test]
    fn without_allow_204_the_request_is_echoed() {
        let req = reqmod("example.org", false);
        let resp = list().decide(&req).unwrap().unwrap();
        assert_eq!(resp.status_code, StatusCode::Ok200);

        let original = &req.encapsulations[0].data;
        assert_eq!(
            resp.get_header("Encapsulated"),
            Some(format!("req-hdr=0, null-body={}", original.len()).as_str())
        );
        assert_eq!(resp.body.as_deref(), Some(original.as_slice()));
    }

    #[test]
    fn respmod_is_never_blocked() {
        let raw = b"RESPMOD icap://icap/filter ICAP/1.0\r\nAllow: 204\r\nEncapsulated: null-body=0\r\n\r\n";
        let req = parse_request(raw).unwrap();
        let resp = list().decide(&req).unwrap().unwrap();
        assert_eq!(resp.status_code, StatusCode::NoContent204);
    }

    #[test]
    fn unparsable_embedded_request_is_a_handler_fault() {
        let raw = b"REQMOD icap://icap/filter ICAP/1.0\r\nEncapsulated: req-hdr=0, null-body=4\r\n\r\n\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert!(list().decide(&req).is_err());
    }
}
