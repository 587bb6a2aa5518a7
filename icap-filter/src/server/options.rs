//! Service configuration and the built-in `OPTIONS` responder.
//!
//! [`ServiceOptions`] is built once at startup and then shared read-only by
//! every connection worker. It carries the process-wide `ISTag`, the service
//! name and the supported modification methods, plus a few optional
//! capabilities advertised in the `OPTIONS` reply.
//!
//! ```
//! use icap_filter::{Method, ServiceOptions};
//!
//! let opts = ServiceOptions::new("Filter Service", "filter-1.0")
//!     .with_methods([Method::ReqMod])
//!     .with_options_ttl(3600)
//!     .add_allow("204");
//! opts.validate().unwrap();
//!
//! let resp = opts.build_response();
//! assert_eq!(resp.get_header("Methods"), Some("REQMOD"));
//! assert_eq!(resp.get_header("Encapsulated"), Some("null-body=0"));
//! ```

use smallvec::SmallVec;

use crate::error::{Error, IcapResult};
use crate::request::Method;
use crate::response::{Response, StatusCode};

/// RFC 3507 caps the ISTag value at 32 bytes.
pub const MAX_ISTAG_LEN: usize = 32;

/// Read-only, process-wide service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Value of the `Service` header.
    pub service: String,
    /// Service tag stamped on every response.
    pub istag: String,
    /// Supported modification methods, in the order advertised.
    pub(crate) methods: SmallVec<[Method; 2]>,
    /// `Max-Connections` hint (optional).
    pub max_connections: Option<usize>,
    /// `Options-TTL` in seconds (optional).
    pub options_ttl: Option<u32>,
    /// `Service-ID` (optional).
    pub service_id: Option<String>,
    /// Capabilities advertised in `Allow`, e.g. `"204"`.
    pub allow: Vec<String>,
    /// `Preview` size in bytes (optional).
    pub preview: Option<u32>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::new("ICAP Filter", "icap-filter-0.1")
    }
}

impl ServiceOptions {
    /// Options advertising `REQMOD` only.
    pub fn new(service: &str, istag: &str) -> Self {
        Self {
            service: service.to_string(),
            istag: istag.to_string(),
            methods: SmallVec::from_slice(&[Method::ReqMod]),
            max_connections: None,
            options_ttl: None,
            service_id: None,
            allow: Vec::new(),
            preview: None,
        }
    }

    /// Replace the supported methods. Duplicates are dropped.
    pub fn with_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.methods.clear();
        for m in methods {
            if !self.methods.contains(&m) {
                self.methods.push(m);
            }
        }
        self
    }

    pub fn with_istag(mut self, istag: &str) -> Self {
        self.istag = istag.to_string();
        self
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = service.to_string();
        self
    }

    pub fn with_max_connections(mut self, n: usize) -> Self {
        self.max_connections = Some(n);
        self
    }

    pub fn with_options_ttl(mut self, ttl: u32) -> Self {
        self.options_ttl = Some(ttl);
        self
    }

    pub fn with_service_id(mut self, service_id: &str) -> Self {
        self.service_id = Some(service_id.to_string());
        self
    }

    /// Add a capability to `Allow` (e.g. `"204"`).
    pub fn add_allow(mut self, capability: &str) -> Self {
        self.allow.push(capability.to_string());
        self
    }

    pub fn with_preview(mut self, preview: u32) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// Check the configuration before the server starts.
    pub fn validate(&self) -> IcapResult<()> {
        let tag = self.istag.trim_matches('"');
        if tag.is_empty() {
            return Err(Error::configuration("ISTag must not be empty"));
        }
        if tag.len() > MAX_ISTAG_LEN {
            return Err(Error::configuration(format!(
                "ISTag must be at most {MAX_ISTAG_LEN} bytes, got {}",
                tag.len()
            )));
        }
        if tag.contains(['"', '\r', '\n']) {
            return Err(Error::configuration("ISTag must not contain quotes or line breaks"));
        }
        if self.methods.is_empty() {
            return Err(Error::configuration(
                "at least one of REQMOD or RESPMOD must be supported",
            ));
        }
        if self.methods.contains(&Method::Options) {
            return Err(Error::configuration(
                "OPTIONS is answered by the server and cannot be listed as a service method",
            ));
        }
        if self.service.contains(['\r', '\n']) {
            return Err(Error::configuration("service name must be a single line"));
        }
        Ok(())
    }

    /// The `OPTIONS` reply. `ISTag` is added by the serializer.
    pub fn build_response(&self) -> Response {
        let methods = self
            .methods
            .iter()
            .map(Method::as_str)
            .collect::<Vec<_>>()
            .join(", ");

        let mut response = Response::new(StatusCode::Ok200)
            .add_header("Methods", &methods)
            .add_header("Service", &self.service)
            .add_header("Encapsulated", "null-body=0");

        if let Some(max_conn) = self.max_connections {
            response = response.add_header("Max-Connections", &max_conn.to_string());
        }
        if let Some(ttl) = self.options_ttl {
            response = response.add_header("Options-TTL", &ttl.to_string());
        }
        if let Some(ref service_id) = self.service_id {
            response = response.add_header("Service-ID", service_id);
        }
        if !self.allow.is_empty() {
            response = response.add_header("Allow", &self.allow.join(", "));
        }
        if let Some(preview) = self.preview {
            response = response.add_header("Preview", &preview.to_string());
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn options_response_has_required_headers() {
        let opts = ServiceOptions::new("CloudVeil filter", "_cloudveil_icap_0.1")
            .with_methods([Method::ReqMod, Method::RespMod]);
        let resp = opts.build_response();

        assert_eq!(resp.status_code, StatusCode::Ok200);
        assert_eq!(resp.get_header("Methods"), Some("REQMOD, RESPMOD"));
        assert_eq!(resp.get_header("Service"), Some("CloudVeil filter"));
        assert_eq!(resp.get_header("Encapsulated"), Some("null-body=0"));
        assert!(!resp.has_header("Options-TTL"));
        assert!(resp.body.is_none());

        let text = String::from_utf8(resp.to_raw(&opts.istag)).unwrap();
        assert_eq!(text.matches("ISTag:").count(), 1);
        assert!(text.contains("ISTag: \"_cloudveil_icap_0.1\"\r\n"));
    }

    #[test]
    fn optional_fields_are_advertised() {
        let resp = ServiceOptions::new("svc", "t1")
            .with_max_connections(64)
            .with_options_ttl(600)
            .with_service_id("flt")
            .add_allow("204")
            .with_preview(1024)
            .build_response();

        assert_eq!(resp.get_header("Max-Connections"), Some("64"));
        assert_eq!(resp.get_header("Options-TTL"), Some("600"));
        assert_eq!(resp.get_header("Service-ID"), Some("flt"));
        assert_eq!(resp.get_header("Allow"), Some("204"));
        assert_eq!(resp.get_header("Preview"), Some("1024"));
    }

    #[test]
    fn duplicate_methods_are_collapsed() {
        let opts = ServiceOptions::default().with_methods([
            Method::RespMod,
            Method::RespMod,
            Method::ReqMod,
        ]);
        assert_eq!(opts.methods(), &[Method::RespMod, Method::ReqMod]);
    }

    #[rstest]
    #[case("")]
    #[case("\"\"")]
    #[case("this-tag-is-definitely-longer-than-32-bytes")]
    #[case("bad\"tag")]
    fn invalid_istag_is_rejected(#[case] tag: &str) {
        let err = ServiceOptions::new("svc", tag).validate().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err}");
    }

    #[rstest]
    #[case(&[])]
    #[case(&[Method::Options])]
    #[case(&[Method::ReqMod, Method::Options])]
    fn invalid_method_sets_are_rejected(#[case] methods: &[Method]) {
        let opts = ServiceOptions::default().with_methods(methods.iter().copied());
        assert!(opts.validate().is_err());
    }

    #[test]
    fn quoted_istag_within_limit_is_accepted() {
        assert!(ServiceOptions::new("svc", "\"abc\"").validate().is_ok());
        assert!(ServiceOptions::default().validate().is_ok());
    }
}
