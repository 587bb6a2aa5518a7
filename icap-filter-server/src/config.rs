//! Configuration file loading.
//!
//! ```toml
//! [server]
//! address = "127.0.0.1"
//! port = 1344
//! backlog = 512
//! max_connections = 256
//! read_timeout_secs = 60
//! framing = "delimited"
//!
//! [service]
//! name = "icap-filter"
//! istag = "_icap_filter_0.1"
//! methods = ["REQMOD", "RESPMOD"]
//!
//! [policy]
//! blocked_hosts = ["ads.example.com"]
//! ```
//!
//! Every key is optional; missing keys take the defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use icap_filter::server::options::MAX_ISTAG_LEN;
use icap_filter::{FrameMode, Method, ServiceOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Delimited,
    ShortRead,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub address: String,
    pub port: u16,
    pub backlog: u32,
    pub max_connections: Option<usize>,
    pub read_timeout_secs: u64,
    pub chunk_size: usize,
    pub max_frame_bytes: usize,
    pub framing: Framing,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 1344,
            backlog: icap_filter::server::DEFAULT_BACKLOG,
            max_connections: None,
            read_timeout_secs: icap_filter::server::DEFAULT_READ_TIMEOUT.as_secs(),
            chunk_size: icap_filter::DEFAULT_CHUNK_SIZE,
            max_frame_bytes: icap_filter::MAX_FRAME_BYTES,
            framing: Framing::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceSection {
    pub name: String,
    pub istag: String,
    pub methods: Vec<String>,
    pub options_ttl: Option<u32>,
    pub service_id: Option<String>,
    pub allow_204: bool,
    pub preview: Option<u32>,
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            name: "icap-filter".to_string(),
            istag: "_icap_filter_0.1".to_string(),
            methods: vec!["REQMOD".to_string()],
            options_ttl: None,
            service_id: None,
            allow_204: true,
            preview: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    pub blocked_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub service: ServiceSection,
    pub policy: PolicySection,
}

impl Config {
    /// Parse a TOML document. Not validated.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `--bind` and `--istag`.
    pub fn apply_overrides(
        &mut self,
        bind: Option<&str>,
        istag: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(bind) = bind {
            let (host, port) = bind
                .rsplit_once(':')
                .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h, p)))
                .ok_or_else(|| {
                    ConfigError::Validation(vec![format!(
                        "--bind expects host:port, got {bind:?}"
                    )])
                })?;
            self.server.address = host.trim_start_matches('[').trim_end_matches(']').to_string();
            self.server.port = port;
        }
        if let Some(istag) = istag {
            self.service.istag = istag.to_string();
        }
        Ok(())
    }

    /// Collect every problem instead of stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let tag = self.service.istag.trim_matches('"');
        if tag.is_empty() {
            errors.push("service.istag must not be empty".to_string());
        } else if tag.len() > MAX_ISTAG_LEN {
            errors.push(format!(
                "service.istag must be at most {MAX_ISTAG_LEN} bytes, got {}",
                tag.len()
            ));
        }

        match self.methods() {
            Ok(methods) => {
                if !methods
                    .iter()
                    .any(|m| matches!(m, Method::ReqMod | Method::RespMod))
                {
                    errors.push("service.methods must include REQMOD or RESPMOD".to_string());
                }
                if methods.contains(&Method::Options) {
                    errors.push("service.methods must not list OPTIONS".to_string());
                }
            }
            Err(e) => errors.push(e),
        }

        if self.server.address.trim().is_empty() {
            errors.push("server.address must not be empty".to_string());
        }
        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.server.read_timeout_secs == 0 {
            errors.push("server.read_timeout_secs must be positive".to_string());
        }
        if self.server.chunk_size == 0 {
            errors.push("server.chunk_size must be positive".to_string());
        } else if self.server.max_frame_bytes < self.server.chunk_size {
            errors.push("server.max_frame_bytes must be at least server.chunk_size".to_string());
        }
        if self.server.max_connections == Some(0) {
            errors.push("server.max_connections must be positive when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn methods(&self) -> Result<Vec<Method>, String> {
        self.service
            .methods
            .iter()
            .map(|m| m.parse::<Method>().map_err(|e| format!("service.methods: {e}")))
            .collect()
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn bind_addr(&self) -> String {
        let host = self.server.address.trim();
        if host.contains(':') {
            format!("[{host}]:{}", self.server.port)
        } else {
            format!("{host}:{}", self.server.port)
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.server.read_timeout_secs)
    }

    pub fn frame_mode(&self) -> FrameMode {
        match self.server.framing {
            Framing::Delimited => FrameMode::Delimited,
            Framing::ShortRead => FrameMode::ShortRead,
        }
    }

    /// Options for the `OPTIONS` responder. Call after [`validate`](Self::validate).
    pub fn service_options(&self) -> Result<ServiceOptions, ConfigError> {
        let methods = self.methods().map_err(|e| ConfigError::Validation(vec![e]))?;
        let mut opts = ServiceOptions::new(&self.service.name, &self.service.istag)
            .with_methods(methods);
        if let Some(ttl) = self.service.options_ttl {
            opts = opts.with_options_ttl(ttl);
        }
        if let Some(id) = &self.service.service_id {
            opts = opts.with_service_id(id);
        }
        if self.service.allow_204 {
            opts = opts.add_allow("204");
        }
        if let Some(preview) = self.service.preview {
            opts = opts.with_preview(preview);
        }
        Ok(opts)
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config = Config::from_toml(&content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_document_gives_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.bind_addr(), "127.0.0.1:1344");
        assert_eq!(cfg.frame_mode(), FrameMode::Delimited);
        cfg.validate().unwrap();
    }

    #[test]
    fn full_document_is_read() {
        let cfg = Config::from_toml(
            r#"
            [server]
            address = "0.0.0.0"
            port = 11344
            backlog = 64
            max_connections = 10
            read_timeout_secs = 5
            framing = "short-read"

            [service]
            name = "Filter"
            istag = "\"tag-7\""
            methods = ["reqmod", "RESPMOD"]
            options_ttl = 600
            allow_204 = false

            [policy]
            blocked_hosts = ["ads.example.com", "tracker.example"]
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.bind_addr(), "0.0.0.0:11344");
        assert_eq!(cfg.server.backlog, 64);
        assert_eq!(cfg.read_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.frame_mode(), FrameMode::ShortRead);
        assert_eq!(cfg.policy.blocked_hosts.len(), 2);

        let opts = cfg.service_options().unwrap();
        assert_eq!(opts.methods(), &[Method::ReqMod, Method::RespMod]);
        assert_eq!(opts.options_ttl, Some(600));
        assert!(opts.allow.is_empty());
        opts.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml("[server]\nprot = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "{err}");
    }

    #[rstest]
    #[case("[service]\nistag = \"\"", "istag")]
    #[case("[service]\nistag = \"0123456789012345678901234567890123\"", "at most 32")]
    #[case("[service]\nmethods = []", "REQMOD or RESPMOD")]
    #[case("[service]\nmethods = [\"OPTIONS\"]", "REQMOD or RESPMOD")]
    #[case("[service]\nmethods = [\"PUT\"]", "unknown ICAP method")]
    #[case("[server]\nport = 0", "port")]
    #[case("[server]\nread_timeout_secs = 0", "read_timeout_secs")]
    #[case("[server]\nchunk_size = 4096\nmax_frame_bytes = 1024", "max_frame_bytes")]
    fn invalid_values_are_reported(#[case] doc: &str, #[case] needle: &str) {
        let cfg = Config::from_toml(doc).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains(needle), "{err}");
    }

    #[test]
    fn overrides_replace_bind_and_istag() {
        let mut cfg = Config::default();
        cfg.apply_overrides(Some("[::1]:2000"), Some("cli-tag")).unwrap();
        assert_eq!(cfg.server.address, "::1");
        assert_eq!(cfg.server.port, 2000);
        assert_eq!(cfg.bind_addr(), "[::1]:2000");
        assert_eq!(cfg.service.istag, "cli-tag");

        assert!(cfg.apply_overrides(Some("no-port"), None).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"), "{err}");
    }
}
