//! Parse observers.
//!
//! A [`ParseObserver`] is called synchronously by the frame parser at four
//! points: the request line, every committed ICAP header, every embedded
//! HTTP header block and every body section. Hooks cannot influence the
//! parse result. Events are delivered once the message has parsed, in wire
//! order; a frame that fails produces none. A repeated header is reported
//! once, with the value that was kept.

use tracing::trace;

use crate::request::{EncapsulationKind, Method};

pub trait ParseObserver: Send + Sync {
    fn on_request_line(&self, _method: Method, _uri: &str, _version: &str) {}

    fn on_header(&self, _name: &str, _value: &str) {}

    fn on_encapsulated_header(&self, _kind: EncapsulationKind, _block: &[u8]) {}

    fn on_body_chunk(&self, _kind: EncapsulationKind, _chunk: &[u8]) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ParseObserver for NoopObserver {}

/// Observer that logs every event at `trace` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ParseObserver for TracingObserver {
    fn on_request_line(&self, method: Method, uri: &str, version: &str) {
        trace!(%method, uri, version, "request line");
    }

    fn on_header(&self, name: &str, value: &str) {
        trace!(name, value, "header");
    }

    fn on_encapsulated_header(&self, kind: EncapsulationKind, block: &[u8]) {
        trace!(%kind, len = block.len(), "encapsulated header block");
    }

    fn on_body_chunk(&self, kind: EncapsulationKind, chunk: &[u8]) {
        trace!(%kind, len = chunk.len(), "body chunk");
    }
}
