#![doc = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/README.md"))]

pub mod error;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod server;

pub use error::{Error, IcapResult, ParseError, ParseErrorKind, ParseState};
pub use headers::Headers;
pub use parser::{FrameParser, NoopObserver, ParseObserver, TracingObserver, parse_request};
pub use request::{Encapsulation, EncapsulationKind, Method, Request};
pub use response::{Response, StatusCode};
pub use server::{
    ConnectionInfo, FrameMode, HandlerFuture, Server, ServerBuilder, ServiceOptions,
    ShutdownHandle,
};

///Lib version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Supported ICAP protocol version.
pub const ICAP_VERSION: &str = "ICAP/1.0";
/// Default size of one socket read.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;
/// Default upper bound of one buffered frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;
