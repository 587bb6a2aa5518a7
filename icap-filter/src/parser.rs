//! Frame parser: one ICAP request frame in, one [`Request`] (or a
//! [`ParseError`]) out.
//!
//! The parser is a line-driven state machine:
//!
//! ```text
//! AwaitingRequestLine -> HeaderCollect -> EncapsulatedTableParsed
//!     -> EncapsulatedCollect -> [EncapsulatedBodyCollect] -> Completed
//! ```
//!
//! Any state can fail. Embedded sections are located by the offsets of the
//! `Encapsulated` header, measured from the first byte after the blank line
//! that ends the ICAP header block. Parser state lives only for one
//! [`FrameParser::parse`] call.

pub mod encapsulated;
pub mod http_embed;
mod lines;
pub mod observer;
pub mod wire;

use tracing::trace;

use crate::error::{ParseError, ParseErrorKind, ParseState};
use crate::request::{Encapsulation, EncapsulationKind, Method, Request};
use encapsulated::EncapsulationRange;
use lines::LineCursor;
pub use observer::{NoopObserver, ParseObserver, TracingObserver};

static NOOP: NoopObserver = NoopObserver;

/// Stateless entry point; every call to [`parse`](Self::parse) runs a fresh
/// state machine.
#[derive(Clone, Copy)]
pub struct FrameParser<'o> {
    observer: &'o dyn ParseObserver,
}

impl FrameParser<'static> {
    pub fn new() -> Self {
        Self { observer: &NOOP }
    }
}

impl Default for FrameParser<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'o> FrameParser<'o> {
    pub fn with_observer(observer: &'o dyn ParseObserver) -> Self {
        Self { observer }
    }

    /// Parse exactly one ICAP request frame.
    pub fn parse(&self, frame: &[u8]) -> Result<Request, ParseError> {
        trace!("parse frame: len={}", frame.len());
        Machine::new(frame, self.observer).run()
    }
}

/// Parse one frame without observers.
pub fn parse_request(frame: &[u8]) -> Result<Request, ParseError> {
    FrameParser::new().parse(frame)
}

/// Internal steps. Each maps onto one public [`ParseState`].
#[derive(Debug, Clone, Copy)]
enum Step {
    RequestLine,
    Headers,
    TableParsed,
    /// Encapsulated table known; waiting for the blank line that opens the
    /// encapsulated area.
    Separator,
    /// Extracting the section at this index.
    Section(usize),
    /// Extracting the body section at this index.
    Body(usize),
    Done,
}

impl Step {
    fn state(&self) -> ParseState {
        match self {
            Step::RequestLine => ParseState::AwaitingRequestLine,
            Step::Headers => ParseState::HeaderCollect,
            Step::TableParsed => ParseState::EncapsulatedTableParsed,
            Step::Separator | Step::Section(_) => ParseState::EncapsulatedCollect,
            Step::Body(_) => ParseState::EncapsulatedBodyCollect,
            Step::Done => ParseState::Completed,
        }
    }
}

struct Machine<'a, 'o> {
    raw: &'a [u8],
    cursor: LineCursor<'a>,
    observer: &'o dyn ParseObserver,
    step: Step,
    pending: Option<(String, String)>,
    table: Vec<EncapsulationRange>,
    area_start: usize,
}

impl<'a, 'o> Machine<'a, 'o> {
    fn new(raw: &'a [u8], observer: &'o dyn ParseObserver) -> Self {
        Self {
            raw,
            cursor: LineCursor::new(raw),
            observer,
            step: Step::RequestLine,
            pending: None,
            table: Vec::new(),
            area_start: 0,
        }
    }

    fn fail(&self, kind: ParseErrorKind, detail: impl Into<String>) -> ParseError {
        ParseError::new(kind, self.step.state(), detail, self.raw)
    }

    fn run(mut self) -> Result<Request, ParseError> {
        let mut req = self.request_line()?;
        loop {
            self.step = match self.step {
                Step::RequestLine | Step::Headers => self.header_collect(&mut req)?,
                Step::TableParsed => Step::Separator,
                Step::Separator => self.separator(&mut req),
                Step::Section(i) => self.section(&mut req, i),
                Step::Body(i) => self.body(&mut req, i),
                Step::Done => {
                    self.commit_pending(&mut req);
                    self.notify(&req);
                    return Ok(req);
                }
            };
        }
    }

    fn request_line(&mut self) -> Result<Request, ParseError> {
        // tolerate stray blank lines left over from a previous message
        let line = loop {
            match self.cursor.next_line() {
                Some(l) if l.iter().all(u8::is_ascii_whitespace) => continue,
                Some(l) => break String::from_utf8_lossy(l),
                None => return Err(self.fail(ParseErrorKind::NoRequestLine, "empty frame")),
            }
        };

        if !line.to_ascii_uppercase().contains("ICAP/") {
            return Err(self.fail(
                ParseErrorKind::NoRequestLine,
                format!("Request line was {line:?}"),
            ));
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        let version = match tokens.last() {
            Some(v)
                if tokens.len() >= 3
                    && v.len() > 5
                    && v.get(..5).is_some_and(|p| p.eq_ignore_ascii_case("ICAP/")) =>
            {
                &v[5..]
            }
            _ => {
                return Err(self.fail(
                    ParseErrorKind::NoRequestLine,
                    format!("Request line was {line:?}"),
                ));
            }
        };

        let method = Method::from_token(tokens[0]).ok_or_else(|| {
            self.fail(
                ParseErrorKind::InvalidMethod,
                format!("Invalid method for ICAP: {}", tokens[0]),
            )
        })?;
        // a URI with stray spaces is kept whole
        let uri = tokens[1..tokens.len() - 1].join(" ");

        self.step = Step::Headers;
        Ok(Request::new(method, uri, version.to_string()))
    }

    fn header_collect(&mut self, req: &mut Request) -> Result<Step, ParseError> {
        let Some(line) = self.cursor.next_line() else {
            return Ok(self.end_of_headers(req));
        };

        if line.is_empty() {
            return Ok(self.end_of_headers(req));
        }

        if line[0] == b' ' || line[0] == b'\t' {
            // folded value: raw append, no separator
            match self.pending.as_mut() {
                Some((_, value)) => value.push_str(&String::from_utf8_lossy(line)),
                None => trace!("continuation line without a header, ignored"),
            }
            return Ok(Step::Headers);
        }

        self.commit_pending(req);

        let text = String::from_utf8_lossy(line);
        let Some((name, value)) = text.split_once(':') else {
            return Err(self.fail(
                ParseErrorKind::MissingColon,
                format!("Expected header name. Got {text:?} instead."),
            ));
        };

        let mut next = Step::Headers;
        if name.trim().eq_ignore_ascii_case("Encapsulated") {
            self.table = encapsulated::parse_encapsulated_value(value)
                .map_err(|e| self.fail(e.kind, e.detail))?;
            next = Step::TableParsed;
        }
        self.pending = Some((name.to_string(), value.to_string()));
        Ok(next)
    }

    /// Blank line (or end of input) after the ICAP headers.
    fn end_of_headers(&mut self, req: &mut Request) -> Step {
        self.commit_pending(req);
        self.area_start = self.cursor.position();
        if self.table.is_empty() {
            Step::Done
        } else {
            Step::Section(0)
        }
    }

    fn separator(&mut self, req: &mut Request) -> Step {
        match self.cursor.peek_line() {
            Some(line) if !line.is_empty() => Step::Headers,
            Some(_) => {
                self.cursor.next_line();
                self.end_of_headers(req)
            }
            None => self.end_of_headers(req),
        }
    }

    fn section(&mut self, req: &mut Request, i: usize) -> Step {
        let Some(range) = self.table.get(i).copied() else {
            return Step::Done;
        };

        if range.kind == EncapsulationKind::NullBody {
            return Step::Done;
        }
        if range.kind.is_body() {
            return Step::Body(i);
        }

        match range.end {
            Some(end) => {
                if end > range.start {
                    let from = self.area_start.saturating_add(range.start);
                    let to = self.area_start.saturating_add(end);
                    let block = self.cursor.span(from, to);
                    if !block.is_empty() {
                        req.encapsulations
                            .push(Encapsulation::new(range.kind, block.to_vec()));
                    }
                    self.cursor.seek(to);
                }
                Step::Section(i + 1)
            }
            None => {
                // open header block: runs to the next blank line
                let from = self.area_start.saturating_add(range.start);
                self.cursor.seek(from);
                while let Some(line) = self.cursor.next_line() {
                    if line.is_empty() {
                        break;
                    }
                }
                let block = self.cursor.span(from, self.cursor.position());
                if !block.is_empty() {
                    req.encapsulations
                        .push(Encapsulation::new(range.kind, block.to_vec()));
                }
                Step::Done
            }
        }
    }

    fn body(&mut self, req: &mut Request, i: usize) -> Step {
        let range = self.table[i];
        let from = self.area_start.saturating_add(range.start);
        let to = range
            .end
            .map_or(self.raw.len(), |end| self.area_start.saturating_add(end));
        let chunk = self.cursor.span(from, to);
        if !chunk.is_empty() {
            req.encapsulations
                .push(Encapsulation::new(range.kind, chunk.to_vec()));
        }
        self.cursor.seek(to);
        if range.is_open() {
            Step::Done
        } else {
            Step::Section(i + 1)
        }
    }

    fn commit_pending(&mut self, req: &mut Request) {
        if let Some((name, value)) = self.pending.take() {
            req.headers.insert(name.trim(), value.trim());
        }
    }

    /// Replay the completed message to the observer. A frame that fails
    /// produces no events.
    fn notify(&self, req: &Request) {
        self.observer
            .on_request_line(req.method, &req.uri, &req.version);
        for (name, value) in req.headers.iter() {
            self.observer.on_header(name, value);
        }
        for enc in &req.encapsulations {
            if enc.kind.is_body() {
                self.observer.on_body_chunk(enc.kind, &enc.data);
            } else {
                self.observer.on_encapsulated_header(enc.kind, &enc.data);
            }
        }
    }
}
