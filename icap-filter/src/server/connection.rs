//! Per-connection worker.
//!
//! Reads the socket into an accumulator, cuts frames out of it, parses each
//! frame and answers it. Sending a response and reading the next frame are
//! strictly sequential. A bad message or a failing handler costs that message
//! only; the connection goes on.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::IcapResult;
use crate::parser::FrameParser;
use crate::parser::wire::delimited_frame_len;
use crate::request::{Method, Request};
use crate::response::Response;
use crate::server::{ConnectionInfo, FrameMode, Shared};

/// Serve one connection until the peer leaves, the read timeout expires or
/// shutdown is signalled.
///
/// Only socket write failures surface as errors.
pub(crate) async fn serve(
    mut socket: TcpStream,
    conn: ConnectionInfo,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) -> IcapResult<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(shared.chunk_size * 4);
    let mut tmp = vec![0u8; shared.chunk_size];

    loop {
        skip_blank_lines(&mut buf);

        if shared.frame_mode == FrameMode::Delimited {
            if let Some(len) = delimited_frame_len(&buf) {
                let frame: Vec<u8> = buf.drain(..len).collect();
                respond(&mut socket, conn, &shared, &frame).await?;
                continue;
            }
        }

        if buf.len() > shared.max_frame_bytes {
            warn!(
                conn = conn.id,
                len = buf.len(),
                limit = shared.max_frame_bytes,
                "discarding oversized frame"
            );
            buf.clear();
        }

        if *shutdown.borrow_and_update() {
            debug!(conn = conn.id, "shutdown observed");
            return Ok(());
        }

        let read = tokio::select! {
            _ = shutdown.changed() => {
                debug!(conn = conn.id, "shutdown observed");
                return Ok(());
            }
            r = timeout(shared.read_timeout, socket.read(&mut tmp)) => r,
        };

        let n = match read {
            Err(_) => {
                debug!(conn = conn.id, timeout = ?shared.read_timeout, "idle connection timed out");
                return Ok(());
            }
            Ok(Err(e)) => {
                debug!(conn = conn.id, error = %e, "read failed");
                return Ok(());
            }
            Ok(Ok(0)) => {
                if !buf.is_empty() {
                    trace!(conn = conn.id, len = buf.len(), "peer closed with buffered bytes");
                    let frame = std::mem::take(&mut buf);
                    respond(&mut socket, conn, &shared, &frame).await?;
                }
                return Ok(());
            }
            Ok(Ok(n)) => n,
        };

        trace!(conn = conn.id, n, "read");
        buf.extend_from_slice(&tmp[..n]);

        // heuristic: a read that did not fill the chunk ends the frame
        if shared.frame_mode == FrameMode::ShortRead && n < tmp.len() {
            let frame = std::mem::take(&mut buf);
            respond(&mut socket, conn, &shared, &frame).await?;
        }
    }
}

/// Stray line breaks between messages are not part of any frame.
fn skip_blank_lines(buf: &mut Vec<u8>) {
    let n = buf
        .iter()
        .take_while(|&&b| b == b'\r' || b == b'\n')
        .count();
    if n > 0 {
        buf.drain(..n);
    }
}

/// Parse one frame and write the answer, if there is one.
async fn respond(
    socket: &mut TcpStream,
    conn: ConnectionInfo,
    shared: &Shared,
    frame: &[u8],
) -> IcapResult<()> {
    let parser = FrameParser::with_observer(shared.observer.as_ref());
    let req = match parser.parse(frame) {
        Ok(req) => req,
        Err(e) => {
            warn!(
                conn = conn.id,
                kind = %e.kind,
                state = ?e.state,
                raw = %e.raw,
                "dropping malformed ICAP request: {}",
                e.detail
            );
            return Ok(());
        }
    };
    trace!(conn = conn.id, method = %req.method, uri = %req.uri, "received request");

    let resp = match req.method {
        Method::Options => Some(shared.options.build_response()),
        Method::ReqMod | Method::RespMod => invoke_handler(conn, shared, req).await,
    };

    if let Some(resp) = resp {
        let bytes = resp.to_raw(&shared.options.istag);
        socket.write_all(&bytes).await?;
        trace!(conn = conn.id, status = %resp.status_code, "response sent");
    }
    Ok(())
}

/// Run the handler in its own task so that a panic is contained.
async fn invoke_handler(conn: ConnectionInfo, shared: &Shared, req: Request) -> Option<Response> {
    let handler = Arc::clone(&shared.handler);
    let req = Arc::new(req);
    let task = tokio::spawn(async move { handler(conn, req).await });

    match task.await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            warn!(conn = conn.id, error = %e, "handler failed");
            None
        }
        Err(e) if e.is_panic() => {
            warn!(conn = conn.id, "handler panicked");
            None
        }
        Err(e) => {
            warn!(conn = conn.id, error = %e, "handler task aborted");
            None
        }
    }
}
