use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use icap_filter::{Server, ServiceOptions};

/// Start a server on an ephemeral port with a global connection limit.
async fn start_server_with_limit(limit: usize) -> io::Result<SocketAddr> {
    let server = Server::builder()
        .bind("127.0.0.1:0")
        .with_options(ServiceOptions::new("Limited", "limit-1"))
        .with_max_connections(limit)
        .build()
        .await
        .map_err(|e| io::Error::other(format!("build: {e}")))?;
    let addr = server.local_addr().map_err(io::Error::other)?;

    tokio::spawn(async move {
        let _ = server.run().await;
    });
    Ok(addr)
}

/// Read a small chunk with a timeout.
/// Ok(Some(n)) — read n bytes; Ok(None) — EOF; Ok(Some(0)) — timed out (socket still open).
async fn read_some_with_timeout(s: &mut TcpStream, ms: u64) -> io::Result<Option<usize>> {
    match timeout(Duration::from_millis(ms), s.read(&mut [0u8; 4096])).await {
        Ok(Ok(0)) => Ok(None),
        Ok(Ok(n)) => Ok(Some(n)),
        Ok(Err(e)) => Err(e),
        Err(_) => Ok(Some(0)),
    }
}

fn build_options(addr: SocketAddr) -> Vec<u8> {
    format!("OPTIONS icap://{addr}/filter ICAP/1.0\r\nHost: {addr}\r\n\r\n").into_bytes()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn over_limit_connection_gets_503_with_istag() -> io::Result<()> {
    let addr = start_server_with_limit(1).await?;

    // First connection occupies the permit.
    let _hold = TcpStream::connect(addr).await?;
    sleep(Duration::from_millis(30)).await;

    let mut c2 = TcpStream::connect(addr).await?;
    let mut buf = vec![0u8; 2048];
    let mut reply = Vec::new();
    while !reply.ends_with(b"\r\n\r\n\r\n") {
        let n = timeout(Duration::from_millis(500), c2.read(&mut buf)).await??;
        assert!(n > 0, "expected to receive ICAP 503 response bytes");
        reply.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&reply);
    assert!(
        head.starts_with("ICAP/1.0 503 Service Unavailable\r\n"),
        "expected ICAP/1.0 503 status line, got:\n{head}"
    );
    assert!(head.contains("Encapsulated: null-body=0\r\n"), "{head}");
    assert!(head.contains("ISTag: \"limit-1\"\r\n"), "{head}");

    // The refused connection is closed by the server.
    assert_eq!(read_some_with_timeout(&mut c2, 500).await.ok().flatten(), None);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permit_is_released_when_connection_closes() -> io::Result<()> {
    let addr = start_server_with_limit(1).await?;

    {
        let mut c1 = TcpStream::connect(addr).await?;
        c1.write_all(&build_options(addr)).await?;
        let got = read_some_with_timeout(&mut c1, 500).await?;
        assert!(matches!(got, Some(n) if n > 0), "first client got no OPTIONS reply");
    }
    sleep(Duration::from_millis(100)).await;

    let mut c2 = TcpStream::connect(addr).await?;
    c2.write_all(&build_options(addr)).await?;
    let mut buf = vec![0u8; 2048];
    let n = timeout(Duration::from_millis(500), c2.read(&mut buf)).await??;
    let head = String::from_utf8_lossy(&buf[..n]);
    assert!(head.starts_with("ICAP/1.0 200 OK"), "got:\n{head}");
    assert!(head.contains("Max-Connections: 1\r\n"), "{head}");
    Ok(())
}
