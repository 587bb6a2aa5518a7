use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use icap_filter::Server;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_acceptor_and_workers() {
    let server = Server::builder()
        .bind("127.0.0.1:0")
        .with_read_timeout(Duration::from_secs(30))
        .build()
        .await
        .expect("build");
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let run = tokio::spawn(server.run());

    // An established, idle connection is parked in a read.
    let mut idle = TcpStream::connect(addr).await.unwrap();
    idle.write_all(format!("OPTIONS icap://{addr}/ ICAP/1.0\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut buf = [0u8; 1024];
    let mut reply = Vec::new();
    while !reply.ends_with(b"\r\n\r\n\r\n") {
        let n = timeout(Duration::from_secs(2), idle.read(&mut buf))
            .await
            .expect("no OPTIONS reply")
            .unwrap();
        assert!(n > 0, "closed before the OPTIONS reply");
        reply.extend_from_slice(&buf[..n]);
    }

    handle.shutdown();

    let res = timeout(Duration::from_secs(2), run)
        .await
        .expect("acceptor did not stop")
        .expect("join");
    assert!(res.is_ok(), "{res:?}");

    // The worker sees the flag well before its 30 s read timeout.
    let n = timeout(Duration::from_secs(2), idle.read(&mut buf))
        .await
        .expect("worker kept the connection open")
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn no_new_connections_after_shutdown() {
    let server = Server::builder().bind("127.0.0.1:0").build().await.unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.shutdown_handle();
    let run = tokio::spawn(server.run());

    handle.shutdown();
    let _ = timeout(Duration::from_secs(2), run).await.expect("stop");

    // The listener is dropped with the server.
    assert!(TcpStream::connect(addr).await.is_err());
}
