//! Fiber demultiplexer tests over in-memory links.

use common::Error;
use network::fiber::{Demux, DemuxConfig};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn demux_pair() -> (Demux, Demux) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (Demux::new(a), Demux::new(b))
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    rand::rng().fill_bytes(&mut payload);
    payload
}

#[tokio::test]
async fn test_connect_accept_echo() {
    let (client, server) = demux_pair();
    let listener = server.bind(7000).unwrap();

    let server_task = tokio::spawn(async move {
        let mut fiber = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 5];
        fiber.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        fiber.write_all(b"world").await.unwrap();
        fiber.shutdown().await.unwrap();
    });

    let mut fiber = client.connect(7000).await.unwrap();
    fiber.write_all(b"hello").await.unwrap();
    let mut buf = vec![0u8; 5];
    fiber.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_bytes_arrive_in_order_without_loss() {
    let (client, server) = demux_pair();
    let listener = server.bind(7000).unwrap();

    // larger than the per-fiber window, so credits must cycle
    let payload = random_payload(2 * 1024 * 1024);
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        let mut fiber = listener.accept().await.unwrap();
        let mut received = Vec::new();
        fiber.read_to_end(&mut received).await.unwrap();
        received
    });

    let mut fiber = client.connect(7000).await.unwrap();
    for chunk in payload.chunks(61 * 1024) {
        fiber.write_all(chunk).await.unwrap();
    }
    fiber.shutdown().await.unwrap();

    let received = server_task.await.unwrap();
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_fibers_are_independent() {
    let (client, server) = demux_pair();
    let listener = server.bind(7000).unwrap();

    let server_task = tokio::spawn(async move {
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let mut fiber = listener.accept().await.unwrap();
            tasks.push(tokio::spawn(async move {
                let mut received = Vec::new();
                fiber.read_to_end(&mut received).await.unwrap();
                fiber.write_all(&received).await.unwrap();
                fiber.shutdown().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    });

    let mut clients = Vec::new();
    for i in 0..4u8 {
        let client = client.clone();
        clients.push(tokio::spawn(async move {
            let payload = vec![i; 100_000 + i as usize];
            let fiber = client.connect(7000).await.unwrap();
            let (mut reader, mut writer) = fiber.into_split();
            let expected = payload.clone();
            let write_task = tokio::spawn(async move {
                writer.write_all(&payload).await.unwrap();
                writer.shutdown().await.unwrap();
                // keep the write half open until the echo comes back
                writer
            });
            let mut echoed = Vec::new();
            reader.read_to_end(&mut echoed).await.unwrap();
            assert_eq!(echoed, expected);
            drop(write_task.await.unwrap());
        }));
    }
    for task in clients {
        task.await.unwrap();
    }
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_connect_refused_without_listener() {
    let (client, _server) = demux_pair();
    let err = client.connect(9999).await.unwrap_err();
    assert_eq!(err, Error::NotConnected);
}

#[tokio::test]
async fn test_half_close_keeps_reverse_direction_open() {
    let (client, server) = demux_pair();
    let listener = server.bind(7000).unwrap();

    let server_task = tokio::spawn(async move {
        let mut fiber = listener.accept().await.unwrap();
        let mut received = Vec::new();
        // read side drains to EOF after the client's shutdown
        fiber.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"request");
        // reverse direction still writable
        fiber.write_all(b"response").await.unwrap();
        fiber.shutdown().await.unwrap();
    });

    let mut fiber = client.connect(7000).await.unwrap();
    fiber.write_all(b"request").await.unwrap();
    fiber.shutdown().await.unwrap();
    let mut response = Vec::new();
    fiber.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"response");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_duplicate_bind_rejected() {
    let (_client, server) = demux_pair();
    let _listener = server.bind(7000).unwrap();
    assert!(matches!(server.bind(7000), Err(Error::AddressInUse)));
}

#[tokio::test]
async fn test_demux_close_cancels_pending_accept() {
    let (_client, server) = demux_pair();
    let listener = server.bind(7000).unwrap();
    let accept_task = tokio::spawn(async move { listener.accept().await });
    tokio::task::yield_now().await;
    server.close();
    let err = accept_task.await.unwrap().unwrap_err();
    assert_eq!(err, Error::OperationCanceled);
}

#[tokio::test]
async fn test_link_failure_fails_established_fibers() {
    let (client, server) = demux_pair();
    let listener = server.bind(7000).unwrap();

    let server_task = tokio::spawn(async move {
        let fiber = listener.accept().await.unwrap();
        fiber
    });
    let mut fiber = client.connect(7000).await.unwrap();
    let _server_fiber = server_task.await.unwrap();

    // tearing the peer demux down kills the link under the fiber
    server.close();
    let mut buf = [0u8; 16];
    let err = fiber.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    assert_eq!(client.closed().await, Error::NotConnected);
}

#[tokio::test]
async fn test_fiber_abort_resets_peer() {
    let (client, server) = demux_pair();
    let listener = server.bind(7000).unwrap();

    let server_task = tokio::spawn(async move { listener.accept().await.unwrap() });
    let mut fiber = client.connect(7000).await.unwrap();
    let mut peer = server_task.await.unwrap();

    fiber.close();
    let mut buf = [0u8; 4];
    let err = peer.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::Interrupted);
}

#[tokio::test]
async fn test_small_window_still_reliable() {
    let (a, b) = tokio::io::duplex(8 * 1024);
    let config = DemuxConfig {
        window: 4 * 1024,
        ..DemuxConfig::default()
    };
    let client = Demux::with_config(a, config);
    let server = Demux::with_config(b, config);
    let listener = server.bind(7000).unwrap();

    let payload = random_payload(256 * 1024);
    let expected = payload.clone();
    let server_task = tokio::spawn(async move {
        let mut fiber = listener.accept().await.unwrap();
        let mut received = Vec::new();
        fiber.read_to_end(&mut received).await.unwrap();
        received
    });

    let mut fiber = client.connect(7000).await.unwrap();
    fiber.write_all(&payload).await.unwrap();
    fiber.shutdown().await.unwrap();
    assert_eq!(server_task.await.unwrap(), expected);
}
