//! Authenticated link tests over real sockets.

mod support;

use network::version::{self, LinkVersion};
use network::{link, tls};
use rustls::pki_types::ServerName;
use support::TestPki;
use tokio::io::AsyncReadExt;
use tokio_rustls::TlsConnector;

#[tokio::test]
async fn test_link_connect_accept() {
    let pki = TestPki::new();
    let listener = link::bind(&pki.endpoint("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let link = listener.accept().await.unwrap();
        let mut demux_side = link.into_stream();
        tokio::io::AsyncWriteExt::write_all(&mut demux_side, b"ready")
            .await
            .unwrap();
    });

    let mut link = link::connect(&pki.endpoint("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 5];
    link.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ready");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_untrusted_client_certificate_rejected() {
    let pki = TestPki::new();
    let other_pki = TestPki::new();
    let listener = link::bind(&pki.endpoint("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        // handshake must fail while verifying the client certificate
        assert!(listener.accept().await.is_err());
    });

    // client trusts the server's CA but presents a certificate from a
    // different CA
    let endpoint = {
        let mut layer = other_pki.tls_layer("127.0.0.1");
        layer.insert("ca_buffer".into(), hex::encode(&pki.ca_der));
        network::endpoint::EndpointStack::tcp("127.0.0.1", port).with_layer(layer)
    };
    if let Ok(mut link_ok) = link::connect(&endpoint).await {
        // TLS 1.3: the rejection can surface on the first read instead
        let mut buf = [0u8; 1];
        let read = link_ok.read(&mut buf).await;
        assert!(read.is_err() || read.unwrap() == 0);
    }
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_untrusted_server_certificate_rejected() {
    let pki = TestPki::new();
    let other_pki = TestPki::new();
    // server uses a CA the client does not trust
    let listener = link::bind(&other_pki.endpoint("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    assert!(link::connect(&pki.endpoint("127.0.0.1", port)).await.is_err());
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_version_mismatch_closes_link() {
    let pki = TestPki::new();
    let listener = link::bind(&pki.endpoint("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server_task = tokio::spawn(async move {
        let err = listener.accept().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<common::Error>(),
            Some(&common::Error::ProtocolNotSupported)
        );
    });

    // handshake manually so a bad minor byte can be sent
    let params = pki.tls_params("127.0.0.1");
    let connector = TlsConnector::from(tls::create_client_config(&params).unwrap());
    let tcp = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let server_name = ServerName::try_from("127.0.0.1").unwrap();
    let mut stream = connector.connect(server_name, tcp).await.unwrap();
    let bad = LinkVersion {
        minor: LinkVersion::default().minor + 1,
        ..LinkVersion::default()
    };
    version::write_word(&mut stream, bad.encode()).await.unwrap();

    // the acceptor closes the link without sending anything
    let mut buf = [0u8; 1];
    let read = stream.read(&mut buf).await;
    assert!(read.is_err() || read.unwrap() == 0);
    server_task.await.unwrap();
}
