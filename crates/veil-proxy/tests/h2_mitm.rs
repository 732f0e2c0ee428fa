use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use veil_proxy::{
    builtin_profile, BrowserIdentity, EmulationProfile, OsIdentity, ProxyConfig, ResourceState,
    SessionProxyRegistry, VecSink,
};

fn chrome_88_windows_10() -> EmulationProfile {
    builtin_profile(
        &BrowserIdentity::new("chrome", "88"),
        &OsIdentity::new("windows", "10"),
    )
    .expect("chrome 88 / windows 10 profile")
}

/// h2 origin serving one GET with a small body, then closing gracefully.
async fn spawn_h2_origin() -> (u16, tokio::task::JoinHandle<()>) {
    let key = rcgen::KeyPair::generate().expect("origin key");
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .expect("origin params")
        .self_signed(&key)
        .expect("origin cert");

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .expect("origin tls config");
    server_config.alpn_protocols = vec![b"h2".to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(server_config));

    let listener = TcpListener::bind(("127.0.0.1", 0)).await.expect("origin bind");
    let port = listener.local_addr().expect("origin addr").port();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("origin accept");
        let tls = acceptor.accept(stream).await.expect("origin tls accept");
        let mut connection = h2::server::handshake(tls).await.expect("origin h2 handshake");

        while let Some(next_stream) = connection.accept().await {
            let (request, mut respond) = match next_stream {
                Ok(parts) => parts,
                Err(_) => break,
            };
            assert_eq!(request.method(), http::Method::GET);

            let response = http::Response::builder()
                .status(http::StatusCode::OK)
                .body(())
                .expect("response");
            let mut body = respond.send_response(response, false).expect("send headers");
            body.send_data(Bytes::from_static(b"hi-h2"), true)
                .expect("send body");
        }
    });

    (port, handle)
}

async fn connect_through_proxy(proxy_port: u16, origin_port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port))
        .await
        .expect("connect to proxy");
    let connect = format!("CONNECT localhost:{origin_port} HTTP/1.1\r\n\r\n");
    stream
        .write_all(connect.as_bytes())
        .await
        .expect("send CONNECT");

    let mut response = Vec::new();
    let mut chunk = [0_u8; 256];
    loop {
        let read = stream.read(&mut chunk).await.expect("read CONNECT response");
        assert!(read > 0, "proxy closed before CONNECT response");
        response.extend_from_slice(&chunk[..read]);
        if response.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    assert!(String::from_utf8_lossy(&response).contains("200 Connection Established"));
    stream
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multiplexed_h2_stream_becomes_its_own_resource() {
    let dir = tempfile::tempdir().expect("tempdir");
    let sink = VecSink::default();
    let mut config = ProxyConfig {
        data_dir: dir.path().to_path_buf(),
        ..ProxyConfig::default()
    };
    config.upstream.verify_upstream_tls = false;
    let registry =
        SessionProxyRegistry::new(config, Arc::new(sink.clone())).expect("registry");

    let (origin_port, origin) = spawn_h2_origin().await;
    let proxy_port = registry
        .register_session("session-h2", chrome_88_windows_10())
        .await
        .expect("register session");

    registry
        .page_request_issued(
            "session-h2",
            &format!("https://localhost:{origin_port}/data"),
            "GET",
            None,
            SystemTime::now(),
        )
        .expect("report page request");

    let stream = connect_through_proxy(proxy_port, origin_port).await;

    let ca_der =
        CertificateDer::from_pem_slice(registry.ca_cert_pem().as_bytes()).expect("proxy CA");
    let mut roots = rustls::RootCertStore::empty();
    roots.add(ca_der).expect("trust proxy CA");
    let mut client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_config.alpn_protocols = vec![b"h2".to_vec()];

    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
    let server_name = ServerName::try_from("localhost").expect("server name");
    let tls = connector
        .connect(server_name, stream)
        .await
        .expect("browser-side tls");
    assert_eq!(tls.get_ref().1.alpn_protocol(), Some(b"h2".as_ref()));

    let (h2_client, h2_connection) = h2::client::handshake(tls).await.expect("h2 handshake");
    let driver = tokio::spawn(h2_connection);

    let request = http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("https://localhost:{origin_port}/data"))
        .body(())
        .expect("request");

    let mut h2_client = h2_client.ready().await.expect("client ready");
    let (response_future, _request_body) = h2_client.send_request(request, true).expect("send");
    let response = response_future.await.expect("response");
    assert_eq!(response.status(), http::StatusCode::OK);

    let mut body = response.into_body();
    let mut received = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.expect("body chunk");
        received.extend_from_slice(&chunk);
        let _ = body.flow_control().release_capacity(chunk.len());
    }
    assert_eq!(received, b"hi-h2");

    drop(h2_client);
    let _ = driver.await;
    origin.await.expect("origin served");

    // Two finalized resources: the stream and the carrying connection.
    let mut stream_record = None;
    let mut connection_record = None;
    for _ in 0..100 {
        let records = sink.snapshot();
        stream_record = records
            .iter()
            .find(|record| {
                record.terminal_state() == Some(ResourceState::Complete)
                    && record
                        .states
                        .iter()
                        .any(|(state, _)| *state == ResourceState::RequestSent)
            })
            .cloned();
        connection_record = records
            .iter()
            .find(|record| {
                record.terminal_state() == Some(ResourceState::Complete)
                    && record
                        .states
                        .iter()
                        .any(|(state, _)| *state == ResourceState::TlsHandshaked)
            })
            .cloned();
        if stream_record.is_some() && connection_record.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let stream_record = stream_record.expect("stream-level resource finalized");
    let connection_record = connection_record.expect("connection-level resource finalized");

    let stream_states: Vec<ResourceState> =
        stream_record.states.iter().map(|(state, _)| *state).collect();
    assert!(stream_states.contains(&ResourceState::RequestSending));
    assert!(stream_states.contains(&ResourceState::ResponseHeaders));
    assert_eq!(stream_states.last(), Some(&ResourceState::Complete));

    let bound_request = stream_record.request.as_ref().expect("request bound to stream");
    assert!(bound_request.url.ends_with("/data"));

    let stream_socket = stream_record.socket.as_ref().expect("carrier socket attached");
    assert_eq!(stream_socket.alpn.as_deref(), Some("h2"));
    assert_eq!(
        stream_socket.id,
        connection_record.socket.as_ref().expect("socket").id,
        "stream resources ride the same socket as the connection resource"
    );

    registry
        .release_session("session-h2")
        .await
        .expect("release session");
}
