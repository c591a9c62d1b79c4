//! HTTPS listener behavior over real TLS
//!
//! Runs a relay with a self-signed wildcard certificate: the control
//! listener and the HTTPS listener are both TLS-terminated, the test client
//! trusts the generated certificate.

use outpost_metrics::LocalMetrics;
use outpost_proto::{Auth, AuthResp, ControlMessage, NewTunnel, Pong, RegProxy, ReqTunnel};
use outpost_relay::{Relay, RelayConfig, RelayHandle};
use outpost_transport::{FramedConnection, IoStream};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

struct TlsFixture {
    _dir: tempfile::TempDir,
    cert_path: PathBuf,
    key_path: PathBuf,
    connector: TlsConnector,
}

fn tls_fixture() -> TlsFixture {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let cert = rcgen::generate_simple_self_signed(vec![
        "example.com".to_string(),
        "*.example.com".to_string(),
    ])
    .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&cert_path, cert.cert.pem()).unwrap();
    std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert.cert.der().clone()).unwrap();
    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsFixture {
        _dir: dir,
        cert_path,
        key_path,
        connector: TlsConnector::from(Arc::new(client_config)),
    }
}

async fn start_tls_relay(fixture: &TlsFixture) -> (RelayHandle, Arc<LocalMetrics>) {
    let config = RelayConfig {
        domain: "example.com".to_string(),
        http_addr: None,
        https_addr: Some("127.0.0.1:0".parse().unwrap()),
        tunnel_addr: "127.0.0.1:0".parse().unwrap(),
        tls_cert: Some(fixture.cert_path.clone()),
        tls_key: Some(fixture.key_path.clone()),
        port_range_start: 16100,
        port_range_end: 16110,
        auth_token: None,
        handshake_timeout: Duration::from_secs(2),
        rendezvous_timeout: Duration::from_secs(2),
        ping_interval: Duration::from_secs(5),
        drain_window: Duration::from_secs(1),
    };

    let metrics = LocalMetrics::new(Duration::from_secs(3600));
    let handle = Relay::new(config, metrics.clone()).start().await.unwrap();
    (handle, metrics)
}

async fn tls_connect(
    connector: &TlsConnector,
    addr: SocketAddr,
    server_name: &str,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let name = ServerName::try_from(server_name.to_string()).unwrap();
    connector.connect(name, tcp).await.unwrap()
}

async fn authenticate<S: IoStream>(mut conn: FramedConnection<S>) -> (FramedConnection<S>, AuthResp) {
    conn.write_message(&ControlMessage::Auth(Auth {
        version: "2".to_string(),
        mm_version: "1.7".to_string(),
        user: "tester".to_string(),
        password: String::new(),
        os: "darwin".to_string(),
        arch: "arm64".to_string(),
        client_id: String::new(),
    }))
    .await
    .unwrap();

    match conn.read_message().await.unwrap().unwrap() {
        ControlMessage::AuthResp(resp) => (conn, resp),
        other => panic!("expected AuthResp, got {:?}", other),
    }
}

async fn bind_https<S: IoStream>(conn: &mut FramedConnection<S>, subdomain: &str) -> NewTunnel {
    conn.write_message(&ControlMessage::ReqTunnel(ReqTunnel {
        req_id: "req-1".to_string(),
        protocol: "https".to_string(),
        hostname: String::new(),
        subdomain: subdomain.to_string(),
        http_auth: String::new(),
        remote_port: 0,
    }))
    .await
    .unwrap();

    loop {
        match conn.read_message().await.unwrap().unwrap() {
            ControlMessage::NewTunnel(reply) => return reply,
            ControlMessage::Ping(_) => {
                conn.write_message(&ControlMessage::Pong(Pong {}))
                    .await
                    .unwrap();
            }
            ControlMessage::Pong(_) => {}
            other => panic!("unexpected message while binding: {:?}", other),
        }
    }
}

/// A minimal TLS ClientHello record with no server_name extension
fn client_hello_without_sni() -> Vec<u8> {
    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // client version
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0x00); // empty session id
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
    hello.extend_from_slice(&[0x01, 0x00]); // null compression
    hello.extend_from_slice(&[0x00, 0x00]); // empty extensions

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[tokio::test(flavor = "multi_thread")]
async fn https_tunnel_end_to_end() {
    let fixture = tls_fixture();
    let (handle, _metrics) = start_tls_relay(&fixture).await;
    let https_addr = handle.https_addr.unwrap();
    let tunnel_addr = handle.tunnel_addr;

    // Control session over TLS
    let control = tls_connect(&fixture.connector, tunnel_addr, "example.com").await;
    let (mut conn, resp) = authenticate(FramedConnection::new(control)).await;
    assert!(resp.error.is_empty());
    let client_id = resp.client_id.clone();

    let reply = bind_https(&mut conn, "demo").await;
    assert_eq!(reply.error, "");
    assert_eq!(reply.url, "https://demo.example.com");

    // Pump: serve one dial-back, also over TLS
    let connector = fixture.connector.clone();
    tokio::spawn(async move {
        loop {
            match conn.read_message().await {
                Ok(Some(ControlMessage::ReqProxy(_))) => {
                    let stream = tls_connect(&connector, tunnel_addr, "example.com").await;
                    let mut framed = FramedConnection::new(stream);
                    framed
                        .write_message(&ControlMessage::RegProxy(RegProxy {
                            client_id: client_id.clone(),
                        }))
                        .await
                        .unwrap();
                    match framed.read_message().await.unwrap().unwrap() {
                        ControlMessage::StartProxy(start) => {
                            assert_eq!(start.url, "https://demo.example.com");
                        }
                        other => panic!("expected StartProxy, got {:?}", other),
                    }

                    let (mut raw, leftover) = framed.into_inner();
                    let mut captured = leftover.to_vec();
                    while !captured.windows(4).any(|w| w == b"\r\n\r\n") {
                        let mut buf = [0u8; 4096];
                        let n = raw.read(&mut buf).await.unwrap();
                        if n == 0 {
                            break;
                        }
                        captured.extend_from_slice(&buf[..n]);
                    }
                    assert!(String::from_utf8_lossy(&captured)
                        .starts_with("GET /secret HTTP/1.1\r\n"));

                    raw.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                        .await
                        .unwrap();
                    raw.flush().await.unwrap();
                    let _ = raw.shutdown().await;
                }
                Ok(Some(ControlMessage::Ping(_))) => {
                    if conn
                        .write_message(&ControlMessage::Pong(Pong {}))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
    });

    // Public request over TLS with SNI demo.example.com
    let mut public = tls_connect(&fixture.connector, https_addr, "demo.example.com").await;
    public
        .write_all(b"GET /secret HTTP/1.1\r\nHost: demo.example.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    public.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.ends_with("ok"));
}

#[tokio::test(flavor = "multi_thread")]
async fn https_without_sni_is_dropped() {
    let fixture = tls_fixture();
    let (handle, _metrics) = start_tls_relay(&fixture).await;
    let https_addr = handle.https_addr.unwrap();

    let mut stream = TcpStream::connect(https_addr).await.unwrap();
    stream.write_all(&client_hello_without_sni()).await.unwrap();

    // Dropped without a single response byte, and no session was involved
    let mut out = Vec::new();
    let n = stream.read_to_end(&mut out).await.unwrap();
    assert_eq!(n, 0);
    assert_eq!(handle.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn https_unknown_sni_gets_404() {
    let fixture = tls_fixture();
    let (handle, _metrics) = start_tls_relay(&fixture).await;
    let https_addr = handle.https_addr.unwrap();

    // The miss is answered from the SNI lookup alone, before any request
    let mut public = tls_connect(&fixture.connector, https_addr, "nosuch.example.com").await;
    let mut response = Vec::new();
    public.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 404"));
}
