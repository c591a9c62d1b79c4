//! End-to-end tunnel scenarios over loopback sockets
//!
//! Each test starts a full relay on ephemeral ports and drives it with a
//! minimal in-test client speaking the control protocol: authenticate,
//! bind, then answer `ReqProxy` by dialing back a second transport.

use outpost_metrics::LocalMetrics;
use outpost_proto::{Auth, AuthResp, ControlMessage, NewTunnel, Pong, RegProxy, ReqTunnel};
use outpost_relay::{Relay, RelayConfig, RelayHandle};
use outpost_transport::FramedConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

fn test_config(port_start: u16, port_end: u16) -> RelayConfig {
    RelayConfig {
        domain: "example.com".to_string(),
        http_addr: Some("127.0.0.1:0".parse().unwrap()),
        https_addr: None,
        tunnel_addr: "127.0.0.1:0".parse().unwrap(),
        tls_cert: None,
        tls_key: None,
        port_range_start: port_start,
        port_range_end: port_end,
        auth_token: None,
        handshake_timeout: Duration::from_secs(2),
        rendezvous_timeout: Duration::from_secs(2),
        ping_interval: Duration::from_secs(5),
        drain_window: Duration::from_secs(1),
    }
}

async fn start_relay(config: RelayConfig) -> (RelayHandle, Arc<LocalMetrics>) {
    let metrics = LocalMetrics::new(Duration::from_secs(3600));
    let handle = Relay::new(config, metrics.clone()).start().await.unwrap();
    (handle, metrics)
}

async fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

async fn authenticate(
    tunnel_addr: SocketAddr,
    password: &str,
) -> (FramedConnection<TcpStream>, AuthResp) {
    let stream = TcpStream::connect(tunnel_addr).await.unwrap();
    let mut conn = FramedConnection::new(stream);
    conn.write_message(&ControlMessage::Auth(Auth {
        version: "2".to_string(),
        mm_version: "1.7".to_string(),
        user: "tester".to_string(),
        password: password.to_string(),
        os: "linux".to_string(),
        arch: "amd64".to_string(),
        client_id: String::new(),
    }))
    .await
    .unwrap();

    match conn.read_message().await.unwrap().unwrap() {
        ControlMessage::AuthResp(resp) => (conn, resp),
        other => panic!("expected AuthResp, got {:?}", other),
    }
}

struct TestClient {
    conn: FramedConnection<TcpStream>,
    client_id: String,
}

impl TestClient {
    async fn connect(tunnel_addr: SocketAddr) -> Self {
        let (conn, resp) = authenticate(tunnel_addr, "").await;
        assert!(resp.error.is_empty(), "auth failed: {}", resp.error);
        assert!(!resp.client_id.is_empty());
        Self {
            conn,
            client_id: resp.client_id,
        }
    }

    async fn bind(
        &mut self,
        protocol: &str,
        subdomain: &str,
        http_auth: &str,
        remote_port: u16,
    ) -> NewTunnel {
        self.conn
            .write_message(&ControlMessage::ReqTunnel(ReqTunnel {
                req_id: "req-1".to_string(),
                protocol: protocol.to_string(),
                hostname: String::new(),
                subdomain: subdomain.to_string(),
                http_auth: http_auth.to_string(),
                remote_port,
            }))
            .await
            .unwrap();

        loop {
            match self.conn.read_message().await.unwrap().unwrap() {
                ControlMessage::NewTunnel(reply) => return reply,
                ControlMessage::Ping(_) => {
                    self.conn
                        .write_message(&ControlMessage::Pong(Pong {}))
                        .await
                        .unwrap();
                }
                ControlMessage::Pong(_) => {}
                other => panic!("unexpected message while binding: {:?}", other),
            }
        }
    }

    /// Run the control pump in the background: answer pings and, when
    /// `response` is set, serve each `ReqProxy` by dialing back. Captured
    /// public bytes come out of the returned channel.
    fn serve(
        self,
        tunnel_addr: SocketAddr,
        response: Option<Vec<u8>>,
        stop: StopWhen,
    ) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (captured_tx, captured_rx) = mpsc::unbounded_channel();
        let mut conn = self.conn;
        let client_id = self.client_id;

        tokio::spawn(async move {
            loop {
                match conn.read_message().await {
                    Ok(Some(ControlMessage::ReqProxy(_))) => {
                        if let Some(response) = &response {
                            let captured =
                                dial_back(tunnel_addr, &client_id, response, stop).await;
                            let _ = captured_tx.send(captured);
                        }
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

        captured_rx
    }
}

#[derive(Clone, Copy)]
enum StopWhen {
    HeadComplete,
    BytesRead(usize),
}

/// Dial back a proxy transport, capture the public request, answer it
async fn dial_back(
    tunnel_addr: SocketAddr,
    client_id: &str,
    response: &[u8],
    stop: StopWhen,
) -> Vec<u8> {
    let stream = TcpStream::connect(tunnel_addr).await.unwrap();
    let mut framed = FramedConnection::new(stream);
    framed
        .write_message(&ControlMessage::RegProxy(RegProxy {
            client_id: client_id.to_string(),
        }))
        .await
        .unwrap();

    match framed.read_message().await.unwrap().unwrap() {
        ControlMessage::StartProxy(_) => {}
        other => panic!("expected StartProxy, got {:?}", other),
    }

    let (mut raw, leftover) = framed.into_inner();
    let mut captured = leftover.to_vec();

    let done = |captured: &[u8]| match stop {
        StopWhen::HeadComplete => captured
            .windows(4)
            .any(|window| window == b"\r\n\r\n"),
        StopWhen::BytesRead(n) => captured.len() >= n,
    };

    while !done(&captured) {
        let mut buf = [0u8; 4096];
        let n = raw.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&buf[..n]);
    }

    raw.write_all(response).await.unwrap();
    raw.flush().await.unwrap();
    let _ = raw.shutdown().await;
    captured
}

/// One public HTTP request; returns (status, full response text)
async fn http_get(addr: SocketAddr, host: &str, extra_headers: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET / HTTP/1.1\r\nHost: {}\r\n{}\r\n", host, extra_headers);
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response).to_string();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (status, text)
}

// ============================================================================
// S1: HTTP tunnel happy path
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn http_tunnel_happy_path() {
    let (handle, metrics) = start_relay(test_config(15000, 15010)).await;

    let mut client = TestClient::connect(handle.tunnel_addr).await;
    let reply = client.bind("http", "demo", "", 0).await;
    assert_eq!(reply.error, "");
    assert_eq!(reply.url, "http://demo.example.com");
    assert_eq!(handle.tunnel_count(), 1);

    let mut captured_rx = client.serve(
        handle.tunnel_addr,
        Some(OK_RESPONSE.to_vec()),
        StopWhen::HeadComplete,
    );

    let http_addr = handle.http_addr.unwrap();
    let (status, text) = http_get(http_addr, "demo.example.com", "").await;
    assert_eq!(status, 200);
    assert!(text.ends_with("hello"));

    // The public request reached the client byte-for-byte
    let captured = captured_rx.recv().await.unwrap();
    let expected = b"GET / HTTP/1.1\r\nHost: demo.example.com\r\n\r\n";
    assert_eq!(captured, expected.to_vec());

    // Byte totals match what actually moved in each direction
    let metrics_settled = wait_until(
        || {
            let snap = metrics.snapshot();
            snap.connections.current == 0 && snap.connections.total == 1
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(metrics_settled);

    let snap = metrics.snapshot();
    assert_eq!(snap.bytes_in, expected.len() as u64);
    assert_eq!(snap.bytes_out, OK_RESPONSE.len() as u64);
    assert_eq!(snap.http_tunnels.current, 1);
    assert_eq!(snap.live_urls, vec!["http://demo.example.com"]);

    handle.shutdown().await;
}

// ============================================================================
// S2: TCP tunnel with auto-allocated port
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn tcp_tunnel_auto_port() {
    let (handle, metrics) = start_relay(test_config(15100, 15150)).await;

    let mut client = TestClient::connect(handle.tunnel_addr).await;
    let reply = client.bind("tcp", "", "", 0).await;
    assert_eq!(reply.error, "");

    let port: u16 = reply
        .url
        .strip_prefix("tcp://example.com:")
        .expect("tcp url shape")
        .parse()
        .unwrap();
    assert!((15100..=15150).contains(&port));

    let _captured_rx = client.serve(
        handle.tunnel_addr,
        Some(b"pong".to_vec()),
        StopWhen::BytesRead(4),
    );

    let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    public.write_all(b"ping").await.unwrap();
    let mut out = Vec::new();
    public.read_to_end(&mut out).await.unwrap();
    assert_eq!(out, b"pong");

    let settled = wait_until(
        || metrics.snapshot().connections.current == 0,
        Duration::from_secs(2),
    )
    .await;
    assert!(settled);
    let snap = metrics.snapshot();
    assert_eq!(snap.tcp_tunnels.current, 1);
    assert_eq!(snap.bytes_in, 4);
    assert_eq!(snap.bytes_out, 4);
}

// ============================================================================
// S3: duplicate subdomain is rejected, second session stays open
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_subdomain_rejected() {
    let (handle, _metrics) = start_relay(test_config(15200, 15210)).await;

    let mut first = TestClient::connect(handle.tunnel_addr).await;
    let reply = first.bind("http", "taken", "", 0).await;
    assert_eq!(reply.error, "");

    let mut second = TestClient::connect(handle.tunnel_addr).await;
    let conflict = second.bind("http", "taken", "", 0).await;
    assert!(!conflict.error.is_empty());
    assert_eq!(conflict.url, "");

    // The losing session is still healthy and can bind elsewhere
    let retry = second.bind("http", "other", "", 0).await;
    assert_eq!(retry.error, "");
    assert_eq!(retry.url, "http://other.example.com");
    assert_eq!(handle.session_count(), 2);
}

// ============================================================================
// S4: HTTP basic auth enforced at the listener
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn http_basic_auth() {
    let (handle, _metrics) = start_relay(test_config(15300, 15310)).await;
    let http_addr = handle.http_addr.unwrap();

    let mut client = TestClient::connect(handle.tunnel_addr).await;
    let reply = client.bind("http", "secure", "alice:pw", 0).await;
    assert_eq!(reply.error, "");

    let mut captured_rx = client.serve(
        handle.tunnel_addr,
        Some(OK_RESPONSE.to_vec()),
        StopWhen::HeadComplete,
    );

    // No credentials: 401 with a challenge, client never engaged
    let (status, text) = http_get(http_addr, "secure.example.com", "").await;
    assert_eq!(status, 401);
    assert!(text.contains("WWW-Authenticate: Basic realm="));

    // Wrong credentials ("alice:wrong")
    let (status, _) = http_get(
        http_addr,
        "secure.example.com",
        "Authorization: Basic YWxpY2U6d3Jvbmc=\r\n",
    )
    .await;
    assert_eq!(status, 401);

    // Correct credentials ("alice:pw") proxy through
    let (status, text) = http_get(
        http_addr,
        "secure.example.com",
        "Authorization: Basic YWxpY2U6cHc=\r\n",
    )
    .await;
    assert_eq!(status, 200);
    assert!(text.ends_with("hello"));

    let captured = captured_rx.recv().await.unwrap();
    assert!(String::from_utf8_lossy(&captured).contains("Authorization: Basic YWxpY2U6cHc="));
    assert!(captured_rx.try_recv().is_err(), "401s must not reach the client");
}

// ============================================================================
// S5: client vanishes; URL released, gauges drop, waiting request fails
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn client_vanishes() {
    let (handle, metrics) = start_relay(test_config(15400, 15410)).await;
    let http_addr = handle.http_addr.unwrap();

    let mut client = TestClient::connect(handle.tunnel_addr).await;
    let reply = client.bind("http", "ghost", "", 0).await;
    assert_eq!(reply.error, "");

    // A public request is parked waiting for the dial-back
    let pending = tokio::spawn(async move { http_get(http_addr, "ghost.example.com", "").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Kill the control transport mid-flight
    drop(client);

    let (status, _) = pending.await.unwrap();
    assert_eq!(status, 502);

    let drained = wait_until(|| handle.tunnel_count() == 0, Duration::from_secs(2)).await;
    assert!(drained);
    assert_eq!(handle.session_count(), 0);
    assert_eq!(metrics.snapshot().http_tunnels.current, 0);

    // The URL is free again for a new session
    let mut replacement = TestClient::connect(handle.tunnel_addr).await;
    let rebound = replacement.bind("http", "ghost", "", 0).await;
    assert_eq!(rebound.error, "");

    // And an unknown host after teardown is a plain 404
    let (status, _) = http_get(http_addr, "gone.example.com", "").await;
    assert_eq!(status, 404);
}

// ============================================================================
// S6: rendezvous timeout; listener gets a 504, session stays healthy
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn rendezvous_timeout() {
    let mut config = test_config(15500, 15510);
    config.rendezvous_timeout = Duration::from_millis(300);
    let (handle, metrics) = start_relay(config).await;
    let http_addr = handle.http_addr.unwrap();

    let mut client = TestClient::connect(handle.tunnel_addr).await;
    let reply = client.bind("http", "slow", "", 0).await;
    assert_eq!(reply.error, "");

    // The pump answers pings but never dials back
    let _rx = client.serve(handle.tunnel_addr, None, StopWhen::HeadComplete);

    let (status, _) = http_get(http_addr, "slow.example.com", "").await;
    assert_eq!(status, 504);

    // The session and its tunnel survived the timeout
    assert_eq!(handle.session_count(), 1);
    assert_eq!(handle.tunnel_count(), 1);
    assert_eq!(metrics.snapshot().connections.total, 0);
}

// ============================================================================
// Heartbeat expiry closes the session and counts exactly once
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_expiry_closes_session() {
    let mut config = test_config(15600, 15610);
    config.ping_interval = Duration::from_millis(100);
    let (handle, metrics) = start_relay(config).await;

    let mut client = TestClient::connect(handle.tunnel_addr).await;
    let reply = client.bind("http", "mute", "", 0).await;
    assert_eq!(reply.error, "");

    // Stop reading and never answer another ping; keep the socket open so
    // the session can only die by deadline
    let expired = wait_until(
        || metrics.snapshot().lost_heartbeats == 1 && handle.session_count() == 0,
        Duration::from_secs(3),
    )
    .await;
    assert!(expired);
    assert_eq!(metrics.snapshot().lost_heartbeats, 1);
    assert_eq!(handle.tunnel_count(), 0);

    drop(client);
}

// ============================================================================
// Boundary behavior
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn unknown_host_and_missing_host() {
    let (handle, _metrics) = start_relay(test_config(15700, 15710)).await;
    let http_addr = handle.http_addr.unwrap();

    let (status, text) = http_get(http_addr, "nosuch.example.com", "").await;
    assert_eq!(status, 404);
    assert!(text.contains("not found"));

    let mut stream = TcpStream::connect(http_addr).await.unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 400"));
}

#[tokio::test(flavor = "multi_thread")]
async fn shared_secret_rejects_bad_password() {
    let mut config = test_config(15800, 15810);
    config.auth_token = Some("sekrit".to_string());
    let (handle, _metrics) = start_relay(config).await;

    let (_conn, resp) = authenticate(handle.tunnel_addr, "wrong").await;
    assert!(!resp.error.is_empty());
    assert!(resp.client_id.is_empty());
    assert_eq!(handle.session_count(), 0);

    let (_conn, resp) = authenticate(handle.tunnel_addr, "sekrit").await;
    assert!(resp.error.is_empty());
    assert!(!resp.client_id.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_bind_is_per_request_error() {
    let (handle, _metrics) = start_relay(test_config(15900, 15910)).await;

    let mut client = TestClient::connect(handle.tunnel_addr).await;
    let reply = client.bind("udp", "", "", 0).await;
    assert!(!reply.error.is_empty());

    // The session survives the rejected bind
    let retry = client.bind("http", "afterudp", "", 0).await;
    assert_eq!(retry.error, "");
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_port_exhaustion_reported() {
    let (handle, _metrics) = start_relay(test_config(16000, 16001)).await;

    let mut client = TestClient::connect(handle.tunnel_addr).await;

    let first = client.bind("tcp", "", "", 0).await;
    assert_eq!(first.error, "");
    let second = client.bind("tcp", "", "", 0).await;
    assert_eq!(second.error, "");

    // Range of two is now exhausted; the error is per-request
    let third = client.bind("tcp", "", "", 0).await;
    assert!(!third.error.is_empty());
    assert_eq!(handle.session_count(), 1);
}
