//! CONNECT tunnel tests
//!
//! Drive real TCP and TLS through the proxy against a local TLS origin.

mod common;

use common::{
    connect_and_read_all, send_connect, server_name, spawn_proxy, spawn_tls_origin,
    tls_connector, MemorySink, ProxyOptions,
};
use interceptor::{RequestSink, Transport, TUNNEL_ACK};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

async fn tunnel_get(
    proxy: &common::TestProxy,
    origin: std::net::SocketAddr,
    path: &str,
) -> (String, tokio_rustls::client::TlsStream<tokio::net::TcpStream>) {
    let target = origin.to_string();
    let (stream, ack) = send_connect(proxy.addr, &target, TUNNEL_ACK.len()).await;
    assert_eq!(ack, TUNNEL_ACK);

    let connector = tls_connector(proxy.ca.root_der());
    let mut tls = connector
        .connect(server_name("127.0.0.1"), stream)
        .await
        .expect("client should trust the proxy-issued leaf");

    let request = format!("GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: tunnel-test\r\n\r\n", path, target);
    tls.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    let _ = tls.read_to_end(&mut response).await;
    (String::from_utf8_lossy(&response).into_owned(), tls)
}

// ============================================================================
// Tunnel establishment
// ============================================================================

#[tokio::test]
async fn test_tunnel_ack_is_exact_and_traffic_is_relayed() {
    let origin = spawn_tls_origin().await;
    let sink = Arc::new(MemorySink::default());
    let proxy = spawn_proxy(
        Arc::clone(&sink) as Arc<dyn RequestSink>,
        ProxyOptions {
            origin_roots: vec![origin.root.clone()],
            ..Default::default()
        },
    )
    .await;

    let (response, tls) = tunnel_get(&proxy, origin.addr, "/hello?x=1").await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", response);
    assert!(response.ends_with("origin saw: GET /hello?x=1 HTTP/1.1"));

    // Closing the client side ends the client-to-origin relay
    drop(tls);

    let records = sink.wait_for(1).await;
    let record = &records[0];
    assert_eq!(record.method(), "GET");
    assert_eq!(record.host(), origin.addr.to_string());
    assert_eq!(record.url(), "/hello?x=1");
    assert_eq!(record.path(), format!("{}/hello?x=1", origin.addr));
    assert_eq!(record.header("user-agent"), Some("tunnel-test"));
    assert_eq!(record.transport(), Transport::InterceptedTls);
}

#[tokio::test]
async fn test_each_tunnel_leaf_chains_to_the_same_root() {
    let origin = spawn_tls_origin().await;
    let sink = Arc::new(MemorySink::default());
    let proxy = spawn_proxy(
        sink as Arc<dyn RequestSink>,
        ProxyOptions {
            origin_roots: vec![origin.root.clone()],
            ..Default::default()
        },
    )
    .await;

    // tunnel_get panics if the handshake against the root fails
    for path in ["/first", "/second"] {
        let (response, _tls) = tunnel_get(&proxy, origin.addr, path).await;
        assert!(response.contains(&format!("origin saw: GET {} HTTP/1.1", path)));
    }
}

// ============================================================================
// Failures before the acknowledgement
// ============================================================================

#[tokio::test]
async fn test_unreachable_origin_gets_503() {
    let sink = Arc::new(MemorySink::default());
    let proxy = spawn_proxy(sink as Arc<dyn RequestSink>, ProxyOptions::default()).await;

    let response = connect_and_read_all(proxy.addr, "unreachable.invalid:443").await;
    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
}

#[tokio::test]
async fn test_refused_origin_gets_503() {
    let sink = Arc::new(MemorySink::default());
    let proxy = spawn_proxy(sink as Arc<dyn RequestSink>, ProxyOptions::default()).await;

    let response = connect_and_read_all(proxy.addr, "127.0.0.1:1").await;
    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
    assert!(!response.starts_with("HTTP/1.1 200"));
}

#[tokio::test]
async fn test_untrusted_origin_certificate_gets_503() {
    let origin = spawn_tls_origin().await;
    let sink = Arc::new(MemorySink::default());
    // Origin's test CA is not added to the upstream trust store
    let proxy = spawn_proxy(sink as Arc<dyn RequestSink>, ProxyOptions::default()).await;

    let response = connect_and_read_all(proxy.addr, &origin.addr.to_string()).await;
    assert!(response.starts_with("HTTP/1.1 503"), "got: {}", response);
}

#[tokio::test]
async fn test_invalid_port_gets_400() {
    let sink = Arc::new(MemorySink::default());
    let proxy = spawn_proxy(sink as Arc<dyn RequestSink>, ProxyOptions::default()).await;

    let response = connect_and_read_all(proxy.addr, "example.com:notaport").await;
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
}

#[tokio::test]
async fn test_tunnel_limit_refuses_extra_tunnels() {
    let origin = spawn_tls_origin().await;
    let sink = Arc::new(MemorySink::default());
    let proxy = spawn_proxy(
        sink as Arc<dyn RequestSink>,
        ProxyOptions {
            origin_roots: vec![origin.root.clone()],
            max_tunnels: 1,
            ..Default::default()
        },
    )
    .await;

    // The first tunnel holds its permit while the client side stays open
    let (response, held) = tunnel_get(&proxy, origin.addr, "/hold").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    let refused = connect_and_read_all(proxy.addr, &origin.addr.to_string()).await;
    assert!(refused.starts_with("HTTP/1.1 503"), "got: {}", refused);

    drop(held);
}

// ============================================================================
// Front door
// ============================================================================

#[tokio::test]
async fn test_malformed_request_head_gets_400() {
    let sink = Arc::new(MemorySink::default());
    let proxy = spawn_proxy(sink as Arc<dyn RequestSink>, ProxyOptions::default()).await;

    let mut stream = tokio::net::TcpStream::connect(proxy.addr).await.unwrap();
    stream
        .write_all(b"\x16\x03\x01\x00\x05garbage\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 400"), "got: {}", response);
}
