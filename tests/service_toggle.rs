//! Start/stop lifecycle of the HTTP endpoint over a real socket

mod common;

use nobg::backends::test_utils::MockBehavior;
use nobg::server::ServiceToggle;
use nobg::{BgRemovalError, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn local_config() -> ServerConfig {
    ServerConfig::builder()
        .host("127.0.0.1")
        .port(0)
        .project_name("Toggle Test")
        .build()
        .unwrap()
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_start_serve_stop() {
    let (_dir, provider, _handle) = common::loaded(MockBehavior::default()).await;
    let toggle = ServiceToggle::new(provider, local_config());

    let addr = toggle.start().await.unwrap();
    assert!(toggle.is_running().await);
    assert_eq!(toggle.local_addr().await.unwrap(), addr);

    let response = http_get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("\"status\":\"healthy\""));

    let response = http_get(addr, "/").await;
    assert!(response.contains("Toggle Test is Online"));

    toggle.stop().await.unwrap();
    assert!(!toggle.is_running().await);
    assert!(matches!(toggle.local_addr().await, Err(BgRemovalError::NotRunning)));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_double_start_and_double_stop() {
    let (_dir, provider, _handle) = common::loaded(MockBehavior::default()).await;
    let toggle = ServiceToggle::new(provider, local_config());

    toggle.start().await.unwrap();
    assert!(matches!(toggle.start().await, Err(BgRemovalError::AlreadyRunning)));

    toggle.stop().await.unwrap();
    toggle.stop().await.unwrap();

    // The model stays loaded across restarts
    let addr = toggle.start().await.unwrap();
    assert!(http_get(addr, "/health").await.starts_with("HTTP/1.1 200"));
    toggle.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_requires_loaded_model() {
    let (_dir, provider) = common::provider(MockBehavior::default());
    let toggle = ServiceToggle::new(provider, local_config());

    assert!(matches!(toggle.start().await, Err(BgRemovalError::ModelNotReady)));
    assert!(!toggle.is_running().await);
    toggle.stop().await.unwrap();
}
