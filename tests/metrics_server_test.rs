//! Metrics Server Integration Tests
//!
//! Tests for the Prometheus metrics HTTP endpoint.

use mizuchi_spool::config::MetricsConfig;
use mizuchi_spool::metrics::server::MetricsServer;
use std::time::Duration;

fn test_config() -> MetricsConfig {
    MetricsConfig {
        enabled: true,
        address: "127.0.0.1:0".to_string(), // Use port 0 for random available port
    }
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    mizuchi_spool::metrics::record_rotation("write");

    let mut server = MetricsServer::new(&test_config());
    let addr = server.start().await.expect("Server should start");

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/metrics", addr))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .expect("Should connect to metrics server");
    assert!(response.status().is_success());

    let content_type = response
        .headers()
        .get("content-type")
        .expect("Should have content-type")
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = response.text().await.unwrap();
    assert!(body.contains("mizuchi_spool_rotations_total"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let mut server = MetricsServer::new(&test_config());
    let addr = server.start().await.expect("Server should start");

    let response = reqwest::Client::new()
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let body = response.text().await.unwrap();
    assert!(body.contains(r#""status":"ok""#));
    assert!(body.contains("open_buffer_files"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_path_is_not_found() {
    let mut server = MetricsServer::new(&test_config());
    let addr = server.start().await.expect("Server should start");

    let response = reqwest::Client::new()
        .get(format!("http://{}/nope", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);

    server.shutdown().await;
}
