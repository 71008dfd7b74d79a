//! Integration tests for the metrics endpoint

use image_edge_cache::{EdgeMetrics, MetricsEndpoint};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

async fn start_endpoint(metrics: Arc<EdgeMetrics>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let addr = free_addr().await;
    let endpoint = MetricsEndpoint::new(metrics, addr);
    let handle = tokio::spawn(async move {
        let _ = endpoint.start().await;
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    (addr, handle)
}

#[tokio::test]
async fn test_metrics_endpoint_serves_metrics() {
    let metrics = Arc::new(EdgeMetrics::new());
    metrics.record_request();
    metrics.record_request();
    metrics.record_cache_hit();
    metrics.record_cache_miss();
    metrics.record_bytes_from_origin(1000);

    let (addr, handle) = start_endpoint(Arc::clone(&metrics)).await;

    let response = timeout(
        Duration::from_secs(2),
        reqwest::get(format!("http://{}/metrics", addr)),
    )
    .await
    .expect("metrics request timed out")
    .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("image_edge_requests_total 2"));
    assert!(body.contains("image_edge_cache_hits_total 1"));
    assert!(body.contains("image_edge_bytes_from_origin_total 1000"));
    assert!(body.contains("image_edge_cache_hit_rate 50.00"));

    handle.abort();
}

#[tokio::test]
async fn test_metrics_endpoint_reflects_updates() {
    let metrics = Arc::new(EdgeMetrics::new());
    let (addr, handle) = start_endpoint(Arc::clone(&metrics)).await;
    let url = format!("http://{}/metrics", addr);

    let before = reqwest::get(&url).await.unwrap().text().await.unwrap();
    assert!(before.contains("image_edge_evicted_files_total 0"));

    metrics.record_sweep(7, 1);

    let after = reqwest::get(&url).await.unwrap().text().await.unwrap();
    assert!(after.contains("image_edge_evicted_files_total 7"));
    assert!(after.contains("image_edge_eviction_failures_total 1"));

    handle.abort();
}

#[tokio::test]
async fn test_health_and_unknown_paths() {
    let (addr, handle) = start_endpoint(Arc::new(EdgeMetrics::new())).await;

    let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
    assert_eq!(health.status().as_u16(), 200);
    assert_eq!(health.text().await.unwrap(), r#"{"status":"healthy"}"#);

    let missing = reqwest::get(format!("http://{}/nope", addr)).await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    handle.abort();
}
