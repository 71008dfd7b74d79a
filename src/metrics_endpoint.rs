//! Metrics HTTP endpoint
//!
//! Serves [`EdgeMetrics`] in Prometheus text format on its own address,
//! separate from the image listener, together with a `/health` probe.

use crate::error::{EdgeError, Result};
use crate::metrics::{EdgeMetrics, MetricsSnapshot};
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

const METRIC_PREFIX: &str = "image_edge";

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<EdgeMetrics>,
    addr: SocketAddr,
}

impl MetricsEndpoint {
    pub fn new(metrics: Arc<EdgeMetrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Bind and serve until the process exits
    pub async fn start(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| EdgeError::Http(format!("Failed to bind {}: {}", self.addr, e)))?;
        info!("Metrics available at http://{}/metrics", self.addr);

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Metrics endpoint accept failed: {}", e);
                    continue;
                }
            };
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<EdgeMetrics>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    Ok(match req.uri().path() {
        "/metrics" => text_response(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            format_prometheus_metrics(&metrics.get_stats()),
        ),
        "/health" => text_response(
            StatusCode::OK,
            "application/json",
            r#"{"status":"healthy"}"#.to_string(),
        ),
        _ => text_response(StatusCode::NOT_FOUND, "text/plain", "404 Not Found".to_string()),
    })
}

fn text_response(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

enum Kind {
    Counter,
    Gauge,
}

/// Render a snapshot in Prometheus exposition format
pub fn format_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let counters: [(&str, &str, u64); 17] = [
        ("requests_total", "GET requests processed", snapshot.total_requests),
        ("rejected_methods_total", "Requests refused for a non-GET method", snapshot.rejected_methods),
        ("cache_hits_total", "Requests served from a valid cache file", snapshot.cache_hits),
        ("cache_misses_total", "Requests with no cache file", snapshot.cache_misses),
        ("cache_stale_total", "Requests whose cache file size differed from origin", snapshot.cache_stale),
        ("coalesced_hits_total", "Misses served from a file stored by a concurrent request", snapshot.coalesced_hits),
        ("remote_missing_total", "Requests whose origin could not be reached", snapshot.remote_missing),
        ("local_missing_total", "Local-target requests with no cache file", snapshot.local_missing),
        ("fetch_errors_total", "Failed origin downloads", snapshot.fetch_errors),
        ("transform_errors_total", "Failed explicit transforms", snapshot.transform_errors),
        ("negotiated_conversions_total", "Payloads re-encoded for capable clients", snapshot.negotiated_conversions),
        ("bytes_from_origin_total", "Bytes downloaded from origin", snapshot.bytes_from_origin),
        ("bytes_from_cache_total", "Bytes read from cache files", snapshot.bytes_from_cache),
        ("bytes_to_client_total", "Body bytes sent to clients", snapshot.bytes_to_client),
        ("sweeps_total", "Completed eviction sweeps", snapshot.sweeps),
        ("evicted_files_total", "Cache files deleted by the sweeper", snapshot.evicted_files),
        ("eviction_failures_total", "Cache files the sweeper failed to examine or delete", snapshot.eviction_failures),
    ];

    let mut output = String::new();
    for (name, help, value) in counters {
        push_metric(&mut output, name, help, Kind::Counter, &value.to_string());
    }
    push_metric(
        &mut output,
        "cache_hit_rate",
        "Cache hit rate percentage",
        Kind::Gauge,
        &format!("{:.2}", snapshot.cache_hit_rate()),
    );
    push_metric(
        &mut output,
        "request_duration_ms_avg",
        "Average request duration in milliseconds",
        Kind::Gauge,
        &format!("{:.2}", snapshot.avg_request_duration_ms()),
    );
    output
}

fn push_metric(output: &mut String, name: &str, help: &str, kind: Kind, value: &str) {
    let kind = match kind {
        Kind::Counter => "counter",
        Kind::Gauge => "gauge",
    };
    // Writing to a String cannot fail
    let _ = writeln!(output, "# HELP {METRIC_PREFIX}_{name} {help}");
    let _ = writeln!(output, "# TYPE {METRIC_PREFIX}_{name} {kind}");
    let _ = writeln!(output, "{METRIC_PREFIX}_{name} {value}\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = EdgeMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_bytes_to_client(1500);
        metrics.record_sweep(4, 0);

        let output = format_prometheus_metrics(&metrics.get_stats());

        assert!(output.contains("image_edge_requests_total 2"));
        assert!(output.contains("image_edge_cache_hits_total 1"));
        assert!(output.contains("image_edge_cache_misses_total 1"));
        assert!(output.contains("image_edge_bytes_to_client_total 1500"));
        assert!(output.contains("image_edge_evicted_files_total 4"));
        assert!(output.contains("# TYPE image_edge_requests_total counter"));
        assert!(output.contains("# TYPE image_edge_cache_hit_rate gauge"));
        assert!(output.contains("image_edge_cache_hit_rate 50.00"));
    }

    #[test]
    fn test_format_prometheus_metrics_empty() {
        let output = format_prometheus_metrics(&EdgeMetrics::new().get_stats());
        assert!(output.contains("image_edge_requests_total 0"));
        assert!(output.contains("image_edge_cache_hit_rate 0.00"));
    }

    #[test]
    fn test_text_response_headers() {
        let response = text_response(StatusCode::NOT_FOUND, "text/plain", "x".to_string());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }
}
