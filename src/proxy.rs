//! EdgeProxy and per-request context
//!
//! [`EdgeProxy`] wires the pipeline stages together:
//!
//! ```text
//! decode -> validate -> (fetch) -> transform -> negotiate -> respond
//! ```
//!
//! Each stage runs only after the previous one produced its complete output.
//! Failures never escape as transport errors: they become plaintext payloads
//! (status 200 unless strict status codes are configured).

use crate::access_log::{self, AccessEvent, AccessLogSink};
use crate::config::EdgeConfig;
use crate::error::{EdgeError, Result};
use crate::fetcher::{Fetcher, InflightRegistry};
use crate::metadata_fetcher::MetadataFetcher;
use crate::metrics::EdgeMetrics;
use crate::models::{CacheKey, RemoteDescriptor, RemoteMetadata};
use crate::negotiate::{CachePolicy, ClientClass, ContentNegotiator};
use crate::request::{DecodedRequest, RequestDecoder};
use crate::transform::{ImageTransformer, TransformDispatcher, Transformer};
use crate::validator::{stat_local, CacheValidator, Validation};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, Response, StatusCode};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Coordinates every stage of serving an image request
#[derive(Clone)]
pub struct EdgeProxy {
    config: Arc<EdgeConfig>,
    metrics: Arc<EdgeMetrics>,
    decoder: RequestDecoder,
    validator: CacheValidator,
    fetcher: Fetcher,
    inflight: InflightRegistry,
    dispatcher: TransformDispatcher,
    negotiator: ContentNegotiator,
    cache_policy: CachePolicy,
    access_log: Arc<dyn AccessLogSink>,
}

/// Per-request state collected while the pipeline runs
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Host header plus path and query, as logged and fingerprinted
    pub url: String,
    pub peer: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub token: Option<String>,
    /// Validation outcome label once known
    pub outcome: Option<&'static str>,
    start: Instant,
}

impl EdgeProxy {
    /// Build a proxy with the default image transformer and fresh metrics
    pub fn new(config: Arc<EdgeConfig>, access_log: Arc<dyn AccessLogSink>) -> Result<Self> {
        Self::with_parts(
            config,
            Arc::new(ImageTransformer::new()),
            access_log,
            Arc::new(EdgeMetrics::new()),
        )
    }

    /// Build a proxy from explicit collaborators
    pub fn with_parts(
        config: Arc<EdgeConfig>,
        transformer: Arc<dyn Transformer>,
        access_log: Arc<dyn AccessLogSink>,
        metrics: Arc<EdgeMetrics>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.cache.connect_timeout_secs))
            .build()
            .map_err(|e| EdgeError::Http(format!("Failed to create HTTP client: {}", e)))?;

        let cache_policy = CachePolicy {
            enabled: config.cache.enabled,
            max_age: config.cache_max_age(),
            vary: config.negotiation.webp,
        };

        Ok(EdgeProxy {
            decoder: RequestDecoder::new(config.base_dir.clone()),
            validator: CacheValidator::new(MetadataFetcher::with_client(client.clone())),
            fetcher: Fetcher::new(client),
            inflight: InflightRegistry::new(),
            dispatcher: TransformDispatcher::new(Arc::clone(&transformer)),
            negotiator: ContentNegotiator::new(transformer, config.negotiation.webp),
            cache_policy,
            access_log,
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &EdgeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EdgeMetrics {
        &self.metrics
    }

    pub fn metrics_arc(&self) -> Arc<EdgeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve one request
    ///
    /// Only the method, URI and headers of `req` are used.
    pub async fn handle<B>(&self, req: &Request<B>, peer: Option<IpAddr>) -> Response<Bytes> {
        if req.method() != Method::GET {
            self.metrics.record_rejected_method();
            debug!("Rejected method={} uri={}", req.method(), req.uri());
            return method_not_allowed();
        }

        self.metrics.record_request();
        let mut ctx = RequestContext::from_request(req, peer);
        let decoded = self.decoder.decode(req.uri().path());

        let response = match self.load(&decoded, &mut ctx).await {
            Ok(bytes) => self.success_response(bytes, &ctx).await,
            Err(e) => {
                warn!(
                    "Request failed: url={} outcome={} error={}",
                    ctx.url,
                    ctx.outcome.unwrap_or("-"),
                    e
                );
                self.error_response(&e)
            }
        };

        let sent = response.body().len() as u64;
        self.metrics.record_bytes_to_client(sent);
        self.metrics.record_request_duration(ctx.elapsed());
        info!(
            "Request completed: url={} outcome={} status={} bytes={} duration_ms={}",
            ctx.url,
            ctx.outcome.unwrap_or("-"),
            response.status().as_u16(),
            sent,
            ctx.elapsed().as_millis()
        );

        access_log::emit(&self.access_log, ctx.access_event(self.config.log_ttl()));
        response
    }

    /// Resolve the request to the bytes that feed content negotiation
    async fn load(&self, decoded: &DecodedRequest, ctx: &mut RequestContext) -> Result<Bytes> {
        let validation = self.validator.validate(decoded).await;
        ctx.outcome = Some(validation.label());
        debug!("Validation outcome={} url={}", validation.label(), ctx.url);

        let source = match validation {
            Validation::Hit { key, .. } => {
                self.metrics.record_cache_hit();
                self.read_cached(&key).await?
            }
            Validation::Miss {
                key,
                remote,
                metadata,
            } => {
                self.metrics.record_cache_miss();
                self.fetch_through(&key, &remote, &metadata, ctx).await?
            }
            Validation::Stale {
                key,
                remote,
                metadata,
                local,
            } => {
                self.metrics.record_cache_stale();
                debug!(
                    "Cached size {} differs from origin {:?} for {:?}",
                    local.size,
                    metadata.content_length,
                    key.path()
                );
                self.fetch_through(&key, &remote, &metadata, ctx).await?
            }
            Validation::RemoteMissing(e) => {
                self.metrics.record_remote_missing();
                return Err(e);
            }
            Validation::LocalMissing => {
                self.metrics.record_local_missing();
                return Err(EdgeError::LocalMissing(
                    decoded.identifier.as_str().to_string(),
                ));
            }
        };

        self.dispatcher
            .dispatch(source, decoded.options.as_ref())
            .await
            .inspect_err(|_| self.metrics.record_transform_error())
    }

    async fn read_cached(&self, key: &CacheKey) -> Result<Bytes> {
        match tokio::fs::read(key.path()).await {
            Ok(data) => {
                self.metrics.record_bytes_from_cache(data.len() as u64);
                Ok(Bytes::from(data))
            }
            // Evicted between validation and read
            Err(e) if e.kind() == ErrorKind::NotFound => Err(EdgeError::LocalMissing(
                key.path().display().to_string(),
            )),
            Err(e) => Err(EdgeError::LocalIo(format!(
                "Failed to read {:?}: {}",
                key.path(),
                e
            ))),
        }
    }

    /// Download into the cache, one request per key at a time when
    /// coalescing is enabled
    async fn fetch_through(
        &self,
        key: &CacheKey,
        remote: &RemoteDescriptor,
        metadata: &RemoteMetadata,
        ctx: &mut RequestContext,
    ) -> Result<Bytes> {
        let _slot = if self.config.cache.coalesce_fetches {
            let slot = self.inflight.acquire(key).await;
            if let Some(local) = stat_local(key).await {
                if metadata.matches(&local) {
                    debug!("Serving {:?} stored by a concurrent request", key.path());
                    self.metrics.record_coalesced_hit();
                    ctx.outcome = Some("COALESCED_HIT");
                    return self.read_cached(key).await;
                }
            }
            Some(slot)
        } else {
            None
        };

        match self.fetcher.fetch(remote, key).await {
            Ok(bytes) => {
                self.metrics.record_bytes_from_origin(bytes.len() as u64);
                Ok(bytes)
            }
            Err(e) => {
                self.metrics.record_fetch_error();
                Err(e)
            }
        }
    }

    async fn success_response(&self, bytes: Bytes, ctx: &RequestContext) -> Response<Bytes> {
        let negotiated = self.negotiator.negotiate(bytes, ctx.client_class()).await;
        if negotiated.converted {
            self.metrics.record_conversion();
        }

        let mut headers = self.cache_policy.headers(&ctx.url, SystemTime::now());
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(negotiated.content_type));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(negotiated.bytes.len()));

        build_response(StatusCode::OK, headers, negotiated.bytes)
    }

    fn error_response(&self, error: &EdgeError) -> Response<Bytes> {
        let status = if self.config.server.strict_status_codes {
            StatusCode::from_u16(error.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        } else {
            StatusCode::OK
        };

        let body = Bytes::from(error.payload());
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

        build_response(status, headers, body)
    }
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response<Bytes> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn method_not_allowed() -> Response<Bytes> {
    let mut headers = HeaderMap::new();
    headers.insert(ALLOW, HeaderValue::from_static("GET"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0usize));
    build_response(StatusCode::METHOD_NOT_ALLOWED, headers, Bytes::new())
}

impl RequestContext {
    /// Capture the client-facing parts of a request
    pub fn from_request<B>(req: &Request<B>, peer: Option<IpAddr>) -> Self {
        let headers = req.headers();
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let host = header_string(headers, HOST.as_str())
            .or_else(|| req.uri().authority().map(|a| a.to_string()))
            .unwrap_or_default();

        RequestContext {
            url: format!("{}{}", host, path_and_query),
            peer,
            user_agent: header_string(headers, USER_AGENT.as_str()),
            accept: header_string(headers, http::header::ACCEPT.as_str()),
            token: header_string(headers, "token"),
            outcome: None,
            start: Instant::now(),
        }
    }

    pub fn client_class(&self) -> ClientClass {
        ClientClass::from_headers(self.user_agent.as_deref(), self.accept.as_deref())
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn access_event(&self, ttl: Duration) -> AccessEvent {
        AccessEvent::new(
            self.url.clone(),
            self.peer.map(|ip| ip.to_string()),
            self.token.clone(),
            self.user_agent.clone(),
            SystemTime::now(),
            Some(ttl),
        )
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
