//! Image Edge Cache
//!
//! An image-delivery edge cache. Requests name a remote image (or a file
//! previously stored under the cache directory) plus optional transform
//! parameters. Valid cached copies are served from disk; otherwise the image
//! is fetched from origin, stored, transformed and returned with
//! cache-control headers. A background sweep evicts old files.
//!
//! # Request format
//!
//! ```text
//! /<app>/<kind>/<storage-sub-path>/[<transform-options>/]<target-identifier>
//! ```
//!
//! - `/demo/image/upload/Desert.jpg` serves `<base>/upload/Desert.jpg`
//! - `/demo/image/upload/resize200/http%3A%2F%2Fex.com%2Fa.jpg` fetches
//!   `http://ex.com/a.jpg` into `<base>/upload/a.jpg` and resizes it to a
//!   width of 200 pixels
//!
//! # Architecture
//!
//! - [`RequestDecoder`]: path decoding and [`CacheKey`] derivation
//! - [`CacheValidator`]: concurrent HEAD probe and local stat, HIT/MISS/STALE
//! - [`Fetcher`]: streaming download with atomic store
//! - [`TransformDispatcher`]: explicit transforms through the [`Transformer`] trait
//! - [`ContentNegotiator`]: WebP for capable clients, sniffed content type
//! - [`EvictionSweeper`]: periodic TTL eviction
//! - [`EdgeProxy`]: the request pipeline; [`EdgeServer`]: the HTTP listener
//!
//! # Example
//!
//! ```rust,no_run
//! use image_edge_cache::{access_log::TracingSink, EdgeConfig, EdgeProxy, EdgeServer};
//! use std::sync::Arc;
//!
//! # async fn run() -> image_edge_cache::Result<()> {
//! let config = Arc::new(EdgeConfig::from_file("image_edge_cache.yaml")?);
//! let proxy = Arc::new(EdgeProxy::new(Arc::clone(&config), Arc::new(TracingSink))?);
//! let server = EdgeServer::bind(proxy, config.listen_addr()?).await?;
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! server.serve(shutdown_rx).await
//! # }
//! ```

pub mod access_log;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod metadata_fetcher;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod negotiate;
pub mod proxy;
pub mod request;
pub mod server;
pub mod sweeper;
pub mod transform;
pub mod validator;

// Re-export commonly used types
pub use access_log::{AccessEvent, AccessLogSink};
pub use config::EdgeConfig;
pub use error::{EdgeError, Result};
pub use fetcher::{Fetcher, InflightRegistry};
pub use metadata_fetcher::MetadataFetcher;
pub use metrics::{EdgeMetrics, MetricsSnapshot};
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{CacheKey, LocalEntry, RemoteDescriptor, RemoteMetadata, TransformOptions};
pub use negotiate::{CachePolicy, ClientClass, ContentNegotiator};
pub use proxy::{EdgeProxy, RequestContext};
pub use request::{DecodedRequest, RequestDecoder, Target};
pub use server::EdgeServer;
pub use sweeper::{EvictionSweeper, SweepReport};
pub use transform::{ImageTransformer, OutputFormat, TransformDispatcher, Transformer};
pub use validator::{CacheValidator, Validation};
