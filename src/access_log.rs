//! Access log events and sinks
//!
//! One [`AccessEvent`] is emitted per completed request. Emission never
//! blocks or fails the response: events are handed to a spawned task and
//! sink failures are only logged.

use crate::config::LogConfig;
use crate::error::{EdgeError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One served request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessEvent {
    /// Host header plus request path and query
    pub url: String,
    pub ip: Option<String>,
    /// Value of the `token` request header
    pub token: Option<String>,
    pub agent: Option<String>,
    /// Seconds since the Unix epoch
    pub created: u64,
    /// Retention deadline, seconds since the Unix epoch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
}

impl AccessEvent {
    pub fn new(
        url: impl Into<String>,
        ip: Option<String>,
        token: Option<String>,
        agent: Option<String>,
        created: SystemTime,
        ttl: Option<Duration>,
    ) -> Self {
        let created_secs = epoch_secs(created);
        AccessEvent {
            url: url.into(),
            ip,
            token,
            agent,
            created: created_secs,
            expires: ttl.map(|ttl| created_secs.saturating_add(ttl.as_secs())),
        }
    }
}

fn epoch_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Destination for access events
#[async_trait]
pub trait AccessLogSink: Send + Sync {
    async fn record(&self, event: AccessEvent) -> Result<()>;
}

/// Hand `event` to `sink` without waiting for it
pub fn emit(sink: &Arc<dyn AccessLogSink>, event: AccessEvent) {
    let sink = Arc::clone(sink);
    tokio::spawn(async move {
        match sink.record(event).await {
            Ok(()) => {}
            Err(e) => debug!("Access log write failed: {}", e),
        }
    });
}

/// Writes events through `tracing` under the `access_log` target
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl AccessLogSink for TracingSink {
    async fn record(&self, event: AccessEvent) -> Result<()> {
        info!(
            target: "access_log",
            url = %event.url,
            ip = event.ip.as_deref().unwrap_or("-"),
            token = event.token.as_deref().unwrap_or("-"),
            agent = event.agent.as_deref().unwrap_or("-"),
            created = event.created,
            expires = event.expires,
            "request served"
        );
        Ok(())
    }
}

/// Appends one JSON document per line to a file
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesSink {
    /// Open (or create) the log file in append mode
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| EdgeError::LogSink(format!("Failed to open {:?}: {}", path, e)))?;

        Ok(JsonLinesSink {
            path,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl AccessLogSink for JsonLinesSink {
    async fn record(&self, event: AccessEvent) -> Result<()> {
        let mut line = serde_json::to_vec(&event)
            .map_err(|e| EdgeError::LogSink(format!("Failed to encode event: {}", e)))?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| EdgeError::LogSink(format!("Failed to write {:?}: {}", self.path, e)))?;
        file.flush()
            .await
            .map_err(|e| EdgeError::LogSink(format!("Failed to flush {:?}: {}", self.path, e)))
    }
}

/// Discards every event
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl AccessLogSink for NoopSink {
    async fn record(&self, _event: AccessEvent) -> Result<()> {
        Ok(())
    }
}

/// Build the sink selected by the log configuration
pub async fn build_sink(config: &LogConfig) -> Result<Arc<dyn AccessLogSink>> {
    if !config.enabled {
        return Ok(Arc::new(NoopSink));
    }

    match &config.path {
        Some(path) => {
            info!("Writing access log to {:?}", path);
            Ok(Arc::new(JsonLinesSink::open(path.clone()).await?))
        }
        None => Ok(Arc::new(TracingSink)),
    }
}
