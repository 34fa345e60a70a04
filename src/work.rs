/// Work-pending signal: how the watchdog learns whether the host still has
/// queued work.
///
/// Any positive count counts as activity and keeps the idle counter at zero.
use crate::config::WorkConfig;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// Errors produced while polling a work source.
#[derive(Debug)]
pub enum WorkSourceError {
    /// The HTTP request to the host failed (connect, timeout, body decode).
    Request(reqwest::Error),
    /// The host answered with a non-success status.
    Status(u16),
    /// The response body has no usable count at the configured pointer.
    MissingCount { pointer: String },
}

impl std::fmt::Display for WorkSourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkSourceError::Request(e) => write!(f, "queue request failed: {e}"),
            WorkSourceError::Status(code) => write!(f, "queue endpoint returned {code}"),
            WorkSourceError::MissingCount { pointer } => {
                write!(f, "no pending-work count at {pointer}")
            }
        }
    }
}

impl std::error::Error for WorkSourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkSourceError::Request(e) => Some(e),
            WorkSourceError::Status(_) | WorkSourceError::MissingCount { .. } => None,
        }
    }
}

impl From<reqwest::Error> for WorkSourceError {
    fn from(e: reqwest::Error) -> Self {
        WorkSourceError::Request(e)
    }
}

/// Something that can report how many units of work the host has pending.
pub trait WorkSource: Send + Sync {
    fn tasks_remaining(&self) -> impl Future<Output = Result<u64, WorkSourceError>> + Send;
}

/// Reports no work, ever. Only keep-alive calls reset the timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoWork;

impl WorkSource for NoWork {
    fn tasks_remaining(&self) -> impl Future<Output = Result<u64, WorkSourceError>> + Send {
        std::future::ready(Ok(0))
    }
}

/// Polls the host's queue endpoint over HTTP.
#[derive(Debug, Clone)]
pub struct QueuePoller {
    client: reqwest::Client,
    url: String,
    pointer: String,
}

impl QueuePoller {
    pub fn new(url: impl Into<String>, config: &WorkConfig) -> Result<Self, WorkSourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            pointer: config.count_pointer.clone(),
        })
    }

    /// Build a poller from config, or `None` when no queue URL is configured.
    pub fn from_config(config: &WorkConfig) -> Result<Option<Self>, WorkSourceError> {
        match &config.queue_url {
            Some(url) => Self::new(url.clone(), config).map(Some),
            None => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl WorkSource for QueuePoller {
    fn tasks_remaining(&self) -> impl Future<Output = Result<u64, WorkSourceError>> + Send {
        async move {
            let resp = self.client.get(&self.url).send().await?;
            if !resp.status().is_success() {
                return Err(WorkSourceError::Status(resp.status().as_u16()));
            }
            let body: Value = resp.json().await?;
            pending_count(&body, &self.pointer).ok_or_else(|| WorkSourceError::MissingCount {
                pointer: self.pointer.clone(),
            })
        }
    }
}

/// Read the pending-work count at `pointer`.
///
/// A number is taken as-is; an array counts its entries (queue listings).
fn pending_count(body: &Value, pointer: &str) -> Option<u64> {
    match body.pointer(pointer)? {
        Value::Number(n) => n.as_u64(),
        Value::Array(items) => Some(items.len() as u64),
        _ => None,
    }
}
