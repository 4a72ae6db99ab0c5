// src/relay/delivery.rs
//
// Background delivery of outbox records to the remote ingest endpoint.
//
// Order is strict: records go out in ascending id. The first failure in a
// batch is recorded on that record and ends the batch; nothing after it is
// attempted until it succeeds. Retries are unbounded.
//
// The worker never touches frame-processing state. All SQLite calls run on
// the blocking pool so the async runtime is not stalled by disk I/O.

use super::outbox::{Outbox, OutboxRecord};
use crate::config::RelayConfig;
use crate::error::{DeliveryError, OutboxError};
use crate::pipeline::metrics::PipelineMetrics;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Response body text kept in the error message.
const MAX_BODY_CHARS: usize = 100;

// ============================================================================
// TRANSPORT
// ============================================================================

/// One delivery attempt for one record. Any error is treated as transient.
#[async_trait::async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, record: &OutboxRecord) -> Result<(), DeliveryError>;
}

/// POSTs the stored payload JSON with an optional bearer token.
pub struct HttpTransport {
    http_client: reqwest::Client,
    ingest_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(ingest_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            ingest_url: ingest_url.into(),
            api_key: api_key.into(),
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, DeliveryError> {
        Self::new(
            config.ingest_url.clone(),
            config.api_key.clone(),
            Duration::from_secs_f64(config.request_timeout_s),
        )
    }
}

#[async_trait::async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(&self, record: &OutboxRecord) -> Result<(), DeliveryError> {
        let mut request = self
            .http_client
            .post(&self.ingest_url)
            .header(CONTENT_TYPE, "application/json")
            .body(record.payload_json.clone());
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<no body>".to_string());
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            body: body.chars().take(MAX_BODY_CHARS).collect(),
        })
    }
}

// ============================================================================
// WORKER
// ============================================================================

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub backoff: Duration,
}

impl DeliverySettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            poll_interval: Duration::from_secs_f64(config.poll_interval_s),
            backoff: Duration::from_secs_f64(config.backoff_s),
        }
    }
}

/// Result of one pass over the oldest unsent records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchOutcome {
    pub fetched: usize,
    pub delivered: usize,
    /// Id of the record whose failure ended the batch.
    pub failed: Option<i64>,
}

enum Wait {
    Immediate,
    Poll,
    Backoff,
}

pub struct DeliveryWorker<T: DeliveryTransport> {
    outbox: Outbox,
    transport: T,
    settings: DeliverySettings,
    metrics: Option<PipelineMetrics>,
}

impl<T: DeliveryTransport> DeliveryWorker<T> {
    pub fn new(outbox: Outbox, transport: T, settings: DeliverySettings) -> Self {
        Self {
            outbox,
            transport,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PipelineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Deliver up to `batch_size` records in id order, stopping at the
    /// first failure.
    pub async fn deliver_batch(&self) -> Result<BatchOutcome, OutboxError> {
        let outbox = self.outbox.clone();
        let limit = self.settings.batch_size;
        let batch = blocking(move || outbox.fetch_unsent(limit)).await?;

        let mut outcome = BatchOutcome {
            fetched: batch.len(),
            ..BatchOutcome::default()
        };

        for record in batch {
            let id = record.id;
            match self.transport.deliver(&record).await {
                Ok(()) => {
                    let outbox = self.outbox.clone();
                    blocking(move || outbox.mark_sent(id)).await?;
                    outcome.delivered += 1;
                    if let Some(m) = &self.metrics {
                        m.inc(&m.deliveries_ok);
                    }
                    debug!("📤 Outbox #{} delivered", id);
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(
                        "📤 Outbox #{} delivery failed (attempt {}): {}",
                        id,
                        record.retry_count + 1,
                        message
                    );
                    let outbox = self.outbox.clone();
                    blocking(move || outbox.mark_error(id, &message)).await?;
                    if let Some(m) = &self.metrics {
                        m.inc(&m.deliveries_failed);
                    }
                    outcome.failed = Some(id);
                    break;
                }
            }
        }

        if outcome.delivered > 0 {
            info!("📤 Delivered {}/{} outbox record(s)", outcome.delivered, outcome.fetched);
        }
        Ok(outcome)
    }

    /// Run until `shutdown` flips to true or its sender is dropped.
    /// Wakes on the poll interval or immediately after an enqueue; after a
    /// failure it waits out the full backoff before retrying.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let notify = self.outbox.notifier();
        info!(
            "📡 Delivery worker started (batch {}, poll {:.1}s, backoff {:.1}s)",
            self.settings.batch_size,
            self.settings.poll_interval.as_secs_f64(),
            self.settings.backoff.as_secs_f64()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.deliver_batch().await {
                Ok(outcome) if outcome.failed.is_some() => Wait::Backoff,
                Ok(outcome) if outcome.fetched > 0 && outcome.fetched == self.settings.batch_size => {
                    Wait::Immediate
                }
                Ok(_) => Wait::Poll,
                Err(e) => {
                    error!("❌ Outbox access failed: {}", e);
                    Wait::Backoff
                }
            };

            let stop = match wait {
                Wait::Immediate => false,
                Wait::Backoff => tokio::select! {
                    _ = tokio::time::sleep(self.settings.backoff) => false,
                    changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
                },
                Wait::Poll => tokio::select! {
                    _ = tokio::time::sleep(self.settings.poll_interval) => false,
                    _ = notify.notified() => false,
                    changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
                },
            };
            if stop {
                break;
            }
        }

        info!("📡 Delivery worker stopped");
    }
}

async fn blocking<F, R>(f: F) -> Result<R, OutboxError>
where
    F: FnOnce() -> Result<R, OutboxError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| OutboxError::Join(e.to_string()))?
}
