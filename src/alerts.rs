//! Failure Alerting
//!
//! Fatal persistence failures are forwarded to an operator channel. Sinks are
//! fire-and-forget: `notify` never blocks on I/O and never fails the caller.

use chrono::{DateTime, Utc};
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Queue depth for the webhook worker.
const WEBHOOK_QUEUE_CAPACITY: usize = 256;

/// Shutdown waits for at most this many request timeouts.
const MAX_DRAIN_REQUESTS: u32 = 4;
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const DRAIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAlert {
    pub id: Uuid,
    pub operation: String,
    pub ticker: String,
    pub error: String,
    pub context: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl FailureAlert {
    pub fn new(operation: &str, ticker: &str, error: &str, context: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.to_string(),
            ticker: ticker.to_string(),
            error: error.to_string(),
            context,
            raised_at: Utc::now(),
        }
    }
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: FailureAlert);
}

/// Drops alerts. For embedding where alerting is handled elsewhere.
#[derive(Debug, Default)]
pub struct NullAlertSink;

impl AlertSink for NullAlertSink {
    fn notify(&self, _alert: FailureAlert) {}
}

/// Emits alerts as structured `error!` events.
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: FailureAlert) {
        error!(
            alert_id = %alert.id,
            operation = %alert.operation,
            ticker = %alert.ticker,
            error = %alert.error,
            context = %alert.context,
            "🚨 Persistence failure"
        );
    }
}

/// Forwards alerts onto a channel owned by the embedding service.
pub struct ChannelAlertSink {
    tx: Sender<FailureAlert>,
}

impl ChannelAlertSink {
    pub fn new(tx: Sender<FailureAlert>) -> Self {
        Self { tx }
    }

    /// Unbounded sink plus its receiver.
    pub fn pair() -> (Self, Receiver<FailureAlert>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelAlertSink {
    fn notify(&self, alert: FailureAlert) {
        if let Err(e) = self.tx.try_send(alert) {
            warn!(error = %e, "Alert channel unavailable, alert dropped");
        }
    }
}

/// POSTs alerts as JSON from a background worker.
///
/// Dropping the sink closes the queue and waits for the worker to drain it,
/// bounded by the request timeout per queued alert (capped), so alerts raised
/// just before process exit are still delivered.
pub struct WebhookAlertSink {
    tx: Option<Sender<FailureAlert>>,
    worker: Option<JoinHandle<()>>,
    drain_timeout: Duration,
}

impl WebhookAlertSink {
    /// Spawn the delivery worker.
    pub fn spawn(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        let (tx, rx) = bounded::<FailureAlert>(WEBHOOK_QUEUE_CAPACITY);
        let url = url.to_string();

        let worker = thread::Builder::new()
            .name("alert-webhook".to_string())
            .spawn(move || {
                for alert in rx.iter() {
                    match client.post(&url).json(&alert).send() {
                        Ok(resp) if resp.status().is_success() => {
                            debug!(alert_id = %alert.id, "Alert delivered");
                        }
                        Ok(resp) => {
                            warn!(
                                alert_id = %alert.id,
                                status = %resp.status(),
                                "Alert webhook rejected alert"
                            );
                        }
                        Err(e) => {
                            warn!(alert_id = %alert.id, error = %e, "Alert webhook unreachable");
                        }
                    }
                }
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            drain_timeout: timeout.saturating_mul(MAX_DRAIN_REQUESTS) + DRAIN_GRACE,
        })
    }
}

impl AlertSink for WebhookAlertSink {
    fn notify(&self, alert: FailureAlert) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(alert) {
            Ok(()) => {}
            Err(TrySendError::Full(alert)) => {
                warn!(alert_id = %alert.id, "Alert queue full, alert dropped");
            }
            Err(TrySendError::Disconnected(alert)) => {
                warn!(alert_id = %alert.id, "Alert worker stopped, alert dropped");
            }
        }
    }
}

impl Drop for WebhookAlertSink {
    fn drop(&mut self) {
        // Closing the sender ends the worker loop once the queue is empty
        drop(self.tx.take());
        let Some(worker) = self.worker.take() else {
            return;
        };

        let deadline = Instant::now() + self.drain_timeout;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                warn!("Alert worker still delivering at shutdown, pending alerts abandoned");
                return;
            }
            thread::sleep(DRAIN_POLL);
        }
        if worker.join().is_err() {
            warn!("Alert worker panicked");
        }
    }
}
