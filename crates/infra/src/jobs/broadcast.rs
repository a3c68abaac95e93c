//! Job notifications for external subscribers (UI, operators).
//!
//! Delivery is at-most-once and best-effort: a failed publish is logged and
//! otherwise ignored. Durable progress stays queryable through the record store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use bulkops_core::{JobId, JobStatus};
use bulkops_events::{EventBus, InMemoryEventBus, Subscription};

use super::types::JobExecutionRecord;

pub const DEFAULT_CHANNEL: &str = "bulk_operations";

/// Payload published on the broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub channel: String,
    pub job_id: JobId,
    pub phase: String,
    pub progress_percentage: Option<f64>,
    pub processed_records: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Set on terminal events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    /// Set on terminal failure events only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
}

impl JobEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_some()
    }
}

/// Object-safe view of any `EventBus<JobEvent>`.
pub trait JobEventSink: Send + Sync {
    fn deliver(&self, event: JobEvent) -> Result<(), String>;
}

impl<B> JobEventSink for B
where
    B: EventBus<JobEvent>,
{
    fn deliver(&self, event: JobEvent) -> Result<(), String> {
        self.publish(event).map_err(|e| format!("{e:?}"))
    }
}

/// Publishes job events on a named channel.
#[derive(Clone)]
pub struct NotificationBroadcaster {
    channel: String,
    sink: Arc<dyn JobEventSink>,
}

impl std::fmt::Debug for NotificationBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBroadcaster")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl NotificationBroadcaster {
    pub fn new(channel: impl Into<String>, sink: Arc<dyn JobEventSink>) -> Self {
        Self {
            channel: channel.into(),
            sink,
        }
    }

    /// Broadcaster over a fresh in-memory bus; returns the bus for subscribing.
    pub fn in_memory(channel: impl Into<String>) -> (Self, Arc<InMemoryEventBus<JobEvent>>) {
        let bus = Arc::new(InMemoryEventBus::new());
        (Self::new(channel, bus.clone()), bus)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Incremental progress event.
    pub fn progress_event(
        &self,
        record: &JobExecutionRecord,
        phase: &str,
        message: impl Into<String>,
    ) -> JobEvent {
        JobEvent {
            channel: self.channel.clone(),
            job_id: record.version.clone(),
            phase: phase.to_string(),
            progress_percentage: record.progress_percentage,
            processed_records: record.processed_records,
            message: message.into(),
            timestamp: Utc::now(),
            status: None,
            error_summary: None,
        }
    }

    /// Terminal event (completed, failed, cancelled, rolled back, paused).
    pub fn status_event(&self, record: &JobExecutionRecord, phase: &str, message: impl Into<String>) -> JobEvent {
        let error_summary = match record.status {
            JobStatus::Failed | JobStatus::PartiallyRolledBack => record.error_message.clone(),
            _ => None,
        };
        JobEvent {
            status: Some(record.status),
            error_summary,
            ..self.progress_event(record, phase, message)
        }
    }

    /// Publish; returns whether the sink accepted the event.
    pub fn publish(&self, event: JobEvent) -> bool {
        let job_id = event.job_id.clone();
        match self.sink.deliver(event) {
            Ok(()) => {
                debug!(job_id = %job_id, channel = %self.channel, "broadcast delivered");
                true
            }
            Err(e) => {
                warn!(job_id = %job_id, channel = %self.channel, error = %e, "broadcast failed; continuing");
                false
            }
        }
    }
}

/// Subscribe helper for tests and the CLI.
pub fn subscribe(bus: &InMemoryEventBus<JobEvent>) -> Subscription<JobEvent> {
    bus.subscribe()
}

#[cfg(feature = "redis")]
pub use redis_bus::{RedisBusError, RedisPubSubBroadcastBus};

#[cfg(feature = "redis")]
mod redis_bus {
    //! Redis pub/sub transport for job events.
    //!
    //! Redis pub/sub is not durable: subscribers that are offline miss
    //! messages, which matches the at-most-once delivery of the broadcaster.

    use std::sync::mpsc;
    use std::thread;

    use redis::Commands;

    use bulkops_events::{EventBus, Subscription};

    use super::JobEvent;

    #[derive(Debug, thiserror::Error)]
    pub enum RedisBusError {
        #[error("redis error: {0}")]
        Redis(String),
        #[error("serialize error: {0}")]
        Serialize(String),
    }

    /// Redis pub/sub bus for JSON job events.
    #[derive(Debug, Clone)]
    pub struct RedisPubSubBroadcastBus {
        client: redis::Client,
        channel: String,
    }

    impl RedisPubSubBroadcastBus {
        pub fn new(redis_url: impl AsRef<str>, channel: impl Into<String>) -> Result<Self, RedisBusError> {
            let client = redis::Client::open(redis_url.as_ref())
                .map_err(|e| RedisBusError::Redis(e.to_string()))?;
            Ok(Self {
                client,
                channel: channel.into(),
            })
        }
    }

    impl EventBus<JobEvent> for RedisPubSubBroadcastBus {
        type Error = RedisBusError;

        fn publish(&self, message: JobEvent) -> Result<(), Self::Error> {
            let payload = serde_json::to_string(&message)
                .map_err(|e| RedisBusError::Serialize(e.to_string()))?;

            let mut conn = self
                .client
                .get_connection()
                .map_err(|e| RedisBusError::Redis(e.to_string()))?;

            let _: i64 = conn
                .publish(&self.channel, payload)
                .map_err(|e| RedisBusError::Redis(e.to_string()))?;

            Ok(())
        }

        fn subscribe(&self) -> Subscription<JobEvent> {
            let (tx, rx) = mpsc::channel();

            let client = self.client.clone();
            let channel = self.channel.clone();

            thread::spawn(move || {
                let Ok(mut conn) = client.get_connection() else {
                    return;
                };
                let mut pubsub = conn.as_pubsub();
                if pubsub.subscribe(channel).is_err() {
                    return;
                }

                loop {
                    let Ok(msg) = pubsub.get_message() else {
                        return;
                    };
                    let Ok(payload) = msg.get_payload::<String>() else {
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<JobEvent>(&payload) else {
                        continue;
                    };
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            });

            Subscription::new(rx)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkops_core::ActorId;

    use crate::jobs::types::{JobConfiguration, JobInput};

    struct BrokenSink;

    impl JobEventSink for BrokenSink {
        fn deliver(&self, _event: JobEvent) -> Result<(), String> {
            Err("connection reset".into())
        }
    }

    fn record() -> JobExecutionRecord {
        JobExecutionRecord::new(
            JobId::new(),
            "import",
            "csv_import",
            ActorId::new(),
            JobInput::Inline { items: vec![] },
            JobConfiguration::defaults(),
        )
    }

    #[test]
    fn subscribers_receive_progress_and_terminal_events() {
        let (broadcaster, bus) = NotificationBroadcaster::in_memory("ops");
        let sub = subscribe(&bus);

        let mut r = record();
        r.transition(JobStatus::Running).unwrap();
        assert!(broadcaster.publish(broadcaster.progress_event(&r, "batch-apply", "chunk 1")));

        r.record_error(&std::io::Error::other("disk full"));
        r.transition(JobStatus::Failed).unwrap();
        assert!(broadcaster.publish(broadcaster.status_event(&r, "finished", "failed")));

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert!(!events[0].is_terminal());
        assert_eq!(events[0].channel, "ops");
        assert_eq!(events[1].status, Some(JobStatus::Failed));
        assert_eq!(events[1].error_summary.as_deref(), Some("disk full"));
    }

    #[test]
    fn completed_event_has_no_error_summary() {
        let (broadcaster, _bus) = NotificationBroadcaster::in_memory(DEFAULT_CHANNEL);
        let mut r = record();
        r.transition(JobStatus::Running).unwrap();
        r.transition(JobStatus::Completed).unwrap();
        let event = broadcaster.status_event(&r, "finished", "done");
        assert_eq!(event.status, Some(JobStatus::Completed));
        assert!(event.error_summary.is_none());
        assert_eq!(event.progress_percentage, Some(100.0));
    }

    #[test]
    fn delivery_failure_is_not_an_error() {
        let broadcaster = NotificationBroadcaster::new("ops", Arc::new(BrokenSink));
        let r = record();
        assert!(!broadcaster.publish(broadcaster.progress_event(&r, "init", "queued")));
    }
}
