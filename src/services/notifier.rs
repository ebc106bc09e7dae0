use async_trait::async_trait;
use serde::Serialize;
use time::PrimitiveDateTime;

use crate::core::redis::RedisHandle;
use crate::core::time::format_primitive;
use crate::db::types::JobStatus;

/// One status transition as pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobStatusEvent {
    pub(crate) job_id: String,
    pub(crate) old_status: JobStatus,
    pub(crate) new_status: JobStatus,
    pub(crate) timestamp: String,
}

impl JobStatusEvent {
    pub(crate) fn new(
        job_id: &str,
        old_status: JobStatus,
        new_status: JobStatus,
        at: PrimitiveDateTime,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            old_status,
            new_status,
            timestamp: format_primitive(at),
        }
    }
}

/// Best-effort transition feed. Implementations must swallow delivery
/// failures: a transition never blocks on or fails with its event.
#[async_trait]
pub(crate) trait JobEventSink: Send + Sync {
    async fn publish(&self, event: &JobStatusEvent);
}

/// Publishes transitions to a Redis pub/sub channel for the realtime
/// relay to fan out.
pub(crate) struct RedisNotifier {
    redis: RedisHandle,
    channel: String,
}

impl RedisNotifier {
    pub(crate) fn new(redis: RedisHandle, channel: String) -> Self {
        Self { redis, channel }
    }
}

#[async_trait]
impl JobEventSink for RedisNotifier {
    async fn publish(&self, event: &JobStatusEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(error = %err, "Failed to serialize job status event");
                return;
            }
        };

        match self.redis.publish(&self.channel, &payload).await {
            Ok(Some(receivers)) => {
                tracing::debug!(
                    job_id = %event.job_id,
                    new_status = event.new_status.as_str(),
                    receivers,
                    "Published job status event"
                );
            }
            Ok(None) => {
                tracing::debug!(job_id = %event.job_id, "Redis not connected, event dropped");
            }
            Err(err) => {
                tracing::warn!(job_id = %event.job_id, error = %err, "Failed to publish job status event");
            }
        }
    }
}
