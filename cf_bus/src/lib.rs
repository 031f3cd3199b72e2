//! ABOUTME: Cross-replica event bus with in-process and Redis pub/sub backends
//! ABOUTME: Carries trigger, reload, and timer-cancel events between replicas

use async_trait::async_trait;
use cf_core::{time::utc_now, Error, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event kinds carried between replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// Manual trigger of a task; only the leader acts on it
    SubmitTask {
        task_id: String,
        parameters: serde_json::Value,
    },
    /// Cron table changed; a no-op on followers
    ReloadTasks,
    /// A callback arrived; whichever replica owns the timer stops it
    CancelExecutionTimer { execution_id: String },
}

/// Wire envelope: every event carries its origin and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: BusEvent,
}

impl EventEnvelope {
    pub fn new(source: &str, event: BusEvent) -> Self {
        Self {
            source: source.to_string(),
            timestamp: utc_now(),
            event,
        }
    }
}

/// Receiver side: the engine adapter that applies events locally
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: EventEnvelope);
}

/// Sender side: the API layer publishes through this
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: BusEvent) -> Result<()>;
}

/// Single-replica bus: publish dispatches straight into the local handler.
pub struct InProcessBus {
    instance_id: String,
    handler: Arc<dyn EventHandler>,
}

impl InProcessBus {
    pub fn new(instance_id: &str, handler: Arc<dyn EventHandler>) -> Self {
        info!("Event bus: in-process dispatch");
        Self {
            instance_id: instance_id.to_string(),
            handler,
        }
    }
}

#[async_trait]
impl EventBus for InProcessBus {
    async fn publish(&self, event: BusEvent) -> Result<()> {
        let envelope = EventEnvelope::new(&self.instance_id, event);
        self.handler.handle(envelope).await;
        Ok(())
    }
}

/// Redis pub/sub bus: JSON envelopes on one fixed channel, every replica
/// subscribed. Best-effort at-most-once; cron re-fires cover lost events.
pub struct RedisBus {
    instance_id: String,
    channel: String,
    conn: redis::aio::ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str, channel: &str, instance_id: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Bus(format!("Invalid Redis URL: {}", e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::Bus(format!("Failed to connect to Redis: {}", e)))?;

        info!(channel = %channel, "Event bus: Redis pub/sub");
        Ok(Self {
            instance_id: instance_id.to_string(),
            channel: channel.to_string(),
            conn,
        })
    }

    /// Spawn the subscriber loop for this replica. Runs until the token is
    /// cancelled; malformed payloads are logged and dropped.
    pub async fn spawn_subscriber(
        url: &str,
        channel: &str,
        handler: Arc<dyn EventHandler>,
        token: CancellationToken,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Bus(format!("Invalid Redis URL: {}", e)))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| Error::Bus(format!("Failed to open Redis subscription: {}", e)))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| Error::Bus(format!("Failed to subscribe to {}: {}", channel, e)))?;

        let channel = channel.to_string();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!(channel = %channel, "Bus subscriber stopping");
                        break;
                    }
                    message = stream.next() => {
                        let Some(message) = message else {
                            warn!(channel = %channel, "Bus subscription closed");
                            break;
                        };
                        let payload: String = match message.get_payload() {
                            Ok(p) => p,
                            Err(e) => {
                                warn!("Bus payload not readable: {}", e);
                                continue;
                            }
                        };
                        match serde_json::from_str::<EventEnvelope>(&payload) {
                            Ok(envelope) => {
                                debug!(source = %envelope.source, "Bus event received");
                                handler.handle(envelope).await;
                            }
                            Err(e) => warn!("Bus payload not deserializable: {}", e),
                        }
                    }
                }
            }
        });

        Ok(handle)
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, event: BusEvent) -> Result<()> {
        let envelope = EventEnvelope::new(&self.instance_id, event);
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| Error::Bus(format!("Failed to serialize event: {}", e)))?;

        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| Error::Bus(format!("Failed to publish event: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHandler {
        seen: Mutex<Vec<EventEnvelope>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle(&self, envelope: EventEnvelope) {
            self.seen.lock().unwrap().push(envelope);
        }
    }

    #[test]
    fn test_event_wire_format() {
        let envelope = EventEnvelope::new(
            "host:1",
            BusEvent::SubmitTask {
                task_id: "t-1".to_string(),
                parameters: serde_json::json!({"k": "v"}),
            },
        );

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "submit_task");
        assert_eq!(json["task_id"], "t-1");
        assert_eq!(json["source"], "host:1");
        assert!(json["timestamp"].is_string());

        let back: EventEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.event, envelope.event);
    }

    #[test]
    fn test_cancel_timer_wire_format() {
        let envelope = EventEnvelope::new(
            "host:2",
            BusEvent::CancelExecutionTimer {
                execution_id: "x-9".to_string(),
            },
        );
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"cancel_execution_timer\""));
        assert!(json.contains("\"execution_id\":\"x-9\""));
    }

    #[tokio::test]
    async fn test_in_process_bus_dispatches_inline() {
        let handler = Arc::new(RecordingHandler {
            seen: Mutex::new(Vec::new()),
        });
        let bus = InProcessBus::new("local:1", handler.clone());

        bus.publish(BusEvent::ReloadTasks).await.unwrap();
        bus.publish(BusEvent::CancelExecutionTimer {
            execution_id: "x-1".to_string(),
        })
        .await
        .unwrap();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event, BusEvent::ReloadTasks);
        assert_eq!(seen[0].source, "local:1");
    }
}
