use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::RunId;

/// Coarse event grouping used for subscriber filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Lifecycle,
    Execution,
    Node,
    Stream,
    Middleware,
    Persistence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunStreaming,
    RunCompleted,
    RunFailed,
    ExecutionStarted,
    /// Pipeline returned; `status` in the payload says how.
    ExecutionFinished,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeSkipped,
    Chunk,
    CacheHit,
    CacheMiss,
    RetryScheduled,
    RateLimited,
    ValidationWarning,
    MessageSaved,
    PersistenceFailed,
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::RunStarted | Self::RunStreaming | Self::RunCompleted | Self::RunFailed => {
                EventCategory::Lifecycle
            }
            Self::ExecutionStarted | Self::ExecutionFinished => {
                EventCategory::Execution
            }
            Self::NodeStarted | Self::NodeCompleted | Self::NodeFailed | Self::NodeSkipped => {
                EventCategory::Node
            }
            Self::Chunk => EventCategory::Stream,
            Self::CacheHit
            | Self::CacheMiss
            | Self::RetryScheduled
            | Self::RateLimited
            | Self::ValidationWarning => EventCategory::Middleware,
            Self::MessageSaved | Self::PersistenceFailed => EventCategory::Persistence,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run.started",
            Self::RunStreaming => "run.streaming",
            Self::RunCompleted => "run.completed",
            Self::RunFailed => "run.failed",
            Self::ExecutionStarted => "execution.started",
            Self::ExecutionFinished => "execution.finished",
            Self::NodeStarted => "node.started",
            Self::NodeCompleted => "node.completed",
            Self::NodeFailed => "node.failed",
            Self::NodeSkipped => "node.skipped",
            Self::Chunk => "stream.chunk",
            Self::CacheHit => "cache.hit",
            Self::CacheMiss => "cache.miss",
            Self::RetryScheduled => "retry.scheduled",
            Self::RateLimited => "rate_limit.exceeded",
            Self::ValidationWarning => "validation.warning",
            Self::MessageSaved => "persistence.message_saved",
            Self::PersistenceFailed => "persistence.failed",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An append-only record of something that happened during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub category: EventCategory,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: RunId,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(
        kind: EventKind,
        run_id: &RunId,
        user_id: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            category: kind.category(),
            kind,
            run_id: run_id.clone(),
            user_id: user_id.to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events; filtering happens on the receiving side.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A consumer of bus events. Each subscriber owns its own durability.
pub trait Subscriber: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Categories this subscriber wants. Empty means all.
    fn categories(&self) -> &[EventCategory] {
        &[]
    }

    fn handle(&self, event: &Event) -> BoxFuture<'_, Result<()>>;
}

/// Drive `subscriber` from `bus` on its own task until `cancel` fires or the bus closes.
///
/// A failing or lagging subscriber only logs; it never affects publishers.
pub fn spawn_subscriber(
    bus: &EventBus,
    subscriber: Arc<dyn Subscriber>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                recv = rx.recv() => match recv {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        warn!(subscriber = subscriber.name(), skipped = n, "Subscriber lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let wanted = subscriber.categories();
            if !wanted.is_empty() && !wanted.contains(&event.category) {
                continue;
            }
            if let Err(e) = subscriber.handle(&event).await {
                warn!(subscriber = subscriber.name(), event = %event.kind, error = %e, "Subscriber failed");
            }
        }
        debug!(subscriber = subscriber.name(), "Subscriber stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Collect {
        seen: Mutex<Vec<EventKind>>,
        cats: Vec<EventCategory>,
    }

    impl Subscriber for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        fn categories(&self) -> &[EventCategory] {
            &self.cats
        }

        fn handle(&self, event: &Event) -> BoxFuture<'_, Result<()>> {
            let kind = event.kind;
            Box::pin(async move {
                self.seen.lock().unwrap().push(kind);
                Ok(())
            })
        }
    }

    #[test]
    fn kinds_map_to_categories() {
        assert_eq!(EventKind::RunFailed.category(), EventCategory::Lifecycle);
        assert_eq!(EventKind::ExecutionFinished.category(), EventCategory::Execution);
        assert_eq!(EventKind::CacheHit.category(), EventCategory::Middleware);
        assert_eq!(EventKind::Chunk.as_str(), "stream.chunk");
    }

    #[tokio::test]
    async fn subscriber_receives_only_its_categories() {
        let bus = EventBus::new(16);
        let sub = Arc::new(Collect {
            seen: Mutex::new(Vec::new()),
            cats: vec![EventCategory::Lifecycle],
        });
        let cancel = CancellationToken::new();
        let handle = spawn_subscriber(&bus, sub.clone(), cancel.clone());

        let run = RunId::new();
        bus.publish(Event::new(EventKind::RunStarted, &run, "u", serde_json::Value::Null));
        bus.publish(Event::new(EventKind::NodeStarted, &run, "u", serde_json::Value::Null));
        bus.publish(Event::new(EventKind::RunCompleted, &run, "u", serde_json::Value::Null));

        tokio::time::timeout(Duration::from_secs(2), async {
            while sub.seen.lock().unwrap().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            *sub.seen.lock().unwrap(),
            vec![EventKind::RunStarted, EventKind::RunCompleted]
        );
    }
}
