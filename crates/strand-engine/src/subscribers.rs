//! Built-in event bus subscribers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strand_core::error::Result;
use strand_core::event::{Event, EventBus, EventCategory, EventKind, Subscriber};
use strand_core::types::RunId;

/// Mirrors bus events into `tracing`.
pub struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    fn categories(&self) -> &[EventCategory] {
        &[
            EventCategory::Lifecycle,
            EventCategory::Execution,
            EventCategory::Node,
            EventCategory::Middleware,
            EventCategory::Persistence,
        ]
    }

    fn handle(&self, event: &Event) -> BoxFuture<'_, Result<()>> {
        let kind = event.kind.as_str();
        match event.kind {
            EventKind::RunFailed
            | EventKind::NodeFailed
            | EventKind::RateLimited
            | EventKind::PersistenceFailed => {
                warn!(run_id = %event.run_id, user_id = %event.user_id, kind, payload = %event.payload, "Event");
            }
            EventKind::RunStarted | EventKind::RunCompleted => {
                info!(run_id = %event.run_id, user_id = %event.user_id, kind, payload = %event.payload, "Event");
            }
            _ => {
                debug!(run_id = %event.run_id, kind, payload = %event.payload, "Event");
            }
        }
        Box::pin(async { Ok(()) })
    }
}

/// Process-wide counters fed from the bus.
#[derive(Default)]
pub struct MetricsSubscriber {
    runs_started: AtomicU64,
    runs_completed: AtomicU64,
    runs_failed: AtomicU64,
    tokens: AtomicU64,
    /// Cost in millionths of a USD.
    cost_micros: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    rate_limited: AtomicU64,
    chunks: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub tokens: u64,
    pub cost: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub chunks: u64,
}

impl MetricsSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_completed: self.runs_completed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            tokens: self.tokens.load(Ordering::Relaxed),
            cost: self.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
        }
    }

    fn add_usage(&self, event: &Event) {
        let tokens = event.payload.get("tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        let cost = event.payload.get("cost").and_then(|v| v.as_f64()).unwrap_or(0.0);
        self.tokens.fetch_add(tokens, Ordering::Relaxed);
        self.cost_micros
            .fetch_add((cost * 1_000_000.0).round() as u64, Ordering::Relaxed);
    }
}

impl Subscriber for MetricsSubscriber {
    fn name(&self) -> &str {
        "metrics"
    }

    fn handle(&self, event: &Event) -> BoxFuture<'_, Result<()>> {
        match event.kind {
            EventKind::RunStarted => {
                self.runs_started.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::RunCompleted => {
                self.runs_completed.fetch_add(1, Ordering::Relaxed);
                self.add_usage(event);
            }
            EventKind::RunFailed => {
                self.runs_failed.fetch_add(1, Ordering::Relaxed);
                self.add_usage(event);
            }
            EventKind::CacheHit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::CacheMiss => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::RetryScheduled => {
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::RateLimited => {
                self.rate_limited.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::Chunk => {
                self.chunks.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
        Box::pin(async { Ok(()) })
    }
}

/// JSONL run logger.
///
/// Writes one JSON object per line to `{log_dir}/{run_id}.jsonl` for a single
/// run, flushing after every entry so a crash keeps everything written so far.
/// `level` controls verbosity: 1=run summary, 2=per-node, 3=per-chunk.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write on a background task until the run's terminal
    /// event, cancellation, or the bus closing.
    pub fn spawn(self, bus: &EventBus, run_id: RunId, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    async fn run(
        self,
        mut rx: tokio::sync::broadcast::Receiver<Event>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }
        let log_path = self.log_dir.join(format!("{}.jsonl", run_id));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };
        debug!(path = %log_path.display(), "RunLogger started");

        let mut writer = tokio::io::BufWriter::new(file);
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                recv = rx.recv() => match recv {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            if event.run_id != run_id {
                continue;
            }

            if let Some(entry) = self.event_to_entry(&event) {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let line = format!("{}\n", json);
                    if let Err(e) = writer.write_all(line.as_bytes()).await {
                        error!(error = %e, "Failed to write log entry");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        error!(error = %e, "Failed to flush log");
                    }
                }
            }

            if matches!(event.kind, EventKind::RunCompleted | EventKind::RunFailed) {
                break;
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// `None` when the event is below the configured level.
    fn event_to_entry(&self, event: &Event) -> Option<LogEntry> {
        let min_level = match event.category {
            EventCategory::Lifecycle | EventCategory::Execution | EventCategory::Persistence => 1,
            EventCategory::Node | EventCategory::Middleware => 2,
            EventCategory::Stream => 3,
        };
        if self.level < min_level {
            return None;
        }
        let detail = match &event.payload {
            serde_json::Value::Null => None,
            payload => Some(payload.clone()),
        };
        Some(LogEntry {
            timestamp: event.timestamp.to_rfc3339(),
            run_id: event.run_id.to_string(),
            event_type: event.kind.as_str(),
            detail,
        })
    }
}

/// Subscribers wired by default for every engine.
pub fn default_subscribers() -> Vec<Arc<dyn Subscriber>> {
    vec![Arc::new(LogSubscriber)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind, payload: serde_json::Value) -> Event {
        Event::new(kind, &RunId::from_string("r1"), "u1", payload)
    }

    #[tokio::test]
    async fn metrics_count_runs_and_usage() {
        let metrics = MetricsSubscriber::new();
        metrics.handle(&event(EventKind::RunStarted, json!({}))).await.unwrap();
        metrics
            .handle(&event(EventKind::RunCompleted, json!({"tokens": 18, "cost": 0.0025})))
            .await
            .unwrap();
        metrics
            .handle(&event(EventKind::RunFailed, json!({"tokens": 2, "cost": 0.0})))
            .await
            .unwrap();
        metrics.handle(&event(EventKind::CacheHit, json!({}))).await.unwrap();

        let snap = metrics.snapshot();
        assert_eq!(snap.runs_started, 1);
        assert_eq!(snap.runs_completed, 1);
        assert_eq!(snap.runs_failed, 1);
        assert_eq!(snap.tokens, 20);
        assert!((snap.cost - 0.0025).abs() < 1e-9);
        assert_eq!(snap.cache_hits, 1);
    }

    #[test]
    fn log_level_filtering() {
        let summary = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(summary.event_to_entry(&event(EventKind::RunStarted, json!({}))).is_some());
        assert!(summary.event_to_entry(&event(EventKind::NodeStarted, json!({}))).is_none());
        assert!(summary.event_to_entry(&event(EventKind::Chunk, json!({}))).is_none());

        let verbose = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(verbose.event_to_entry(&event(EventKind::Chunk, json!({}))).is_some());
    }

    #[test]
    fn entries_skip_empty_detail() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 1);
        let entry = logger
            .event_to_entry(&event(EventKind::RunStreaming, serde_json::Value::Null))
            .unwrap();
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run.streaming"));
        assert!(!json.contains("detail"));
    }

    #[tokio::test]
    async fn run_logger_writes_only_its_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(64);
        let handle = RunLogger::new(dir.path().to_path_buf(), 2).spawn(
            &bus,
            RunId::from_string("r1"),
            CancellationToken::new(),
        );

        bus.publish(event(EventKind::RunStarted, json!({"source": "dynamic"})));
        bus.publish(Event::new(
            EventKind::RunStarted,
            &RunId::from_string("other"),
            "u2",
            json!({}),
        ));
        bus.publish(event(EventKind::NodeCompleted, json!({"node_id": "answer"})));
        bus.publish(event(EventKind::RunCompleted, json!({"tokens": 18})));

        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let content = std::fs::read_to_string(dir.path().join("r1.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("run.started"));
        assert!(lines[2].contains("run.completed"));
    }
}
