//! Delivery of streamed model output to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use strand_core::error::{Result, StrandError};
use strand_core::event::{Event, EventBus, EventKind};
use strand_core::types::{RunId, StreamChunk};

use crate::result::RunResult;

/// One item of a streaming run.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    /// Terminal sentinel. Always the last item.
    Done(Box<RunResult>),
}

/// Ordered chunk emitter shared by the nodes of one streaming run.
///
/// Tracks how many chunks went out and the concatenated text, so retry can
/// refuse to replay and a cancelled run can report partial content. A closed
/// receiver cancels the run.
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<StreamEvent>,
    inner: Arc<SinkState>,
}

struct SinkState {
    emitted: AtomicU64,
    text: Mutex<String>,
    cancel: CancellationToken,
    bus: Arc<EventBus>,
    run_id: RunId,
    user_id: String,
}

impl ChunkSink {
    pub fn new(
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
        bus: Arc<EventBus>,
        run_id: RunId,
        user_id: String,
    ) -> Self {
        Self {
            tx,
            inner: Arc::new(SinkState {
                emitted: AtomicU64::new(0),
                text: Mutex::new(String::new()),
                cancel,
                bus,
                run_id,
                user_id,
            }),
        }
    }

    pub async fn emit(&self, node_id: &str, delta: &str) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let index = {
            let mut text = self.inner.text.lock().await;
            text.push_str(delta);
            self.inner.emitted.fetch_add(1, Ordering::SeqCst)
        };

        let chunk = StreamChunk {
            index,
            node_id: node_id.to_string(),
            delta: delta.to_string(),
        };
        self.inner.bus.publish(Event::new(
            EventKind::Chunk,
            &self.inner.run_id,
            &self.inner.user_id,
            serde_json::json!({ "index": index, "node_id": node_id, "len": delta.len() }),
        ));

        if self.tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
            // Consumer went away
            self.inner.cancel.cancel();
            return Err(StrandError::Cancelled);
        }
        Ok(())
    }

    pub fn emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::SeqCst)
    }

    pub async fn accumulated(&self) -> String {
        self.inner.text.lock().await.clone()
    }

    /// Send the terminal sentinel. Errors are ignored: the consumer may be gone.
    pub async fn finish(&self, result: RunResult) {
        let _ = self.tx.send(StreamEvent::Done(Box::new(result))).await;
    }
}
