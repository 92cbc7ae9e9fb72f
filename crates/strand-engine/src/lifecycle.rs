//! Run lifecycle state machine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::event::{Event, EventBus, EventKind};
use strand_core::types::RunId;

use crate::result::RunResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Preparing,
    Running,
    Streaming,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Preparing, Running)
                | (Preparing, Failed)
                | (Running, Streaming)
                | (Running, Completed)
                | (Running, Failed)
                | (Streaming, Completed)
                | (Streaming, Failed)
        )
    }
}

/// Tracks one run's state and publishes its lifecycle events.
///
/// Exactly one of `RunCompleted` or `RunFailed` is published per run.
pub struct RunLifecycle {
    run_id: RunId,
    user_id: String,
    state: RunState,
    bus: Arc<EventBus>,
}

impl RunLifecycle {
    pub fn new(run_id: RunId, user_id: impl Into<String>, bus: Arc<EventBus>) -> Self {
        Self {
            run_id,
            user_id: user_id.into(),
            state: RunState::Preparing,
            bus,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Announce the run. Only valid while preparing.
    pub fn started(&mut self, source: &str, streaming: bool) -> Result<()> {
        if self.state != RunState::Preparing {
            return Err(StrandError::Internal(format!(
                "run announced in state {:?}",
                self.state
            )));
        }
        self.publish(
            EventKind::RunStarted,
            json!({ "source": source, "streaming": streaming }),
        );
        Ok(())
    }

    /// Preparation finished; execution begins.
    pub fn running(&mut self) -> Result<()> {
        self.advance(RunState::Running)
    }

    pub fn streaming(&mut self) -> Result<()> {
        self.advance(RunState::Streaming)?;
        self.publish(EventKind::RunStreaming, Value::Null);
        Ok(())
    }

    /// Move to the terminal state matching `result.status`.
    pub fn finish(&mut self, result: &RunResult) -> Result<()> {
        if result.is_success() {
            self.advance(RunState::Completed)?;
            self.publish(
                EventKind::RunCompleted,
                json!({
                    "duration_ms": result.duration_ms,
                    "tokens": result.tokens_used(),
                    "cost": result.usage.cost,
                    "tool_calls": result.tool_calls,
                    "warnings": result.warnings,
                }),
            );
        } else {
            self.advance(RunState::Failed)?;
            self.publish(
                EventKind::RunFailed,
                json!({
                    "duration_ms": result.duration_ms,
                    "tokens": result.tokens_used(),
                    "cost": result.usage.cost,
                    "error": result.error,
                    "partial_len": result.response.len(),
                }),
            );
        }
        Ok(())
    }

    fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(StrandError::Internal(format!(
                "invalid run transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!(run_id = %self.run_id, from = ?self.state, to = ?next, "Run state");
        self.state = next;
        Ok(())
    }

    fn publish(&self, kind: EventKind, payload: Value) {
        self.bus
            .publish(Event::new(kind, &self.run_id, &self.user_id, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        use RunState::*;
        assert!(Preparing.can_transition_to(Running));
        assert!(Preparing.can_transition_to(Failed));
        assert!(!Preparing.can_transition_to(Streaming));
        assert!(Running.can_transition_to(Streaming));
        assert!(Streaming.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Failed));
        assert!(!Streaming.can_transition_to(Running));
    }

    #[test]
    fn no_reentry_after_terminal_state() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let mut lifecycle = RunLifecycle::new(RunId::from_string("r"), "u1", bus);

        lifecycle.started("dynamic", true).unwrap();
        assert!(lifecycle.streaming().is_err());
        lifecycle.running().unwrap();
        lifecycle.streaming().unwrap();
        lifecycle.advance(RunState::Failed).unwrap();
        assert!(lifecycle.state().is_terminal());
        assert!(lifecycle.started("dynamic", true).is_err());

        assert_eq!(rx.try_recv().unwrap().kind, EventKind::RunStarted);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::RunStreaming);
        assert!(rx.try_recv().is_err());
    }
}
