//! Workflow execution for Strand.
//!
//! A run flows through four stages: [`prepare`] resolves a [`Source`] into a
//! validated [`Plan`] with its collaborators, a [`middleware`] pipeline wraps
//! the chosen [`strategy`], the strategy walks the graph running one
//! [`nodes`] executor per node against a mutable [`Context`], and the
//! [`result`] processor turns the terminal context into a [`RunResult`].
//!
//! [`Source`]: strand_core::graph::Source

pub mod context;
pub mod engine;
pub mod env;
pub mod expr;
pub mod lifecycle;
pub mod middleware;
pub mod nodes;
pub mod plan;
pub mod prepare;
pub mod result;
pub mod sink;
pub mod strategy;
pub mod subscribers;
pub mod walk;

#[cfg(test)]
mod testing;

pub use context::{Context, ContextField, ErrorState, TraceEntry, TraceStatus};
pub use engine::{RunRequest, RunStream, WorkflowEngine, WorkflowEngineBuilder};
pub use env::RunEnv;
pub use lifecycle::{RunLifecycle, RunState};
pub use nodes::{ExecutorRegistry, NodeExecutor, NodeKind};
pub use plan::Plan;
pub use prepare::{PreparedGraph, Preparer};
pub use result::{ChatView, ExecutionView, ResultProcessor, RunMeta, RunResult, RunStatus, TraceView};
pub use sink::{ChunkSink, StreamEvent};
pub use strategy::{ExecutionFailure, ExecutionStrategy, StrategyFactory};
pub use subscribers::{LogSubscriber, MetricsSnapshot, MetricsSubscriber, RunLogger};
