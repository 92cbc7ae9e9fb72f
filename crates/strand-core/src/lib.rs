pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod template;
pub mod traits;
pub mod types;

pub use config::{AppConfig, RunConfig, RunConfigPatch};
pub use error::{ErrorKind, ErrorReport, Result, Stage, StrandError};
pub use event::{Event, EventBus, EventCategory, EventKind, Subscriber};
pub use graph::{Edge, EdgeCondition, Graph, Node, NodeType, Source};
pub use traits::*;
pub use types::*;
