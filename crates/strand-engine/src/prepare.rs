//! Turns a workflow source into an executable, fully resolved graph.
//!
//! Resolution order is fixed: graph, plan, model, tools, retriever. The
//! first failure aborts preparation; nothing is executed.

use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use strand_core::config::RunConfig;
use strand_core::error::{Result, StrandError};
use strand_core::graph::{Graph, Source};
use strand_core::traits::{
    ModelProvider, ModelResolver, Persistence, Retriever, ToolHandle, ToolResolver,
};
use strand_core::types::{DocumentChunk, DocumentScope, ToolPermissions};

use crate::plan::Plan;

/// A retriever bound to the document scope of one run.
#[derive(Clone)]
pub struct BoundRetriever {
    inner: Arc<dyn Retriever>,
    scope: DocumentScope,
}

impl BoundRetriever {
    pub fn new(inner: Arc<dyn Retriever>, scope: DocumentScope) -> Self {
        Self { inner, scope }
    }

    pub fn scope(&self) -> &DocumentScope {
        &self.scope
    }

    pub async fn retrieve(&self, query: &str, limit: usize) -> Result<Vec<DocumentChunk>> {
        self.inner.retrieve(query, &self.scope, limit).await
    }
}

/// Everything a run needs, resolved before the first node executes.
#[derive(Clone)]
pub struct PreparedGraph {
    pub plan: Arc<Plan>,
    /// Stable identity of the graph, used for cache keys.
    pub graph_key: String,
    pub model: Arc<dyn ModelProvider>,
    pub tools: Vec<ToolHandle>,
    pub retriever: Option<BoundRetriever>,
    pub config: RunConfig,
    /// Template parameters or dynamic graph settings, seeded into the context.
    pub variables: Map<String, Value>,
    pub definition_id: Option<String>,
    pub template_id: Option<String>,
}

impl std::fmt::Debug for PreparedGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedGraph")
            .field("graph_key", &self.graph_key)
            .field("nodes", &self.plan.len())
            .field("model", &self.model.name())
            .field("tools", &self.tools)
            .field("retrieval", &self.retriever.is_some())
            .finish()
    }
}

/// Resolves sources against the configured backends.
#[derive(Clone)]
pub struct Preparer {
    persistence: Option<Arc<dyn Persistence>>,
    models: Arc<dyn ModelResolver>,
    tools: Option<Arc<dyn ToolResolver>>,
    retriever: Option<Arc<dyn Retriever>>,
}

struct ResolvedSource {
    graph: Graph,
    graph_key: String,
    variables: Map<String, Value>,
}

impl Preparer {
    pub fn new(models: Arc<dyn ModelResolver>) -> Self {
        Self {
            persistence: None,
            models,
            tools: None,
            retriever: None,
        }
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_tools(mut self, tools: Arc<dyn ToolResolver>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub async fn prepare(
        &self,
        source: &Source,
        config: &RunConfig,
        permissions: &ToolPermissions,
    ) -> Result<PreparedGraph> {
        let resolved = self.resolve_source(source).await?;
        let plan = Plan::build(&resolved.graph)?;

        let model = self.models.resolve(&config.provider, &config.model)?;

        let tools = match (&self.tools, config.enable_tools) {
            (Some(resolver), true) => {
                resolver.resolve_tools(config.allowed_tools.as_deref(), permissions)
            }
            _ => Vec::new(),
        };

        let retriever = if config.enable_retrieval {
            let inner = self.retriever.clone().ok_or_else(|| {
                StrandError::DependencyUnavailable(
                    "retrieval is enabled but no retriever is configured".into(),
                )
            })?;
            Some(BoundRetriever::new(inner, config.document_scope.clone()))
        } else {
            None
        };

        info!(
            source = source.label(),
            graph_key = %resolved.graph_key,
            nodes = plan.len(),
            model = %config.model,
            tools = tools.len(),
            retrieval = retriever.is_some(),
            "Graph prepared"
        );

        Ok(PreparedGraph {
            plan: Arc::new(plan),
            graph_key: resolved.graph_key,
            model,
            tools,
            retriever,
            config: config.clone(),
            variables: resolved.variables,
            definition_id: source.definition_id().map(str::to_string),
            template_id: source.template_id().map(str::to_string),
        })
    }

    async fn resolve_source(&self, source: &Source) -> Result<ResolvedSource> {
        match source {
            Source::Definition { id } => {
                let store = self.persistence()?;
                let def = store
                    .load_definition(id)
                    .await?
                    .ok_or_else(|| StrandError::SourceNotFound(format!("definition '{}'", id)))?;
                let digest = hash_json(&serde_json::to_value(&def.graph)?);
                debug!(definition_id = %id, "Loaded definition");
                Ok(ResolvedSource {
                    graph: def.graph,
                    graph_key: format!("definition:{}:{}", id, digest),
                    variables: Map::new(),
                })
            }
            Source::Template {
                id,
                param_overrides,
            } => {
                let store = self.persistence()?;
                let template = store
                    .load_template(id)
                    .await?
                    .ok_or_else(|| StrandError::SourceNotFound(format!("template '{}'", id)))?;
                let instance = template.instantiate(param_overrides)?;
                let digest = hash_json(&serde_json::json!({
                    "graph": instance.graph,
                    "params": instance.params,
                }));
                debug!(template_id = %id, params = instance.params.len(), "Instantiated template");
                Ok(ResolvedSource {
                    graph: instance.graph,
                    graph_key: format!("template:{}:{}", id, digest),
                    variables: instance.params,
                })
            }
            Source::Dynamic {
                nodes,
                edges,
                config,
            } => {
                let graph = Graph::new(nodes.clone(), edges.clone());
                let digest = hash_json(&serde_json::json!({
                    "graph": graph,
                    "config": config,
                }));
                Ok(ResolvedSource {
                    graph,
                    graph_key: format!("dynamic:{}", digest),
                    variables: config.clone(),
                })
            }
        }
    }

    fn persistence(&self) -> Result<&Arc<dyn Persistence>> {
        self.persistence.as_ref().ok_or_else(|| {
            StrandError::DependencyUnavailable("no workflow store is configured".into())
        })
    }
}

/// Hex SHA-256 of a value's canonical JSON.
pub(crate) fn hash_json(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}
