use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use strand_core::config::{AppConfig, RunConfigPatch, StrategyKind};
use strand_core::graph::{Graph, Source};
use strand_engine::{
    LogSubscriber, Plan, RunRequest, RunResult, StrategyFactory, StreamEvent, WorkflowEngine,
};
use strand_llm::ProviderRegistry;
use strand_store::SqliteStore;
use strand_tools::ToolRegistry;

#[derive(Parser)]
#[command(name = "strand", version, about = "Workflow execution pipeline for LLM graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "strand.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow and print its answer
    Run {
        /// JSON graph file (`{"nodes": [...], "edges": [...]}`)
        graph: Option<PathBuf>,
        /// Run a stored definition instead of a graph file
        #[arg(long, conflicts_with_all = ["graph", "template"])]
        definition: Option<String>,
        /// Run a stored template instead of a graph file
        #[arg(long, conflicts_with = "graph")]
        template: Option<String>,
        /// Template parameter override, `name=value` (value may be JSON)
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,
        /// Print chunks as they are generated
        #[arg(long)]
        stream: bool,
        /// User the run is attributed to
        #[arg(long, default_value = "local")]
        user: String,
        /// Conversation to append the answer to
        #[arg(long)]
        conversation: Option<String>,
        /// Force an execution strategy (sequential, graph, parallel)
        #[arg(long)]
        strategy: Option<String>,
        /// Override the configured model
        #[arg(long)]
        model: Option<String>,
        /// Override the configured provider
        #[arg(long)]
        provider: Option<String>,
        /// Disable tool use for this run
        #[arg(long)]
        no_tools: bool,
        /// Enable document retrieval for this run
        #[arg(long)]
        retrieval: bool,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
        /// The input message
        #[arg(trailing_var_arg = true)]
        input: Vec<String>,
    },
    /// Check a graph file without running it
    Validate {
        graph: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STRAND_LOG")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("strand=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { graph } => validate(&graph),
        Commands::Run {
            graph,
            definition,
            template,
            params,
            stream,
            user,
            conversation,
            strategy,
            model,
            provider,
            no_tools,
            retrieval,
            json,
            input,
        } => {
            let config = load_config(&cli.config)?;
            let source = match (graph, definition, template) {
                (Some(path), _, _) => read_dynamic(&path)?,
                (None, Some(id), _) => Source::Definition { id },
                (None, None, Some(id)) => Source::Template {
                    id,
                    param_overrides: parse_params(&params)?,
                },
                (None, None, None) => bail!("give a graph file, --definition or --template"),
            };

            let mut request = RunRequest::new(source, user, input.join(" "));
            request.conversation_id = conversation;
            request.strategy = strategy.as_deref().map(parse_strategy).transpose()?;
            request.config = RunConfigPatch {
                model,
                provider,
                enable_tools: no_tools.then_some(false),
                enable_retrieval: retrieval.then_some(true),
                ..Default::default()
            };

            let engine = Arc::new(build_engine(config)?);
            let cancel = CancellationToken::new();
            let _subscribers = engine.spawn_subscribers(&cancel);
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, cancelling run");
                        cancel.cancel();
                    }
                });
            }

            let result = if stream {
                run_streaming(&engine, request, cancel.clone()).await?
            } else {
                let result = engine.run(request, cancel.clone()).await;
                if result.is_success() && !json {
                    println!("{}", result.response);
                }
                result
            };
            cancel.cancel();
            report(&result, json)
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        return Ok(AppConfig::load(path)?);
    }
    let home = strand_core::config::expand_home("~/.strand/config.toml");
    if home.exists() {
        info!(path = %home.display(), "Loading config from home directory");
        return Ok(AppConfig::load(&home)?);
    }
    warn!("No config file found, using defaults");
    Ok(AppConfig::default())
}

fn build_engine(config: AppConfig) -> anyhow::Result<WorkflowEngine> {
    let db_path = config.store_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = Arc::new(
        SqliteStore::open(&db_path)
            .with_context(|| format!("opening store at {}", db_path.display()))?,
    );
    let models = Arc::new(ProviderRegistry::from_config(&config.providers)?);
    let tools = Arc::new(ToolRegistry::with_builtins());

    Ok(WorkflowEngine::builder(config)
        .models(models)
        .tools(tools)
        .persistence(store.clone())
        .retriever(store)
        .subscriber(Arc::new(LogSubscriber))
        .build()?)
}

async fn run_streaming(
    engine: &Arc<WorkflowEngine>,
    request: RunRequest,
    cancel: CancellationToken,
) -> anyhow::Result<RunResult> {
    let mut stream = engine.run_streaming(request, cancel);
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                print!("{}", chunk.delta);
                stdout.flush().ok();
            }
            StreamEvent::Done(result) => {
                println!();
                return Ok(*result);
            }
        }
    }
    bail!("stream ended without a result")
}

fn report(result: &RunResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    for warning in &result.warnings {
        warn!(warning = %warning, "Run finished with a warning");
    }
    match &result.error {
        Some(error) => bail!("{} ({}, {})", error.user_message, error.kind, error.stage),
        None => Ok(()),
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let (graph, _) = read_graph(path)?;
    let plan = Plan::build(&graph)?;
    let strategy = StrategyFactory::default().select(None, &plan);
    println!(
        "ok: {} nodes, {} levels, strategy {:?}{}",
        plan.len(),
        plan.levels().len(),
        strategy.kind(),
        if plan.has_loops() { ", has loops" } else { "" }
    );
    Ok(())
}

/// A graph file plus its optional top-level `config` object.
fn read_graph(path: &Path) -> anyhow::Result<(Graph, Map<String, Value>)> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut value: Value = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    let config = match value.as_object_mut().and_then(|o| o.remove("config")) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    };
    let graph: Graph = serde_json::from_value(value)
        .with_context(|| format!("{} is not a workflow graph", path.display()))?;
    Ok((graph, config))
}

fn read_dynamic(path: &Path) -> anyhow::Result<Source> {
    let (graph, config) = read_graph(path)?;
    Ok(Source::Dynamic {
        nodes: graph.nodes,
        edges: graph.edges,
        config,
    })
}

fn parse_params(params: &[String]) -> anyhow::Result<Map<String, Value>> {
    let mut out = Map::new();
    for param in params {
        let Some((name, raw)) = param.split_once('=') else {
            bail!("parameter '{}' is not NAME=VALUE", param);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        out.insert(name.trim().to_string(), value);
    }
    Ok(out)
}

fn parse_strategy(name: &str) -> anyhow::Result<StrategyKind> {
    match name {
        "auto" => Ok(StrategyKind::Auto),
        "sequential" => Ok(StrategyKind::Sequential),
        "graph" | "dag" => Ok(StrategyKind::Graph),
        "parallel" => Ok(StrategyKind::Parallel),
        other => bail!("unknown strategy '{}'", other),
    }
}
