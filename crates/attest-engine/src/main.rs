use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use attest_core::pipeline::Pipeline;
use attest_core::providers::openai::{OpenAiEmbedder, OpenAiJudge};
use attest_core::providers::rate_limit::RateLimitedProvider;
use attest_core::providers::{EmbeddingProvider, LlmProvider};
use attest_core::session::Session;
use attest_core::storage::{EmbeddingCache, HistoryStore, JudgeCache, Store};
use attest_engine::config::EngineConfig;
use attest_engine::server::{Engine, Server};
use attest_evaluators::JudgeOptions;

/// Eviction budget for the judge verdict cache. Verdicts are tiny compared
/// to vectors, so this is not separately tunable.
const JUDGE_CACHE_MAX_MB: u64 = 500;

#[derive(Parser, Debug)]
#[command(author, version, about = "attest assertion engine (stdio JSON-RPC subprocess)", long_about = None)]
struct Args {
    /// Overrides ATTEST_CACHE_DIR.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Dispatch workers; 1 means strictly sequential request handling.
    #[arg(long, default_value_t = 1)]
    max_concurrent: usize,

    /// Abort a batch once this many soft failures have been recorded.
    #[arg(long)]
    soft_fail_budget: Option<u32>,
}

use tracing_subscriber::EnvFilter;

/// stdout carries the wire protocol, so diagnostics are structured JSON on
/// stderr and are never parsed by callers. Flattened event fields keep the
/// `event = "..."` keys greppable at the top level.
fn init_logging(cfg: &EngineConfig) {
    let filter = cfg
        .log_level
        .parse::<EnvFilter>()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_embedder(cfg: &EngineConfig) -> Result<Option<Arc<dyn EmbeddingProvider>>> {
    match cfg.embedding_provider.as_str() {
        "auto" => Ok(cfg
            .openai_api_key
            .clone()
            .map(|key| Arc::new(OpenAiEmbedder::new(None, key)) as Arc<dyn EmbeddingProvider>)),
        "openai" => {
            let key = cfg.openai_api_key.clone().ok_or_else(|| {
                anyhow::anyhow!("ATTEST_EMBEDDING_PROVIDER=openai requires ATTEST_OPENAI_API_KEY")
            })?;
            Ok(Some(Arc::new(OpenAiEmbedder::new(None, key))))
        }
        "onnx" => anyhow::bail!("embedding provider 'onnx' is not compiled into this build"),
        "none" => Ok(None),
        other => anyhow::bail!("unknown embedding provider '{}'", other),
    }
}

fn build_judge(cfg: &EngineConfig) -> Result<Option<Arc<dyn LlmProvider>>> {
    let inner: Option<Arc<dyn LlmProvider>> = match cfg.judge_provider.as_str() {
        "auto" => cfg
            .openai_api_key
            .clone()
            .map(|key| Arc::new(OpenAiJudge::new(cfg.judge_model.clone(), key)) as Arc<dyn LlmProvider>),
        "openai" => {
            let key = cfg.openai_api_key.clone().ok_or_else(|| {
                anyhow::anyhow!("ATTEST_JUDGE_PROVIDER=openai requires ATTEST_OPENAI_API_KEY")
            })?;
            Some(Arc::new(OpenAiJudge::new(cfg.judge_model.clone(), key)))
        }
        "none" => None,
        other => anyhow::bail!("unknown judge provider '{}'", other),
    };
    Ok(inner.map(|provider| {
        Arc::new(RateLimitedProvider::new(
            provider,
            cfg.judge_rpm,
            cfg.judge_burst,
        )) as Arc<dyn LlmProvider>
    }))
}

fn capabilities(registry: &attest_core::evaluator::EvaluatorRegistry) -> Vec<String> {
    let mut caps = vec![
        "layers_1_4".to_string(),
        "trace_tree".to_string(),
        "plugins".to_string(),
        "continuous_eval".to_string(),
    ];
    let embedding = registry.has("embedding");
    let judge = registry.has("judge");
    if embedding {
        caps.push("embedding".to_string());
    }
    if judge {
        caps.push("llm_judge".to_string());
    }
    if embedding || judge {
        caps.push("layers_5_6".to_string());
    }
    caps
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = EngineConfig::from_env();
    if let Some(dir) = args.cache_dir {
        cfg.cache_dir = dir;
    }
    init_logging(&cfg);

    let store = Store::open(&cfg.db_path())?;
    let embedding_cache = Arc::new(EmbeddingCache::new(
        store.clone(),
        cfg.embedding_cache_max_mb,
    ));
    let judge_cache = Arc::new(JudgeCache::new(store.clone(), JUDGE_CACHE_MAX_MB));
    let history = Arc::new(HistoryStore::new(store));

    let embedder = build_embedder(&cfg)?;
    let judge = build_judge(&cfg)?;
    let judge_options = JudgeOptions {
        timeout: Duration::from_secs(cfg.judge_timeout_s),
        meta_eval: cfg.judge_meta_eval,
    };

    let registry = attest_evaluators::default_registry(
        embedder.map(|p| (p, embedding_cache.clone())),
        judge.map(|p| (p, judge_cache.clone(), judge_options)),
    );
    let capabilities = capabilities(&registry);

    let mut pipeline = Pipeline::new(Arc::new(registry)).with_history(history.clone());
    if let Some(limit) = args.soft_fail_budget {
        pipeline = pipeline.with_soft_fail_limit(limit);
    }

    let engine = Arc::new(Engine::new(
        Session::new(),
        pipeline,
        history,
        capabilities,
        args.max_concurrent,
    ));

    tracing::info!(
        event = "engine_start",
        cache_dir = %cfg.cache_dir.display(),
        capabilities = ?engine.capabilities,
        max_concurrent = engine.max_concurrent,
    );

    Server {
        engine: engine.clone(),
    }
    .run()
    .await?;

    // Teardown: drain pending LRU updates and join the flusher loops.
    embedding_cache.close().await;
    judge_cache.close().await;
    tracing::info!(event = "engine_exit");
    Ok(())
}
