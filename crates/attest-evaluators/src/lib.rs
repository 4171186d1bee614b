use std::sync::Arc;
use std::time::Duration;

use attest_core::evaluator::EvaluatorRegistry;
use attest_core::providers::{EmbeddingProvider, LlmProvider};
use attest_core::storage::{EmbeddingCache, JudgeCache};

pub mod constraint;
pub mod content;
pub mod embedding;
pub mod judge;
pub mod schema;
pub mod trace;
pub mod trace_tree;

pub use judge::JudgeOptions;

/// Registers the deterministic layers (1-4 plus trace_tree). These carry no
/// provider dependency and are always available.
pub fn register_deterministic(registry: &mut EvaluatorRegistry) {
    registry.register(Arc::new(schema::SchemaEvaluator::new()));
    registry.register(Arc::new(constraint::ConstraintEvaluator));
    registry.register(Arc::new(trace::TraceEvaluator));
    registry.register(Arc::new(content::ContentEvaluator));
    registry.register(Arc::new(trace_tree::TraceTreeEvaluator));
}

/// Builds the full registry. Embedding and judge evaluators are registered
/// only when their provider is configured; the registry's key set is what
/// the session advertises as capabilities.
pub fn default_registry(
    embedder: Option<(Arc<dyn EmbeddingProvider>, Arc<EmbeddingCache>)>,
    judge: Option<(Arc<dyn LlmProvider>, Arc<JudgeCache>, JudgeOptions)>,
) -> EvaluatorRegistry {
    let mut registry = EvaluatorRegistry::new();
    register_deterministic(&mut registry);
    if let Some((provider, cache)) = embedder {
        registry.register(Arc::new(embedding::EmbeddingEvaluator::new(provider, cache)));
    }
    if let Some((provider, cache, options)) = judge {
        registry.register(Arc::new(judge::JudgeEvaluator::new(provider, cache, options)));
    }
    registry
}

/// Default per-judge-call deadline, overridable via `ATTEST_JUDGE_TIMEOUT_S`.
pub const DEFAULT_JUDGE_TIMEOUT: Duration = Duration::from_secs(30);
