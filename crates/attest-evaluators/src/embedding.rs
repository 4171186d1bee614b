//! Layer 5: embedding cosine similarity between a resolved target and a
//! reference string, with a persistent vector cache in front of the
//! provider.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use attest_core::assertion::{Assertion, AssertionResult};
use attest_core::embeddings::cosine_similarity;
use attest_core::evaluator::Evaluator;
use attest_core::providers::EmbeddingProvider;
use attest_core::resolve;
use attest_core::storage::EmbeddingCache;
use attest_core::trace::Trace;

pub const DEFAULT_THRESHOLD: f64 = 0.8;

#[derive(Debug, Deserialize)]
struct EmbeddingSpec {
    target: String,
    reference: String,
    #[serde(default)]
    threshold: Option<serde_json::Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    soft: bool,
}

pub(crate) fn numeric_threshold(raw: Option<&serde_json::Value>, default: f64) -> f64 {
    match raw {
        Some(v) => v.as_f64().unwrap_or(default),
        None => default,
    }
}

pub struct EmbeddingEvaluator {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
}

impl EmbeddingEvaluator {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache: Arc<EmbeddingCache>) -> Self {
        Self { provider, cache }
    }

    /// Cache-first vector lookup. Write-through failures are logged and
    /// ignored; the vector is still usable for this evaluation.
    async fn embed(&self, text: &str, model: &str) -> anyhow::Result<Vec<f32>> {
        match self.cache.get(text, model) {
            Ok(Some(vec)) => return Ok(vec),
            Ok(None) => {}
            Err(e) => tracing::warn!(event = "embedding_cache_read_failed", error = %e),
        }
        let vec = self.provider.embed(text).await?;
        if let Err(e) = self.cache.put(text, model, &vec) {
            tracing::warn!(event = "embedding_cache_write_failed", error = %e);
        }
        Ok(vec)
    }
}

#[async_trait]
impl Evaluator for EmbeddingEvaluator {
    fn assertion_type(&self) -> &'static str {
        "embedding"
    }

    async fn evaluate(
        &self,
        trace: &Trace,
        assertion: &Assertion,
    ) -> anyhow::Result<AssertionResult> {
        let spec: EmbeddingSpec = serde_json::from_value(assertion.spec.clone())
            .map_err(|e| anyhow::anyhow!("invalid embedding spec: {}", e))?;
        let threshold = numeric_threshold(spec.threshold.as_ref(), DEFAULT_THRESHOLD);
        let model = spec.model.unwrap_or_else(|| self.provider.model_id());

        let resolved = match resolve::resolve(trace, &spec.target) {
            Ok(r) => r,
            Err(e) => {
                return Ok(AssertionResult::fail(
                    &assertion.assertion_id,
                    spec.soft,
                    0.0,
                    e,
                ))
            }
        };

        let target_vec = self.embed(&resolved.text, &model).await?;
        let reference_vec = self.embed(&spec.reference, &model).await?;
        let similarity = cosine_similarity(&target_vec, &reference_vec)?;
        let score = similarity.clamp(0.0, 1.0);

        if similarity >= threshold {
            Ok(AssertionResult::new(
                &assertion.assertion_id,
                attest_core::assertion::AssertionStatus::Pass,
                score,
                format!(
                    "cosine similarity {:.3} meets threshold {:.2} (model {})",
                    similarity, threshold, model
                ),
            ))
        } else {
            Ok(AssertionResult::fail(
                &assertion.assertion_id,
                spec.soft,
                score,
                format!(
                    "cosine similarity {:.3} below threshold {:.2} (model {})",
                    similarity, threshold, model
                ),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_core::assertion::AssertionStatus;
    use attest_core::embeddings::encode_vec_f32;
    use attest_core::providers::fake::FakeEmbedder;
    use attest_core::storage::Store;
    use serde_json::json;

    fn trace(message: &str) -> Trace {
        serde_json::from_value(json!({
            "schema_version": 2,
            "trace_id": "t1",
            "output": {"message": message}
        }))
        .unwrap()
    }

    fn assertion(spec: serde_json::Value) -> Assertion {
        Assertion {
            assertion_id: "e1".into(),
            kind: "embedding".into(),
            spec,
            request_id: None,
        }
    }

    fn evaluator() -> (EmbeddingEvaluator, Arc<FakeEmbedder>) {
        let provider = Arc::new(FakeEmbedder::new(32));
        let cache = Arc::new(EmbeddingCache::new(Store::memory().unwrap(), 500));
        (
            EmbeddingEvaluator::new(provider.clone(), cache),
            provider,
        )
    }

    #[tokio::test]
    async fn identical_strings_pass_at_similarity_one() -> anyhow::Result<()> {
        let (ev, _) = evaluator();
        let a = assertion(json!({
            "target": "output.message",
            "reference": "the refund was processed"
        }));
        let r = ev.evaluate(&trace("the refund was processed"), &a).await?;
        assert_eq!(r.status, AssertionStatus::Pass);
        assert!((r.score - 1.0).abs() < 1e-6);
        assert!(r.explanation.contains("threshold 0.80"), "{}", r.explanation);
        Ok(())
    }

    #[tokio::test]
    async fn failure_reports_observed_similarity_and_threshold() -> anyhow::Result<()> {
        let (ev, _) = evaluator();
        let a = assertion(json!({
            "target": "output.message",
            "reference": "completely unrelated reference text",
            "threshold": 0.99
        }));
        let r = ev.evaluate(&trace("short answer"), &a).await?;
        assert_eq!(r.status, AssertionStatus::HardFail);
        assert!(r.explanation.contains("below threshold 0.99"), "{}", r.explanation);
        Ok(())
    }

    #[tokio::test]
    async fn second_evaluation_hits_cache_and_skips_provider() -> anyhow::Result<()> {
        let (ev, provider) = evaluator();
        let a = assertion(json!({
            "target": "output.message",
            "reference": "reference text"
        }));

        let first = ev.evaluate(&trace("agent output"), &a).await?;
        assert_eq!(provider.calls(), 2);

        let second = ev.evaluate(&trace("agent output"), &a).await?;
        // No additional provider calls, byte-identical score path.
        assert_eq!(provider.calls(), 2);
        assert_eq!(
            encode_vec_f32(&[first.score as f32]),
            encode_vec_f32(&[second.score as f32])
        );
        Ok(())
    }

    #[tokio::test]
    async fn dynamic_threshold_uses_default_for_local_verdict() -> anyhow::Result<()> {
        let (ev, _) = evaluator();
        let a = assertion(json!({
            "target": "output.message",
            "reference": "same text",
            "threshold": "dynamic"
        }));
        let r = ev.evaluate(&trace("same text"), &a).await?;
        assert_eq!(r.status, AssertionStatus::Pass);
        Ok(())
    }
}
