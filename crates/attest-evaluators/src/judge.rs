//! Layer 6: LLM-as-judge with verdict caching, deadline-bound provider
//! calls, and an optional three-run meta-evaluation mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use attest_core::assertion::{Assertion, AssertionResult, AssertionStatus};
use attest_core::error::EngineError;
use attest_core::evaluator::Evaluator;
use attest_core::providers::{Completion, CompletionRequest, LlmProvider};
use attest_core::resolve;
use attest_core::rubric::{self, OUTPUT_END, OUTPUT_START};
use attest_core::storage::{JudgeCache, JudgeVerdict};
use attest_core::trace::Trace;

use crate::embedding::numeric_threshold;

pub const DEFAULT_THRESHOLD: f64 = 0.8;
/// Requested thresholds below this floor are clamped up; a judge cannot
/// meaningfully certify quality below it.
pub const MIN_THRESHOLD: f64 = 0.5;
pub const META_EVAL_RUNS: usize = 3;
pub const META_EVAL_TEMPERATURE: f32 = 0.3;
pub const HIGH_VARIANCE_SPREAD: f64 = 0.2;
const MAX_COMPLETION_TOKENS: u32 = 512;

#[derive(Debug, Clone)]
pub struct JudgeOptions {
    pub timeout: Duration,
    /// Global meta-eval switch (`ATTEST_JUDGE_META_EVAL`); individual specs
    /// can also opt in.
    pub meta_eval: bool,
}

impl Default for JudgeOptions {
    fn default() -> Self {
        Self {
            timeout: crate::DEFAULT_JUDGE_TIMEOUT,
            meta_eval: false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JudgeSpec {
    target: String,
    #[serde(default)]
    criteria: Option<String>,
    #[serde(default = "default_rubric")]
    rubric: String,
    #[serde(default)]
    threshold: Option<serde_json::Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    soft: bool,
    #[serde(default)]
    meta_eval: bool,
}

fn default_rubric() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
struct ScorePayload {
    score: f64,
    explanation: String,
}

/// Extracts the outermost JSON object from a judge response: everything
/// from the first `{` to the last `}`. Any JSON embedded inside the agent
/// output (or inside the explanation string) cannot form the outermost
/// object, which is what defeats nested-JSON injection.
pub fn parse_score_result(text: &str) -> anyhow::Result<(f64, String)> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow::anyhow!("judge response contains no JSON object"))?;
    let end = text
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| anyhow::anyhow!("judge response contains no closed JSON object"))?;
    let payload: ScorePayload = serde_json::from_str(&text[start..=end])
        .map_err(|e| anyhow::anyhow!("judge response is not a score object: {}", e))?;
    Ok((payload.score.clamp(0.0, 1.0), payload.explanation))
}

pub struct JudgeEvaluator {
    provider: Arc<dyn LlmProvider>,
    cache: Arc<JudgeCache>,
    options: JudgeOptions,
}

impl JudgeEvaluator {
    pub fn new(provider: Arc<dyn LlmProvider>, cache: Arc<JudgeCache>, options: JudgeOptions) -> Self {
        Self {
            provider,
            cache,
            options,
        }
    }

    fn build_request(&self, spec: &JudgeSpec, model: &str, judged: &str, temperature: f32) -> anyhow::Result<CompletionRequest> {
        let rubric = rubric::get(&spec.rubric)
            .ok_or_else(|| anyhow::anyhow!("unknown rubric '{}'", spec.rubric))?;
        let mut user = String::new();
        if let Some(criteria) = &spec.criteria {
            user.push_str("Evaluation criteria:\n");
            user.push_str(criteria);
            user.push_str("\n\n");
        }
        user.push_str(OUTPUT_START);
        user.push('\n');
        user.push_str(judged);
        user.push('\n');
        user.push_str(OUTPUT_END);
        Ok(CompletionRequest {
            system: rubric.system_prompt,
            user,
            model: model.to_string(),
            temperature,
            max_tokens: MAX_COMPLETION_TOKENS,
        })
    }

    /// One provider call under the configured deadline. Expiry maps to the
    /// retryable TIMEOUT family.
    async fn call_once(
        provider: Arc<dyn LlmProvider>,
        request: CompletionRequest,
        timeout: Duration,
    ) -> anyhow::Result<Completion> {
        match tokio::time::timeout(timeout, provider.complete(&request)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::timeout(format!(
                "judge call exceeded the {}s deadline",
                timeout.as_secs()
            ))
            .into()),
        }
    }

    async fn single_eval(
        &self,
        spec: &JudgeSpec,
        model: &str,
        judged: &str,
    ) -> anyhow::Result<(JudgeVerdict, f64)> {
        let request = self.build_request(spec, model, judged, 0.0)?;
        let completion =
            Self::call_once(self.provider.clone(), request, self.options.timeout).await?;
        let (score, explanation) = parse_score_result(&completion.text)?;
        Ok((JudgeVerdict { score, explanation }, completion.cost_usd))
    }

    /// Three concurrent runs at a fixed non-zero temperature; the median of
    /// the successful scores wins. Fewer than one success fails the
    /// assertion with the first error.
    async fn meta_eval(
        &self,
        spec: &JudgeSpec,
        model: &str,
        judged: &str,
    ) -> anyhow::Result<(JudgeVerdict, f64)> {
        let mut handles = Vec::with_capacity(META_EVAL_RUNS);
        for _ in 0..META_EVAL_RUNS {
            let request = self.build_request(spec, model, judged, META_EVAL_TEMPERATURE)?;
            let provider = self.provider.clone();
            let timeout = self.options.timeout;
            handles.push(tokio::spawn(async move {
                let completion = Self::call_once(provider, request, timeout).await?;
                let (score, explanation) = parse_score_result(&completion.text)?;
                Ok::<_, anyhow::Error>((score, explanation, completion.cost_usd))
            }));
        }

        let mut runs: Vec<Result<(f64, String, f64), anyhow::Error>> = Vec::new();
        for handle in handles {
            runs.push(match handle.await {
                Ok(r) => r,
                Err(e) => Err(anyhow::anyhow!("judge task failed: {}", e)),
            });
        }

        let mut scores: Vec<f64> = Vec::new();
        let mut total_cost = 0.0;
        let mut lines = Vec::with_capacity(META_EVAL_RUNS);
        let mut first_error: Option<String> = None;
        for (i, run) in runs.iter().enumerate() {
            match run {
                Ok((score, explanation, cost)) => {
                    scores.push(*score);
                    total_cost += cost;
                    lines.push(format!("Run {}: score {:.2} - {}", i + 1, score, explanation));
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.to_string());
                    }
                    lines.push(format!("Run {}: error - {}", i + 1, e));
                }
            }
        }

        if scores.is_empty() {
            anyhow::bail!(
                "meta-eval: all judge runs failed; first error: {}",
                first_error.unwrap_or_else(|| "unknown".to_string())
            );
        }

        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if scores.len() % 2 == 1 {
            scores[scores.len() / 2]
        } else {
            let mid = scores.len() / 2;
            (scores[mid - 1] + scores[mid]) / 2.0
        };

        lines.push("Median selected.".to_string());
        let spread = scores[scores.len() - 1] - scores[0];
        if spread > HIGH_VARIANCE_SPREAD {
            lines.push(format!("HIGH VARIANCE: score spread {:.2}", spread));
        }

        Ok((
            JudgeVerdict {
                score: median,
                explanation: lines.join("\n"),
            },
            total_cost,
        ))
    }
}

#[async_trait]
impl Evaluator for JudgeEvaluator {
    fn assertion_type(&self) -> &'static str {
        "judge"
    }

    async fn evaluate(
        &self,
        trace: &Trace,
        assertion: &Assertion,
    ) -> anyhow::Result<AssertionResult> {
        let spec: JudgeSpec = serde_json::from_value(assertion.spec.clone())
            .map_err(|e| anyhow::anyhow!("invalid judge spec: {}", e))?;
        if rubric::get(&spec.rubric).is_none() {
            anyhow::bail!(
                "unknown rubric '{}' (available: {})",
                spec.rubric,
                rubric::names().join(", ")
            );
        }
        let threshold =
            numeric_threshold(spec.threshold.as_ref(), DEFAULT_THRESHOLD).max(MIN_THRESHOLD);
        let model = spec
            .model
            .clone()
            .unwrap_or_else(|| self.provider.default_model());

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
        let judged = resolved.text;

        // Cache hits bypass both the provider and the meta-eval path.
        let (verdict, cost) = match self.cache.get(&judged, &spec.rubric, &model) {
            Ok(Some(hit)) => (hit, 0.0),
            Ok(None) | Err(_) => {
                let (verdict, cost) = if spec.meta_eval || self.options.meta_eval {
                    self.meta_eval(&spec, &model, &judged).await?
                } else {
                    self.single_eval(&spec, &model, &judged).await?
                };
                if let Err(e) = self.cache.put(&judged, &spec.rubric, &model, &verdict) {
                    tracing::warn!(event = "judge_cache_write_failed", error = %e);
                }
                (verdict, cost)
            }
        };

        let result = if verdict.score >= threshold {
            AssertionResult::new(
                &assertion.assertion_id,
                AssertionStatus::Pass,
                verdict.score,
                format!(
                    "judge score {:.2} meets threshold {:.2} ({}): {}",
                    verdict.score, threshold, spec.rubric, verdict.explanation
                ),
            )
        } else {
            AssertionResult::fail(
                &assertion.assertion_id,
                spec.soft,
                verdict.score,
                format!(
                    "judge score {:.2} below threshold {:.2} ({}): {}",
                    verdict.score, threshold, spec.rubric, verdict.explanation
                ),
            )
        };
        Ok(result.with_cost(cost))
    }
}
