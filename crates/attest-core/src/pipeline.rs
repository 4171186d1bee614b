//! Layered batch evaluation: deterministic layers run first and in order,
//! provider-backed layers fan out concurrently behind a hard-fail gate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::assertion::{
    layer_of, Assertion, AssertionResult, AssertionStatus, LAYER_GATE_BOUNDARY,
    MAX_ASSERTION_ID_LEN,
};
use crate::error::EngineError;
use crate::evaluator::EvaluatorRegistry;
use crate::storage::HistoryStore;
use crate::trace::Trace;

/// Dynamic-threshold calibration: look back this many scores, require this
/// many before trusting the statistics, and pass anything within
/// `mean - FACTOR * stddev`.
pub const DYNAMIC_WINDOW: u32 = 50;
pub const DYNAMIC_MIN_RUNS: usize = 10;
pub const DYNAMIC_STDDEV_FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Serialize)]
pub struct DriftAlert {
    pub assertion_id: String,
    pub mean: f64,
    pub stddev: f64,
    pub count: u64,
    pub latest_score: f64,
    pub deviation: f64,
    pub status: &'static str,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<AssertionResult>,
    pub total_cost: f64,
    pub total_duration_ms: u64,
    pub drift_alerts: Vec<DriftAlert>,
}

/// Soft-fail budget exhaustion. Carries everything evaluated up to and
/// including the soft_fail that crossed the limit.
#[derive(Debug)]
pub struct BudgetExceededError {
    pub limit: u32,
    pub partial: Vec<AssertionResult>,
}

impl std::fmt::Display for BudgetExceededError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "soft-fail budget of {} exceeded after {} results",
            self.limit,
            self.partial.len()
        )
    }
}

impl std::error::Error for BudgetExceededError {}

pub type DriftSink<'a> = &'a (dyn Fn(&DriftAlert) + Send + Sync);

pub struct Pipeline {
    registry: Arc<EvaluatorRegistry>,
    history: Option<Arc<HistoryStore>>,
    soft_fail_limit: Option<u32>,
    idempotent: Mutex<HashMap<String, AssertionResult>>,
}

impl Pipeline {
    pub fn new(registry: Arc<EvaluatorRegistry>) -> Self {
        Self {
            registry,
            history: None,
            soft_fail_limit: None,
            idempotent: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn with_soft_fail_limit(mut self, limit: u32) -> Self {
        self.soft_fail_limit = Some(limit);
        self
    }

    pub fn history(&self) -> Option<&Arc<HistoryStore>> {
        self.history.as_ref()
    }

    /// Evaluates a batch. Results come back in stable layer order regardless
    /// of how the concurrent layer-5/6 tasks complete.
    pub async fn run(
        &self,
        trace: Arc<Trace>,
        assertions: &[Assertion],
        on_drift: Option<DriftSink<'_>>,
    ) -> Result<BatchOutcome, BudgetExceededError> {
        let started = Instant::now();

        let mut order: Vec<usize> = (0..assertions.len()).collect();
        order.sort_by_key(|&i| layer_of(&assertions[i].kind));
        let sorted: Vec<Assertion> = order.iter().map(|&i| assertions[i].clone()).collect();
        let split = sorted
            .iter()
            .position(|a| layer_of(&a.kind) > LAYER_GATE_BOUNDARY)
            .unwrap_or(sorted.len());
        let (deterministic, expensive) = sorted.split_at(split);

        let kind_by_id: HashMap<String, String> = sorted
            .iter()
            .map(|a| (a.assertion_id.clone(), a.kind.clone()))
            .collect();

        let mut results: Vec<AssertionResult> = Vec::with_capacity(sorted.len());
        let mut drift_alerts = Vec::new();
        let mut soft_fails = 0u32;
        let mut total_cost = 0.0;
        let mut hard_fail_seen = false;

        // Phase 1: every deterministic assertion runs, in order, even after
        // a hard failure.
        for assertion in deterministic {
            let (result, replayed) = match self.replay(assertion) {
                Some(cached) => (cached, true),
                None => (
                    evaluate_assertion(&self.registry, &trace, assertion).await,
                    false,
                ),
            };
            let result = self.finish_result(
                assertion,
                result,
                replayed,
                &mut total_cost,
                &mut drift_alerts,
                on_drift,
            );
            hard_fail_seen = hard_fail_seen || result.status == AssertionStatus::HardFail;
            if let Err(e) = self.charge_budget(&result, &mut soft_fails, &mut results) {
                return Err(e);
            }
        }

        // Gate: a deterministic hard failure makes the expensive layers moot.
        if !hard_fail_seen && !expensive.is_empty() {
            let mut handles = Vec::with_capacity(expensive.len());
            for assertion in expensive {
                if let Some(cached) = self.replay(assertion) {
                    handles.push(Task::Cached(cached));
                    continue;
                }
                let registry = self.registry.clone();
                let trace = trace.clone();
                let assertion = assertion.clone();
                handles.push(Task::Running(tokio::spawn(async move {
                    evaluate_assertion(&registry, &trace, &assertion).await
                })));
            }

            // Merge in spawn order so completion order cannot reorder the
            // batch.
            for (assertion, task) in expensive.iter().zip(handles) {
                let (result, replayed) = match task {
                    Task::Cached(cached) => (cached, true),
                    Task::Running(handle) => match handle.await {
                        Ok(r) => (r, false),
                        Err(e) => (
                            AssertionResult::hard_fail(
                                &assertion.assertion_id,
                                format!("evaluator task failed: {}", e),
                            ),
                            false,
                        ),
                    },
                };
                let result = self.finish_result(
                    assertion,
                    result,
                    replayed,
                    &mut total_cost,
                    &mut drift_alerts,
                    on_drift,
                );
                if let Err(e) = self.charge_budget(&result, &mut soft_fails, &mut results) {
                    return Err(e);
                }
            }
        }

        self.write_history(&trace, &results, &kind_by_id);
        self.remember(&results);

        Ok(BatchOutcome {
            results,
            total_cost,
            total_duration_ms: started.elapsed().as_millis() as u64,
            drift_alerts,
        })
    }

    /// Idempotency replay: a request_id seen before returns its recorded
    /// result without re-evaluating.
    fn replay(&self, assertion: &Assertion) -> Option<AssertionResult> {
        let request_id = assertion.request_id.as_deref()?;
        self.idempotent.lock().unwrap().get(request_id).cloned()
    }

    fn remember(&self, results: &[AssertionResult]) {
        let mut map = self.idempotent.lock().unwrap();
        for result in results {
            if let Some(rid) = &result.request_id {
                map.entry(rid.clone()).or_insert_with(|| result.clone());
            }
        }
    }

    fn finish_result(
        &self,
        assertion: &Assertion,
        mut result: AssertionResult,
        replayed: bool,
        total_cost: &mut f64,
        drift_alerts: &mut Vec<DriftAlert>,
        on_drift: Option<DriftSink<'_>>,
    ) -> AssertionResult {
        if !replayed {
            *total_cost += result.cost;
            if assertion.wants_dynamic_threshold() {
                if let Some(alert) = self.reclassify_dynamic(assertion, &mut result) {
                    if let Some(sink) = on_drift {
                        sink(&alert);
                    }
                    drift_alerts.push(alert);
                }
            }
        }
        result
    }

    fn charge_budget(
        &self,
        result: &AssertionResult,
        soft_fails: &mut u32,
        results: &mut Vec<AssertionResult>,
    ) -> Result<(), BudgetExceededError> {
        results.push(result.clone());
        if result.status != AssertionStatus::SoftFail {
            return Ok(());
        }
        *soft_fails += 1;
        match self.soft_fail_limit {
            Some(limit) if *soft_fails > limit => Err(BudgetExceededError {
                limit,
                partial: std::mem::take(results),
            }),
            _ => Ok(()),
        }
    }

    /// Replaces the evaluator's verdict with a history-calibrated one once
    /// enough samples exist. Returns a drift alert when the calibrated
    /// verdict is a hard failure.
    fn reclassify_dynamic(
        &self,
        assertion: &Assertion,
        result: &mut AssertionResult,
    ) -> Option<DriftAlert> {
        let history = self.history.as_ref()?;
        let window = match history.query_window(&assertion.assertion_id, DYNAMIC_WINDOW) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(event = "dynamic_threshold_query_failed", error = %e);
                return None;
            }
        };
        if window.len() < DYNAMIC_MIN_RUNS {
            return None;
        }

        let count = window.len() as f64;
        let mean = window.iter().sum::<f64>() / count;
        let variance =
            (window.iter().map(|s| s * s).sum::<f64>() / count - mean * mean).max(0.0);
        let stddev = variance.sqrt();
        let floor = mean - DYNAMIC_STDDEV_FACTOR * stddev;

        if result.score >= floor {
            result.status = AssertionStatus::Pass;
            result.explanation = format!(
                "{} [dynamic: score {:.3} within floor {:.3} (mean {:.3}, stddev {:.3}, n={})]",
                result.explanation,
                result.score,
                floor,
                mean,
                stddev,
                window.len()
            );
            None
        } else {
            result.status = AssertionStatus::HardFail;
            result.explanation = format!(
                "{} [dynamic: score {:.3} below floor {:.3} (mean {:.3}, stddev {:.3}, n={})]",
                result.explanation,
                result.score,
                floor,
                mean,
                stddev,
                window.len()
            );
            Some(DriftAlert {
                assertion_id: assertion.assertion_id.clone(),
                mean,
                stddev,
                count: window.len() as u64,
                latest_score: result.score,
                deviation: result.score - mean,
                status: "drift_detected",
            })
        }
    }

    /// Records the batch to history. Failures are logged and swallowed;
    /// evaluation results were already produced.
    fn write_history(
        &self,
        trace: &Trace,
        results: &[AssertionResult],
        kind_by_id: &HashMap<String, String>,
    ) {
        let Some(history) = &self.history else {
            return;
        };
        for result in results {
            let kind = kind_by_id
                .get(&result.assertion_id)
                .map(String::as_str)
                .unwrap_or("unknown");
            if let Err(e) = history.insert(
                &trace.trace_id,
                &result.assertion_id,
                kind,
                result.score,
                result.status.as_str(),
            ) {
                tracing::warn!(event = "history_write_failed", error = %e);
            }
        }
    }
}

/// Checks batch-level assertion invariants before evaluation: bounded,
/// unique assertion ids.
pub fn validate_batch(assertions: &[Assertion]) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for a in assertions {
        if a.assertion_id.is_empty() {
            return Err(EngineError::assertion("assertion_id is empty"));
        }
        if a.assertion_id.len() > MAX_ASSERTION_ID_LEN {
            let head: String = a.assertion_id.chars().take(32).collect();
            return Err(EngineError::assertion(format!(
                "assertion_id '{}...' is {} bytes; the limit is {}",
                head,
                a.assertion_id.len(),
                MAX_ASSERTION_ID_LEN
            )));
        }
        if !seen.insert(a.assertion_id.as_str()) {
            return Err(EngineError::assertion(format!(
                "duplicate assertion_id '{}' in batch",
                a.assertion_id
            )));
        }
    }
    Ok(())
}

async fn evaluate_assertion(
    registry: &EvaluatorRegistry,
    trace: &Trace,
    assertion: &Assertion,
) -> AssertionResult {
    let started = Instant::now();
    let mut result = match registry.get(&assertion.kind) {
        None => AssertionResult::hard_fail(
            &assertion.assertion_id,
            format!("unknown assertion type '{}'", assertion.kind),
        ),
        Some(evaluator) => match evaluator.evaluate(trace, assertion).await {
            Ok(r) => r,
            Err(e) => AssertionResult::hard_fail(
                &assertion.assertion_id,
                format!("evaluation failed: {:#}", e),
            ),
        },
    };
    result.duration_ms = started.elapsed().as_millis() as u64;
    result.request_id = assertion.request_id.clone();
    result
}

enum Task {
    Cached(AssertionResult),
    Running(tokio::task::JoinHandle<AssertionResult>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::Evaluator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubEvaluator {
        kind: &'static str,
        status: AssertionStatus,
        score: f64,
        cost: f64,
        delay_ms: u64,
        calls: AtomicU64,
    }

    impl StubEvaluator {
        fn new(kind: &'static str, status: AssertionStatus, score: f64) -> Arc<Self> {
            Arc::new(Self {
                kind,
                status,
                score,
                cost: 0.0,
                delay_ms: 0,
                calls: AtomicU64::new(0),
            })
        }

        fn slow(kind: &'static str, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                kind,
                status: AssertionStatus::Pass,
                score: 1.0,
                cost: 0.002,
                delay_ms,
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl Evaluator for StubEvaluator {
        fn assertion_type(&self) -> &'static str {
            self.kind
        }

        async fn evaluate(
            &self,
            _trace: &Trace,
            assertion: &Assertion,
        ) -> anyhow::Result<AssertionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            Ok(AssertionResult::new(
                &assertion.assertion_id,
                self.status,
                self.score,
                "stub".into(),
            )
            .with_cost(self.cost))
        }
    }

    fn trace() -> Arc<Trace> {
        Arc::new(
            serde_json::from_value(serde_json::json!({
                "schema_version": 2,
                "trace_id": "t1",
                "output": {"message": "ok"}
            }))
            .unwrap(),
        )
    }

    fn assertion(id: &str, kind: &str) -> Assertion {
        Assertion {
            assertion_id: id.into(),
            kind: kind.into(),
            spec: serde_json::json!({}),
            request_id: None,
        }
    }

    fn registry(evaluators: Vec<Arc<dyn Evaluator>>) -> Arc<EvaluatorRegistry> {
        let mut r = EvaluatorRegistry::new();
        for e in evaluators {
            r.register(e);
        }
        Arc::new(r)
    }

    #[tokio::test]
    async fn results_follow_stable_layer_order() {
        let reg = registry(vec![
            StubEvaluator::new("schema", AssertionStatus::Pass, 1.0),
            StubEvaluator::new("trace", AssertionStatus::Pass, 1.0),
            StubEvaluator::new("content", AssertionStatus::Pass, 1.0),
            StubEvaluator::slow("embedding", 50),
            StubEvaluator::slow("judge", 1),
        ]);
        let pipeline = Pipeline::new(reg);

        // Deliberately shuffled input; judge finishes before embedding.
        let batch = vec![
            assertion("j", "judge"),
            assertion("c", "content"),
            assertion("s", "schema"),
            assertion("e", "embedding"),
            assertion("t", "trace"),
        ];
        let outcome = pipeline.run(trace(), &batch, None).await.unwrap();
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.assertion_id.as_str()).collect();
        assert_eq!(ids, vec!["s", "t", "c", "e", "j"]);
    }

    #[tokio::test]
    async fn deterministic_hard_fail_gates_expensive_layers() {
        let judge = StubEvaluator::slow("judge", 1);
        let reg = registry(vec![
            StubEvaluator::new("schema", AssertionStatus::HardFail, 0.0),
            StubEvaluator::new("content", AssertionStatus::Pass, 1.0),
            judge.clone(),
        ]);
        let pipeline = Pipeline::new(reg);
        let batch = vec![
            assertion("s", "schema"),
            assertion("c", "content"),
            assertion("j", "judge"),
        ];
        let outcome = pipeline.run(trace(), &batch, None).await.unwrap();
        // Every deterministic result is present; the judge never ran.
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_assertion_type_is_synthesized_hard_fail() {
        let pipeline = Pipeline::new(registry(vec![]));
        let batch = vec![assertion("x", "telepathy")];
        let outcome = pipeline.run(trace(), &batch, None).await.unwrap();
        assert_eq!(outcome.results[0].status, AssertionStatus::HardFail);
        assert!(outcome.results[0]
            .explanation
            .contains("unknown assertion type 'telepathy'"));
    }

    #[tokio::test]
    async fn soft_fail_budget_aborts_with_partial() {
        let reg = registry(vec![StubEvaluator::new(
            "content",
            AssertionStatus::SoftFail,
            0.4,
        )]);
        let pipeline = Pipeline::new(reg).with_soft_fail_limit(1);
        let batch = vec![
            assertion("a", "content"),
            assertion("b", "content"),
            assertion("c", "content"),
        ];
        let err = pipeline.run(trace(), &batch, None).await.unwrap_err();
        assert_eq!(err.limit, 1);
        assert_eq!(err.partial.len(), 2);
    }

    #[tokio::test]
    async fn hard_fails_do_not_consume_budget() {
        let reg = registry(vec![
            StubEvaluator::new("schema", AssertionStatus::HardFail, 0.0),
            StubEvaluator::new("content", AssertionStatus::Pass, 1.0),
        ]);
        let pipeline = Pipeline::new(reg).with_soft_fail_limit(0);
        let batch = vec![assertion("s", "schema"), assertion("c", "content")];
        assert!(pipeline.run(trace(), &batch, None).await.is_ok());
    }

    #[tokio::test]
    async fn idempotent_request_ids_replay_without_reevaluation() {
        let content = StubEvaluator::new("content", AssertionStatus::Pass, 1.0);
        let reg = registry(vec![content.clone()]);
        let pipeline = Pipeline::new(reg);

        let mut a = assertion("a", "content");
        a.request_id = Some("req-1".into());

        pipeline.run(trace(), &[a.clone()], None).await.unwrap();
        let outcome = pipeline.run(trace(), &[a], None).await.unwrap();

        assert_eq!(content.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.results[0].request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn dynamic_threshold_reclassifies_and_alerts() {
        let history = Arc::new(HistoryStore::new(crate::storage::Store::memory().unwrap()));
        for _ in 0..20 {
            history.insert("t", "drifty", "judge", 0.9, "pass").unwrap();
        }

        let reg = registry(vec![StubEvaluator::new(
            "content",
            AssertionStatus::Pass,
            0.2,
        )]);
        let pipeline = Pipeline::new(reg).with_history(history.clone());

        let mut a = assertion("drifty", "content");
        a.spec = serde_json::json!({"threshold": "dynamic"});

        let outcome = pipeline.run(trace(), &[a], None).await.unwrap();
        assert_eq!(outcome.results[0].status, AssertionStatus::HardFail);
        assert_eq!(outcome.drift_alerts.len(), 1);
        let alert = &outcome.drift_alerts[0];
        assert_eq!(alert.status, "drift_detected");
        assert!((alert.mean - 0.9).abs() < 1e-9);
        assert!(alert.deviation < 0.0);
    }

    #[tokio::test]
    async fn dynamic_threshold_needs_min_runs() {
        let history = Arc::new(HistoryStore::new(crate::storage::Store::memory().unwrap()));
        for _ in 0..5 {
            history.insert("t", "young", "judge", 0.9, "pass").unwrap();
        }
        let reg = registry(vec![StubEvaluator::new(
            "content",
            AssertionStatus::SoftFail,
            0.1,
        )]);
        let pipeline = Pipeline::new(reg).with_history(history);
        let mut a = assertion("young", "content");
        a.spec = serde_json::json!({"threshold": "dynamic"});
        let outcome = pipeline.run(trace(), &[a], None).await.unwrap();
        // Too little history: the evaluator's own verdict stands.
        assert_eq!(outcome.results[0].status, AssertionStatus::SoftFail);
        assert!(outcome.drift_alerts.is_empty());
    }

    #[tokio::test]
    async fn history_receives_every_result() {
        let history = Arc::new(HistoryStore::new(crate::storage::Store::memory().unwrap()));
        let reg = registry(vec![StubEvaluator::new(
            "content",
            AssertionStatus::Pass,
            0.7,
        )]);
        let pipeline = Pipeline::new(reg).with_history(history.clone());
        pipeline
            .run(trace(), &[assertion("h1", "content")], None)
            .await
            .unwrap();
        assert_eq!(history.query_window("h1", 10).unwrap(), vec![0.7]);
    }

    #[test]
    fn batch_validation_rejects_duplicates_and_long_ids() {
        let ok = vec![assertion("a", "content"), assertion("b", "content")];
        assert!(validate_batch(&ok).is_ok());

        let dup = vec![assertion("a", "content"), assertion("a", "content")];
        assert!(validate_batch(&dup).is_err());

        let long = vec![assertion(&"x".repeat(MAX_ASSERTION_ID_LEN + 1), "content")];
        assert!(validate_batch(&long).is_err());
    }
}
