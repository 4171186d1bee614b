//! In-process dispatch tests: full request/response flow over a captured
//! wire, with fake providers standing in for the network.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use attest_core::pipeline::Pipeline;
use attest_core::providers::fake::{FakeEmbedder, FakeJudge};
use attest_core::session::Session;
use attest_core::storage::{EmbeddingCache, HistoryStore, JudgeCache, Store};
use attest_engine::server::{Engine, SharedWriter};
use attest_evaluators::JudgeOptions;

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn lines(&self) -> Vec<Value> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).expect("valid JSON on the wire"))
            .collect()
    }

    fn last(&self) -> Value {
        self.lines().last().cloned().expect("at least one message")
    }
}

struct Harness {
    engine: Arc<Engine>,
    judge: Arc<FakeJudge>,
    out: SharedWriter,
    capture: Capture,
    history: Arc<HistoryStore>,
}

fn harness(judge_scores: &[f64], soft_limit: Option<u32>) -> Harness {
    let store = Store::memory().unwrap();
    let embedding_cache = Arc::new(EmbeddingCache::new(store.clone(), 500));
    let judge_cache = Arc::new(JudgeCache::new(store.clone(), 500));
    let history = Arc::new(HistoryStore::new(store));

    let judge = Arc::new(FakeJudge::scoring(judge_scores));
    let embedder: Arc<dyn attest_core::providers::EmbeddingProvider> =
        Arc::new(FakeEmbedder::new(32));
    let judge_provider: Arc<dyn attest_core::providers::LlmProvider> = judge.clone();
    let registry = attest_evaluators::default_registry(
        Some((embedder, embedding_cache)),
        Some((judge_provider, judge_cache, JudgeOptions::default())),
    );

    let mut pipeline = Pipeline::new(Arc::new(registry)).with_history(history.clone());
    if let Some(limit) = soft_limit {
        pipeline = pipeline.with_soft_fail_limit(limit);
    }

    let engine = Arc::new(Engine::new(
        Session::new(),
        pipeline,
        history.clone(),
        vec![
            "layers_1_4".into(),
            "layers_5_6".into(),
            "embedding".into(),
            "llm_judge".into(),
            "trace_tree".into(),
            "plugins".into(),
            "continuous_eval".into(),
        ],
        1,
    ));

    let capture = Capture::default();
    let out = SharedWriter::new(Box::new(capture.clone()));
    Harness {
        engine,
        judge,
        out,
        capture,
        history,
    }
}

impl Harness {
    async fn call(&self, id: u64, method: &str, params: Value) -> Value {
        let line = json!({
            "jsonrpc": "2.0", "id": id, "method": method, "params": params
        })
        .to_string();
        self.engine.dispatch_line(&line, &self.out).await;
        self.capture.last()
    }

    async fn init(&self) {
        let resp = self
            .call(1, "initialize", json!({
                "sdk_name": "attest-python",
                "sdk_version": "0.3.0",
                "protocol_version": 1,
            }))
            .await;
        assert!(resp["result"]["compatible"].as_bool().unwrap(), "{}", resp);
    }
}

fn refund_trace() -> Value {
    json!({
        "schema_version": 2,
        "trace_id": "refund-run-1",
        "metadata": {"cost_usd": 0.0067},
        "output": {
            "message": "Your refund of $89.99 has been processed.",
            "structured": {"refund_id": "R-17"}
        },
        "steps": [
            {"type": "tool_call", "name": "lookup_order"},
            {"type": "tool_call", "name": "process_refund"}
        ]
    })
}

fn refund_batch() -> Value {
    json!([
        {"assertion_id": "a-schema", "type": "schema", "spec": {
            "target": "output.structured",
            "schema": {"type": "object", "required": ["refund_id"]}
        }},
        {"assertion_id": "a-cost", "type": "constraint", "spec": {
            "field": "metadata.cost_usd", "operator": "lte", "value": 0.01
        }},
        {"assertion_id": "a-order", "type": "trace", "spec": {
            "check": "contains_in_order", "tools": ["lookup_order", "process_refund"]
        }},
        {"assertion_id": "a-content", "type": "content", "spec": {
            "target": "output.message", "check": "contains", "value": "refund"
        }},
        {"assertion_id": "a-judge", "type": "judge", "spec": {
            "target": "output.message", "rubric": "helpfulness", "threshold": 0.7
        }}
    ])
}

#[tokio::test]
async fn full_batch_passes_and_cost_is_judge_only() {
    let h = harness(&[0.9], None);
    h.init().await;

    let resp = h
        .call(2, "evaluate_batch", json!({
            "trace": refund_trace(),
            "assertions": refund_batch(),
        }))
        .await;

    let results = resp["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 5, "{}", resp);
    for r in results {
        assert_eq!(r["status"], "pass", "{}", r);
    }
    // Deterministic layers are free; the only cost is the judge call.
    let total_cost = resp["result"]["total_cost"].as_f64().unwrap();
    assert!((total_cost - 0.001).abs() < 1e-9, "{}", total_cost);

    let resp = h.call(3, "shutdown", json!({})).await;
    assert_eq!(resp["result"]["sessions_completed"], 1);
    assert_eq!(resp["result"]["assertions_evaluated"], 5);
}

#[tokio::test]
async fn schema_violation_gates_the_judge() {
    let h = harness(&[0.9], None);
    h.init().await;

    let mut trace = refund_trace();
    trace["metadata"]["cost_usd"] = json!(0.02);
    trace["output"]["structured"] = json!({"note": "no refund id"});

    let resp = h
        .call(2, "evaluate_batch", json!({
            "trace": trace,
            "assertions": refund_batch(),
        }))
        .await;

    let results = resp["result"]["results"].as_array().unwrap();
    // All four deterministic results present, no judge entry.
    assert_eq!(results.len(), 4, "{}", resp);
    assert_eq!(results[0]["status"], "hard_fail");
    assert_eq!(results[1]["status"], "hard_fail");
    assert_eq!(results[2]["status"], "pass");
    assert_eq!(results[3]["status"], "pass");
    assert_eq!(h.judge.calls(), 0);
}

#[tokio::test]
async fn methods_before_initialize_are_session_errors() {
    let h = harness(&[], None);
    let resp = h
        .call(1, "evaluate_batch", json!({"trace": refund_trace(), "assertions": []}))
        .await;
    assert_eq!(resp["error"]["code"], 3003, "{}", resp);
    assert_eq!(resp["error"]["data"]["error_type"], "SESSION_ERROR");
    assert_eq!(resp["error"]["data"]["retryable"], false);
}

#[tokio::test]
async fn double_initialize_is_rejected() {
    let h = harness(&[], None);
    h.init().await;
    let resp = h.call(9, "initialize", json!({"protocol_version": 1})).await;
    assert_eq!(resp["error"]["code"], 3003, "{}", resp);
}

#[tokio::test]
async fn unknown_method_is_method_not_found() {
    let h = harness(&[], None);
    h.init().await;
    let resp = h.call(4, "transmogrify", json!({})).await;
    assert_eq!(resp["error"]["code"], -32601, "{}", resp);
    assert!(resp["error"]["message"]
        .as_str()
        .unwrap()
        .contains("method_not_found"));
}

#[tokio::test]
async fn invalid_trace_aborts_batch_without_partial_results() {
    let h = harness(&[], None);
    h.init().await;
    let resp = h
        .call(5, "evaluate_batch", json!({
            "trace": {"schema_version": 2, "trace_id": "", "output": {"x": 1}},
            "assertions": refund_batch(),
        }))
        .await;
    assert_eq!(resp["error"]["code"], 1001, "{}", resp);
    assert_eq!(resp["error"]["data"]["error_type"], "INVALID_TRACE");
    assert_eq!(resp["error"]["data"]["retryable"], false);
    assert!(resp["error"]["data"]["detail"]
        .as_str()
        .unwrap()
        .contains("trace_id"));
}

#[tokio::test]
async fn unknown_request_fields_and_capabilities_are_tolerated() {
    let h = harness(&[], None);
    let line = json!({
        "jsonrpc": "2.0", "id": 1, "method": "initialize",
        "params": {
            "protocol_version": 1,
            "required_capabilities": ["layers_1_4", "quantum_eval"],
            "future_field": {"nested": true}
        },
        "another_future_field": 42
    })
    .to_string();
    h.engine.dispatch_line(&line, &h.out).await;
    let resp = h.capture.last();
    assert!(resp["error"].is_null(), "{}", resp);
    assert_eq!(resp["result"]["missing"], json!(["quantum_eval"]));
    assert_eq!(resp["result"]["compatible"], false);
}

#[tokio::test]
async fn soft_fail_budget_returns_partial_results() {
    let h = harness(&[], Some(0));
    h.init().await;
    let resp = h
        .call(6, "evaluate_batch", json!({
            "trace": refund_trace(),
            "assertions": [
                {"assertion_id": "soft-1", "type": "content", "spec": {
                    "target": "output.message", "check": "contains",
                    "value": "chargeback", "soft": true
                }}
            ],
        }))
        .await;
    assert_eq!(resp["error"]["code"], 1002, "{}", resp);
    let partial = resp["error"]["data"]["partial_results"].as_array().unwrap();
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0]["status"], "soft_fail");
}

#[tokio::test]
async fn drift_alert_is_emitted_as_notification_without_id() {
    let h = harness(&[], None);
    h.init().await;

    // Stable history around 0.9, then a collapse to 0.1.
    for _ in 0..20 {
        h.history
            .insert("seed", "drifty", "content", 0.9, "pass")
            .unwrap();
    }

    let resp = h
        .call(7, "evaluate_batch", json!({
            "trace": refund_trace(),
            "assertions": [
                {"assertion_id": "drifty", "type": "content", "spec": {
                    "target": "output.message", "check": "keyword_all",
                    "values": ["refund", "unicorn", "dragon", "wyvern", "griffin",
                               "kraken", "phoenix", "basilisk", "hydra", "sphinx"],
                    "threshold": "dynamic", "soft": true
                }}
            ],
        }))
        .await;

    let results = resp["result"]["results"].as_array().unwrap();
    assert_eq!(results[0]["status"], "hard_fail", "{}", resp);

    let lines = h.capture.lines();
    let notification = lines
        .iter()
        .find(|l| l["method"] == "drift_alert")
        .expect("drift_alert notification on the wire");
    assert!(notification.get("id").is_none(), "{}", notification);
    assert_eq!(notification["params"]["status"], "drift_detected");
    assert_eq!(notification["params"]["assertion_id"], "drifty");
    assert!(notification["params"]["mean"].as_f64().unwrap() > 0.8);
}

#[tokio::test]
async fn validate_trace_tree_reports_structure_and_aggregates() {
    let h = harness(&[], None);
    h.init().await;
    let resp = h
        .call(8, "validate_trace_tree", json!({
            "trace": {
                "schema_version": 2,
                "trace_id": "root",
                "agent_id": "planner",
                "metadata": {"cost_usd": 0.01, "total_tokens": 100},
                "output": {"ok": true},
                "steps": [
                    {"type": "agent_call", "name": "delegate", "sub_trace": {
                        "schema_version": 2,
                        "trace_id": "child",
                        "agent_id": "worker",
                        "metadata": {"cost_usd": 0.005, "total_tokens": 40},
                        "output": {"ok": true}
                    }}
                ]
            }
        }))
        .await;
    let result = &resp["result"];
    assert_eq!(result["valid"], true, "{}", resp);
    assert_eq!(result["depth"], 1);
    assert_eq!(result["agent_count"], 2);
    assert_eq!(result["agent_ids"], json!(["planner", "worker"]));
    assert!((result["aggregate_cost_usd"].as_f64().unwrap() - 0.015).abs() < 1e-9);
    assert_eq!(result["aggregate_tokens"], 140);
}

#[tokio::test]
async fn query_drift_matches_recorded_history() {
    let h = harness(&[], None);
    h.init().await;
    for score in [0.6, 0.8, 1.0] {
        h.history.insert("t", "a1", "judge", score, "pass").unwrap();
    }
    // Below the minimum run count: explicitly inconclusive.
    let resp = h.call(9, "query_drift", json!({"assertion_id": "a1"})).await;
    assert_eq!(resp["result"]["status"], "insufficient_data", "{}", resp);
    assert_eq!(resp["result"]["count"], 3);

    for _ in 0..12 {
        h.history.insert("t", "a2", "judge", 0.9, "pass").unwrap();
    }
    let resp = h.call(10, "query_drift", json!({"assertion_id": "a2"})).await;
    assert_eq!(resp["result"]["status"], "ok", "{}", resp);
    assert!((resp["result"]["mean"].as_f64().unwrap() - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn submit_plugin_result_counts_assertions() {
    let h = harness(&[], None);
    h.init().await;
    let resp = h
        .call(11, "submit_plugin_result", json!({
            "trace_id": "t1",
            "plugin_name": "custom-latency-check",
            "assertion_id": "plugin-1",
            "result": {"status": "pass", "score": 1.0}
        }))
        .await;
    assert_eq!(resp["result"]["accepted"], true, "{}", resp);

    let resp = h.call(12, "shutdown", json!({})).await;
    assert_eq!(resp["result"]["assertions_evaluated"], 1);
}
