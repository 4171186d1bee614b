use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use attest_core::assertion::Assertion;
use attest_core::error::{EngineError, ErrorKind};
use attest_core::pipeline::{self, DriftAlert};
use attest_core::session::{PROTOCOL_VERSION_CURRENT, PROTOCOL_VERSION_MIN};
use attest_core::trace::validate::{MAX_STEPS, MAX_TRACE_BYTES};
use attest_core::trace::{tree, validate, Trace};

use crate::server::{Engine, JsonRpcError, JsonRpcRequest, SharedWriter};

fn rpc_err(e: EngineError) -> JsonRpcError {
    JsonRpcError {
        code: e.kind.code(),
        message: e.kind.as_str().to_string(),
        data: Some(e.rpc_data()),
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(
    req: &JsonRpcRequest,
    kind: ErrorKind,
    detail: &str,
) -> Result<T, JsonRpcError> {
    let params = req.params.clone().unwrap_or_else(|| json!({}));
    serde_json::from_value(params)
        .map_err(|e| rpc_err(EngineError::new(kind, format!("{}: {}", detail, e))))
}

pub async fn route(
    engine: &Engine,
    req: &JsonRpcRequest,
    out: &SharedWriter,
) -> Result<Value, JsonRpcError> {
    match req.method.as_str() {
        "initialize" => initialize(engine, req),
        "evaluate_batch" => evaluate_batch(engine, req, out).await,
        "submit_plugin_result" => submit_plugin_result(engine, req),
        "validate_trace_tree" => validate_trace_tree(engine, req),
        "query_drift" => query_drift(engine, req),
        "shutdown" => shutdown(engine),
        other => Err(JsonRpcError {
            code: -32601,
            message: format!("method_not_found: {}", other),
            data: None,
        }),
    }
}

#[derive(Debug, Default, Deserialize)]
struct InitializeParams {
    #[serde(default)]
    sdk_name: String,
    #[serde(default)]
    sdk_version: String,
    #[serde(default)]
    protocol_version: Option<u32>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    #[allow(dead_code)]
    preferred_encoding: Option<String>,
}

fn initialize(engine: &Engine, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
    let params: InitializeParams = parse_params(req, ErrorKind::SessionError, "invalid initialize params")?;
    let protocol_version = params.protocol_version.unwrap_or(PROTOCOL_VERSION_CURRENT);
    engine.session.initialize(protocol_version).map_err(rpc_err)?;

    // Unknown capability strings are tolerated; they simply come back as
    // missing.
    let missing: Vec<&String> = params
        .required_capabilities
        .iter()
        .filter(|c| !engine.capabilities.contains(c))
        .collect();

    tracing::info!(
        event = "session_initialized",
        sdk_name = %params.sdk_name,
        sdk_version = %params.sdk_version,
        protocol_version = protocol_version,
    );

    Ok(json!({
        "engine_version": env!("CARGO_PKG_VERSION"),
        "protocol_version": protocol_version,
        "supported_protocol_versions": [PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_CURRENT],
        "capabilities": engine.capabilities,
        "missing": missing,
        "compatible": missing.is_empty(),
        "encoding": "json",
        "limits": {
            "max_trace_bytes": MAX_TRACE_BYTES,
            "max_steps": MAX_STEPS,
            "max_concurrent": engine.max_concurrent,
        },
    }))
}

#[derive(Debug, Deserialize)]
struct EvaluateBatchParams {
    trace: Value,
    #[serde(default)]
    assertions: Vec<Assertion>,
}

async fn evaluate_batch(
    engine: &Engine,
    req: &JsonRpcRequest,
    out: &SharedWriter,
) -> Result<Value, JsonRpcError> {
    engine
        .session
        .require_initialized("evaluate_batch")
        .map_err(rpc_err)?;
    let params: EvaluateBatchParams = parse_params(req, ErrorKind::AssertionError, "invalid evaluate_batch params")?;

    let mut trace: Trace = serde_json::from_value(params.trace)
        .map_err(|e| rpc_err(EngineError::invalid_trace(format!("trace does not decode: {}", e))))?;
    validate::normalize(&mut trace);
    validate::validate(&trace).map_err(rpc_err)?;
    pipeline::validate_batch(&params.assertions).map_err(rpc_err)?;

    let sink = |alert: &DriftAlert| {
        match serde_json::to_value(alert) {
            Ok(params) => out.write_notification("drift_alert", params),
            Err(e) => tracing::warn!(event = "drift_alert_encode_failed", error = %e),
        }
    };

    let outcome = engine
        .pipeline
        .run(Arc::new(trace), &params.assertions, Some(&sink))
        .await
        .map_err(|budget| {
            let e = EngineError::assertion(budget.to_string());
            let mut data = e.rpc_data();
            data["partial_results"] =
                serde_json::to_value(&budget.partial).unwrap_or(Value::Null);
            JsonRpcError {
                code: e.kind.code(),
                message: e.kind.as_str().to_string(),
                data: Some(data),
            }
        })?;

    engine.session.record_batch(outcome.results.len() as u64);

    Ok(json!({
        "results": outcome.results,
        "total_cost": outcome.total_cost,
        "total_duration_ms": outcome.total_duration_ms,
    }))
}

#[derive(Debug, Deserialize)]
struct SubmitPluginResultParams {
    #[allow(dead_code)]
    trace_id: String,
    plugin_name: String,
    assertion_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    result: Value,
}

fn submit_plugin_result(engine: &Engine, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
    engine
        .session
        .require_initialized("submit_plugin_result")
        .map_err(rpc_err)?;
    let params: SubmitPluginResultParams =
        parse_params(req, ErrorKind::AssertionError, "invalid submit_plugin_result params")?;
    engine.session.record_assertions(1);
    tracing::info!(
        event = "plugin_result_accepted",
        plugin = %params.plugin_name,
        assertion_id = %params.assertion_id,
    );
    Ok(json!({ "accepted": true }))
}

#[derive(Debug, Deserialize)]
struct ValidateTraceTreeParams {
    trace: Value,
}

fn validate_trace_tree(engine: &Engine, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
    engine
        .session
        .require_initialized("validate_trace_tree")
        .map_err(rpc_err)?;
    let params: ValidateTraceTreeParams = parse_params(req, ErrorKind::InvalidTrace, "invalid validate_trace_tree params")?;
    let mut trace: Trace = serde_json::from_value(params.trace)
        .map_err(|e| rpc_err(EngineError::invalid_trace(format!("trace does not decode: {}", e))))?;
    validate::normalize(&mut trace);

    let report = tree::inspect(&trace);
    Ok(json!({
        "valid": report.valid,
        "errors": report.errors,
        "depth": report.depth,
        "agent_ids": report.agent_ids,
        "agent_count": report.agent_count,
        "aggregate_cost_usd": report.aggregates.cost_usd,
        "aggregate_tokens": report.aggregates.total_tokens,
        "aggregate_latency_ms": report.aggregates.latency_ms,
    }))
}

#[derive(Debug, Deserialize)]
struct QueryDriftParams {
    assertion_id: String,
    #[serde(default)]
    window_size: Option<u32>,
}

fn query_drift(engine: &Engine, req: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
    engine
        .session
        .require_initialized("query_drift")
        .map_err(rpc_err)?;
    let params: QueryDriftParams = parse_params(req, ErrorKind::EngineError, "invalid query_drift params")?;
    let window_size = params.window_size.unwrap_or(pipeline::DYNAMIC_WINDOW);

    let window = engine
        .history
        .query_window(&params.assertion_id, window_size)
        .map_err(|e| rpc_err(EngineError::engine(format!("history query failed: {}", e))))?;

    if window.len() < pipeline::DYNAMIC_MIN_RUNS {
        return Ok(json!({
            "assertion_id": params.assertion_id,
            "count": window.len(),
            "status": "insufficient_data",
        }));
    }

    let count = window.len() as f64;
    let mean = window.iter().sum::<f64>() / count;
    let variance = (window.iter().map(|s| s * s).sum::<f64>() / count - mean * mean).max(0.0);
    let stddev = variance.sqrt();
    let latest = window[0];
    let drifted = latest < mean - pipeline::DYNAMIC_STDDEV_FACTOR * stddev;

    Ok(json!({
        "assertion_id": params.assertion_id,
        "mean": mean,
        "stddev": stddev,
        "count": window.len(),
        "latest_score": latest,
        "deviation": latest - mean,
        "status": if drifted { "drift_detected" } else { "ok" },
    }))
}

fn shutdown(engine: &Engine) -> Result<Value, JsonRpcError> {
    let counters = engine.session.shutdown().map_err(rpc_err)?;
    tracing::info!(event = "session_shutdown");
    Ok(json!({
        "sessions_completed": counters.sessions_completed,
        "assertions_evaluated": counters.assertions_evaluated,
    }))
}
