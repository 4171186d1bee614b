//! Multi-agent checks over the whole trace tree: delegation structure,
//! cross-agent data flow, aggregate metadata, and temporal ordering.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use attest_core::assertion::{Assertion, AssertionResult};
use attest_core::evaluator::Evaluator;
use attest_core::trace::tree;
use attest_core::trace::{StepCommon, Trace};

#[derive(Debug, Deserialize)]
struct TreeSpec {
    check: String,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    max_depth: Option<usize>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    from_agent: Option<String>,
    #[serde(default)]
    to_agent: Option<String>,
    #[serde(default)]
    field: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    transitions: Vec<(String, String)>,
    #[serde(default)]
    agent_a: Option<String>,
    #[serde(default)]
    agent_b: Option<String>,
    #[serde(default)]
    max_ms: Option<f64>,
    #[serde(default)]
    groups: Vec<Vec<String>>,
    #[serde(default)]
    soft: bool,
}

impl TreeSpec {
    fn agent(&self) -> anyhow::Result<&str> {
        self.agent_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("check '{}' requires 'agent_id'", self.check))
    }

    fn pair(&self) -> anyhow::Result<(&str, &str)> {
        match (self.agent_a.as_deref(), self.agent_b.as_deref()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => anyhow::bail!("check '{}' requires 'agent_a' and 'agent_b'", self.check),
        }
    }

    fn numeric_value(&self) -> anyhow::Result<f64> {
        self.value
            .as_ref()
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow::anyhow!("check '{}' requires a numeric 'value'", self.check))
    }

    fn op(&self) -> &str {
        self.operator.as_deref().unwrap_or("lte")
    }
}

fn compare(op: &str, actual: f64, expected: f64) -> anyhow::Result<bool> {
    Ok(match op {
        "lt" => actual < expected,
        "lte" => actual <= expected,
        "gt" => actual > expected,
        "gte" => actual >= expected,
        "eq" => (actual - expected).abs() <= 1e-9,
        other => anyhow::bail!("unknown operator '{}'", other),
    })
}

/// Bounding interval of an agent's steps. Errs when the agent has no steps
/// or any step lacks a temporal field; temporal checks treat that as a hard
/// failure no matter the soft flag.
fn bounds(agent: &str, steps: &[&StepCommon]) -> Result<(u64, u64), String> {
    if steps.is_empty() {
        return Err(format!("agent '{}' has no steps with temporal data", agent));
    }
    let mut min_start = u64::MAX;
    let mut max_end = 0u64;
    for step in steps {
        let (Some(start), Some(end)) = (step.started_at_ms, step.ended_at_ms) else {
            return Err(format!(
                "agent '{}': step '{}' is missing started_at_ms/ended_at_ms",
                agent, step.name
            ));
        };
        min_start = min_start.min(start);
        max_end = max_end.max(end);
    }
    Ok((min_start, max_end))
}

fn serialize(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

pub struct TraceTreeEvaluator;

#[async_trait]
impl Evaluator for TraceTreeEvaluator {
    fn assertion_type(&self) -> &'static str {
        "trace_tree"
    }

    async fn evaluate(
        &self,
        trace: &Trace,
        assertion: &Assertion,
    ) -> anyhow::Result<AssertionResult> {
        let spec: TreeSpec = serde_json::from_value(assertion.spec.clone())
            .map_err(|e| anyhow::anyhow!("invalid trace_tree spec: {}", e))?;
        let id = &assertion.assertion_id;

        // Temporal checks fail hard on missing fields; everything else
        // honors the soft flag.
        let (verdict, always_hard) = match spec.check.as_str() {
            "agent_called" => (agent_called(trace, &spec)?, false),
            "delegation_depth" => (delegation_depth(trace, &spec)?, false),
            "agent_output_contains" => (agent_output_contains(trace, &spec)?, false),
            "cross_agent_data_flow" => (cross_agent_data_flow(trace, &spec)?, false),
            "aggregate_cost" | "aggregate_tokens" | "aggregate_latency" => {
                (aggregate(trace, &spec)?, false)
            }
            "follows_transitions" => (follows_transitions(trace, &spec)?, false),
            "agent_ordered_before" => (agent_ordered_before(trace, &spec)?, true),
            "agents_overlap" => (agents_overlap(trace, &spec)?, true),
            "agent_wall_time_under" => (agent_wall_time_under(trace, &spec)?, true),
            "ordered_agents" => (ordered_agents(trace, &spec)?, true),
            other => anyhow::bail!("unknown trace_tree check '{}'", other),
        };

        Ok(match verdict {
            Ok(explanation) => AssertionResult::pass(id, explanation),
            Err(explanation) => {
                let soft = spec.soft && !always_hard;
                AssertionResult::fail(id, soft, 0.0, explanation)
            }
        })
    }
}

type Verdict = Result<String, String>;

fn agent_called(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let agent = spec.agent()?;
    Ok(match tree::find_agent(trace, agent) {
        Some(node) => Ok(format!("agent '{}' ran (trace '{}')", agent, node.trace_id)),
        None => Err(format!(
            "agent '{}' never ran; agents in tree: {:?}",
            agent,
            tree::agent_ids(trace)
        )),
    })
}

fn delegation_depth(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let max_depth = spec
        .max_depth
        .ok_or_else(|| anyhow::anyhow!("delegation_depth requires 'max_depth'"))?;
    let depth = tree::tree_depth(trace);
    Ok(if depth <= max_depth {
        Ok(format!("tree depth {} within limit {}", depth, max_depth))
    } else {
        Err(format!("tree depth {} exceeds limit {}", depth, max_depth))
    })
}

fn agent_output_contains(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let agent = spec.agent()?;
    let needle = spec
        .value
        .as_ref()
        .map(serialize)
        .ok_or_else(|| anyhow::anyhow!("agent_output_contains requires 'value'"))?;
    let Some(node) = tree::find_agent(trace, agent) else {
        return Ok(Err(format!("agent '{}' not present in tree", agent)));
    };
    let mut output = serialize(&node.output);
    let mut needle = needle;
    if !spec.case_sensitive {
        output = output.to_lowercase();
        needle = needle.to_lowercase();
    }
    Ok(if output.contains(&needle) {
        Ok(format!("output of agent '{}' contains \"{}\"", agent, needle))
    } else {
        Err(format!(
            "output of agent '{}' does not contain \"{}\"",
            agent, needle
        ))
    })
}

fn cross_agent_data_flow(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let (from, to) = match (spec.from_agent.as_deref(), spec.to_agent.as_deref()) {
        (Some(f), Some(t)) => (f, t),
        _ => anyhow::bail!("cross_agent_data_flow requires 'from_agent' and 'to_agent'"),
    };
    let field = spec
        .field
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("cross_agent_data_flow requires 'field'"))?;

    let Some(source) = tree::find_agent(trace, from) else {
        return Ok(Err(format!("source agent '{}' not present in tree", from)));
    };
    let Some(sink) = tree::find_agent(trace, to) else {
        return Ok(Err(format!("sink agent '{}' not present in tree", to)));
    };
    let Some(payload) = source.output.get(field) else {
        return Ok(Err(format!(
            "output of agent '{}' has no field '{}'",
            from, field
        )));
    };
    let Some(input) = &sink.input else {
        return Ok(Err(format!("agent '{}' has no input to receive data", to)));
    };

    let payload_str = serialize(payload);
    let input_str = serialize(input);
    Ok(if input_str.contains(&payload_str) {
        Ok(format!(
            "'{}.output.{}' flows into '{}' input",
            from, field, to
        ))
    } else {
        Err(format!(
            "\"{}\" from '{}.output.{}' does not appear in the input of '{}'",
            payload_str, from, field, to
        ))
    })
}

fn aggregate(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let expected = spec.numeric_value()?;
    let agg = tree::aggregates(trace);
    let (label, actual) = match spec.check.as_str() {
        "aggregate_cost" => ("total cost_usd", agg.cost_usd),
        "aggregate_tokens" => ("total tokens", agg.total_tokens as f64),
        _ => ("total latency_ms", agg.latency_ms as f64),
    };
    let holds = compare(spec.op(), actual, expected)?;
    Ok(if holds {
        Ok(format!("{} {} {} {} holds", label, actual, spec.op(), expected))
    } else {
        Err(format!(
            "{} {} violates {} {}",
            label,
            actual,
            spec.op(),
            expected
        ))
    })
}

fn follows_transitions(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    if spec.transitions.is_empty() {
        anyhow::bail!("follows_transitions requires 'transitions'");
    }
    let edges = tree::delegation_edges(trace);
    for (parent, child) in &edges {
        let allowed = spec
            .transitions
            .iter()
            .any(|(p, c)| p == parent && c == child);
        if !allowed {
            return Ok(Err(format!(
                "delegation '{}' -> '{}' is not in the allowed transitions {:?}",
                parent, child, spec.transitions
            )));
        }
    }
    Ok(Ok(format!("all {} delegation edge(s) allowed", edges.len())))
}

fn agent_ordered_before(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let (a, b) = spec.pair()?;
    let bounds_a = match bounds(a, &tree::steps_for_agent(trace, a)) {
        Ok(b) => b,
        Err(e) => return Ok(Err(e)),
    };
    let bounds_b = match bounds(b, &tree::steps_for_agent(trace, b)) {
        Ok(b) => b,
        Err(e) => return Ok(Err(e)),
    };
    Ok(if bounds_a.1 < bounds_b.0 {
        Ok(format!(
            "agent '{}' finished at {}ms, before '{}' started at {}ms",
            a, bounds_a.1, b, bounds_b.0
        ))
    } else {
        Err(format!(
            "agent '{}' finished at {}ms, not strictly before '{}' started at {}ms",
            a, bounds_a.1, b, bounds_b.0
        ))
    })
}

fn agents_overlap(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let (a, b) = spec.pair()?;
    let bounds_a = match bounds(a, &tree::steps_for_agent(trace, a)) {
        Ok(v) => v,
        Err(e) => return Ok(Err(e)),
    };
    let bounds_b = match bounds(b, &tree::steps_for_agent(trace, b)) {
        Ok(v) => v,
        Err(e) => return Ok(Err(e)),
    };
    let overlap = bounds_a.0 <= bounds_b.1 && bounds_b.0 <= bounds_a.1;
    Ok(if overlap {
        Ok(format!(
            "agents '{}' [{}..{}]ms and '{}' [{}..{}]ms overlap",
            a, bounds_a.0, bounds_a.1, b, bounds_b.0, bounds_b.1
        ))
    } else {
        Err(format!(
            "agents '{}' [{}..{}]ms and '{}' [{}..{}]ms do not overlap",
            a, bounds_a.0, bounds_a.1, b, bounds_b.0, bounds_b.1
        ))
    })
}

fn agent_wall_time_under(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    let agent = spec.agent()?;
    let max_ms = spec
        .max_ms
        .ok_or_else(|| anyhow::anyhow!("agent_wall_time_under requires 'max_ms'"))?;
    let steps = tree::steps_for_agent(trace, agent);
    if steps.is_empty() {
        return Ok(Err(format!(
            "agent '{}' has no steps with temporal data",
            agent
        )));
    }
    let mut total = 0u64;
    for step in &steps {
        let (Some(start), Some(end)) = (step.started_at_ms, step.ended_at_ms) else {
            return Ok(Err(format!(
                "agent '{}': step '{}' is missing started_at_ms/ended_at_ms",
                agent, step.name
            )));
        };
        total += end.saturating_sub(start);
    }
    Ok(if (total as f64) < max_ms {
        Ok(format!(
            "agent '{}' wall time {}ms under limit {}ms",
            agent, total, max_ms
        ))
    } else {
        Err(format!(
            "agent '{}' wall time {}ms exceeds limit {}ms",
            agent, total, max_ms
        ))
    })
}

fn ordered_agents(trace: &Trace, spec: &TreeSpec) -> anyhow::Result<Verdict> {
    if spec.groups.len() < 2 {
        anyhow::bail!("ordered_agents requires at least two groups");
    }
    for window in spec.groups.windows(2) {
        let (earlier, later) = (&window[0], &window[1]);
        let mut max_end = 0u64;
        for agent in earlier {
            match bounds(agent, &tree::steps_for_agent(trace, agent)) {
                Ok((_, end)) => max_end = max_end.max(end),
                Err(e) => return Ok(Err(e)),
            }
        }
        let mut min_start = u64::MAX;
        for agent in later {
            match bounds(agent, &tree::steps_for_agent(trace, agent)) {
                Ok((start, _)) => min_start = min_start.min(start),
                Err(e) => return Ok(Err(e)),
            }
        }
        if max_end >= min_start {
            return Ok(Err(format!(
                "group {:?} ends at {}ms, not before group {:?} starting at {}ms",
                earlier, max_end, later, min_start
            )));
        }
    }
    Ok(Ok(format!("{} group(s) ran strictly in order", spec.groups.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use attest_core::assertion::AssertionStatus;
    use serde_json::json;

    /// planner (root) delegates to researcher then writer; researcher output
    /// feeds writer input.
    fn tree() -> Trace {
        serde_json::from_value(json!({
            "schema_version": 2,
            "trace_id": "root",
            "agent_id": "planner",
            "metadata": {"cost_usd": 0.01, "total_tokens": 150, "latency_ms": 900},
            "output": {"plan": "research then write"},
            "steps": [
                {"type": "agent_call", "name": "research", "sub_trace": {
                    "schema_version": 2,
                    "trace_id": "research-1",
                    "agent_id": "researcher",
                    "parent_trace_id": "root",
                    "metadata": {"cost_usd": 0.02, "total_tokens": 300, "latency_ms": 400},
                    "output": {"findings": "rust is memory safe"},
                    "steps": [
                        {"type": "retrieval", "name": "search_docs",
                         "started_at_ms": 100, "ended_at_ms": 300}
                    ]
                }},
                {"type": "agent_call", "name": "write", "sub_trace": {
                    "schema_version": 2,
                    "trace_id": "write-1",
                    "agent_id": "writer",
                    "parent_trace_id": "root",
                    "input": {"brief": "expand on: rust is memory safe"},
                    "metadata": {"cost_usd": 0.03, "total_tokens": 500},
                    "output": {"article": "An essay about Rust."},
                    "steps": [
                        {"type": "llm_call", "name": "draft",
                         "started_at_ms": 400, "ended_at_ms": 700}
                    ]
                }}
            ]
        }))
        .unwrap()
    }

    async fn eval(spec: serde_json::Value) -> AssertionResult {
        let a = Assertion {
            assertion_id: "tt1".into(),
            kind: "trace_tree".into(),
            spec,
            request_id: None,
        };
        TraceTreeEvaluator.evaluate(&tree(), &a).await.unwrap()
    }

    #[tokio::test]
    async fn agent_called_walks_the_whole_tree() {
        let r = eval(json!({"check": "agent_called", "agent_id": "writer"})).await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({"check": "agent_called", "agent_id": "editor"})).await;
        assert_eq!(r.status, AssertionStatus::HardFail);
        assert!(r.explanation.contains("planner"), "{}", r.explanation);
    }

    #[tokio::test]
    async fn delegation_depth_counts_from_root_zero() {
        let r = eval(json!({"check": "delegation_depth", "max_depth": 1})).await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({"check": "delegation_depth", "max_depth": 0})).await;
        assert_eq!(r.status, AssertionStatus::HardFail);
    }

    #[tokio::test]
    async fn agent_output_contains_is_case_folded() {
        let r = eval(json!({
            "check": "agent_output_contains", "agent_id": "researcher",
            "value": "MEMORY SAFE"
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({
            "check": "agent_output_contains", "agent_id": "researcher",
            "value": "MEMORY SAFE", "case_sensitive": true
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
    }

    #[tokio::test]
    async fn cross_agent_data_flow_finds_payload_in_sink_input() {
        let r = eval(json!({
            "check": "cross_agent_data_flow",
            "from_agent": "researcher", "to_agent": "writer", "field": "findings"
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({
            "check": "cross_agent_data_flow",
            "from_agent": "writer", "to_agent": "researcher", "field": "article"
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
        assert!(r.explanation.contains("input"), "{}", r.explanation);
    }

    #[tokio::test]
    async fn aggregates_sum_across_nodes() {
        let r = eval(json!({
            "check": "aggregate_cost", "operator": "lte", "value": 0.06
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({
            "check": "aggregate_tokens", "operator": "lt", "value": 900
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
        assert!(r.explanation.contains("950"), "{}", r.explanation);

        // writer has no latency_ms; missing contributes zero.
        let r = eval(json!({
            "check": "aggregate_latency", "operator": "eq", "value": 1300
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);
    }

    #[tokio::test]
    async fn follows_transitions_checks_every_edge() {
        let r = eval(json!({
            "check": "follows_transitions",
            "transitions": [["planner", "researcher"], ["planner", "writer"]]
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({
            "check": "follows_transitions",
            "transitions": [["planner", "researcher"]]
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
        assert!(r.explanation.contains("writer"), "{}", r.explanation);
    }

    #[tokio::test]
    async fn temporal_ordering_and_overlap() {
        let r = eval(json!({
            "check": "agent_ordered_before", "agent_a": "researcher", "agent_b": "writer"
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({
            "check": "agent_ordered_before", "agent_a": "writer", "agent_b": "researcher"
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);

        // researcher [100..300] and writer [400..700] do not overlap.
        let r = eval(json!({
            "check": "agents_overlap", "agent_a": "researcher", "agent_b": "writer"
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
    }

    #[tokio::test]
    async fn overlapping_intervals_pass() {
        let mut trace = tree();
        // Stretch the researcher step to [100..500], overlapping the writer.
        if let Some(sub) = trace.steps[0].sub_trace_mut() {
            sub.steps[0].common_mut().ended_at_ms = Some(500);
        }
        let a = Assertion {
            assertion_id: "tt1".into(),
            kind: "trace_tree".into(),
            spec: json!({
                "check": "agents_overlap", "agent_a": "researcher", "agent_b": "writer"
            }),
            request_id: None,
        };
        let r = TraceTreeEvaluator.evaluate(&trace, &a).await.unwrap();
        assert_eq!(r.status, AssertionStatus::Pass);
    }

    #[tokio::test]
    async fn missing_temporal_fields_fail_hard_even_when_soft() {
        // planner steps carry no timestamps.
        let r = eval(json!({
            "check": "agent_ordered_before", "agent_a": "planner", "agent_b": "writer",
            "soft": true
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
        assert!(r.explanation.contains("missing"), "{}", r.explanation);
    }

    #[tokio::test]
    async fn wall_time_sums_step_durations() {
        let r = eval(json!({
            "check": "agent_wall_time_under", "agent_id": "researcher", "max_ms": 250
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({
            "check": "agent_wall_time_under", "agent_id": "researcher", "max_ms": 200
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
        assert!(r.explanation.contains("200"), "{}", r.explanation);
    }

    #[tokio::test]
    async fn ordered_agents_compares_group_envelopes() {
        let r = eval(json!({
            "check": "ordered_agents", "groups": [["researcher"], ["writer"]]
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::Pass);

        let r = eval(json!({
            "check": "ordered_agents", "groups": [["writer"], ["researcher"]]
        }))
        .await;
        assert_eq!(r.status, AssertionStatus::HardFail);
    }

    #[tokio::test]
    async fn unknown_check_is_a_spec_error() {
        let a = Assertion {
            assertion_id: "tt1".into(),
            kind: "trace_tree".into(),
            spec: json!({"check": "astral_projection"}),
            request_id: None,
        };
        assert!(TraceTreeEvaluator.evaluate(&tree(), &a).await.is_err());
    }
}
