use std::collections::HashSet;

use crate::trace::{Step, StepCommon, Trace};

use super::validate::MAX_SUBTRACE_DEPTH;

/// One node of the agent tree: a trace plus its depth (root = 0).
pub struct TreeNode<'a> {
    pub trace: &'a Trace,
    pub depth: usize,
}

/// Flattens the agent tree, root first, depth-first in step order.
pub fn collect_nodes(root: &Trace) -> Vec<TreeNode<'_>> {
    let mut out = Vec::new();
    walk(root, 0, &mut out);
    out
}

fn walk<'a>(trace: &'a Trace, depth: usize, out: &mut Vec<TreeNode<'a>>) {
    out.push(TreeNode { trace, depth });
    for step in &trace.steps {
        if let Some(sub) = step.sub_trace() {
            walk(sub, depth + 1, out);
        }
    }
}

/// Maximum depth of the tree (root = 0).
pub fn tree_depth(root: &Trace) -> usize {
    collect_nodes(root).iter().map(|n| n.depth).max().unwrap_or(0)
}

/// Agent ids present on any node, in first-seen order.
pub fn agent_ids(root: &Trace) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for node in collect_nodes(root) {
        if let Some(id) = &node.trace.agent_id {
            if seen.insert(id.clone()) {
                out.push(id.clone());
            }
        }
    }
    out
}

/// Finds the first node carrying the given agent id.
pub fn find_agent<'a>(root: &'a Trace, agent_id: &str) -> Option<&'a Trace> {
    collect_nodes(root)
        .into_iter()
        .map(|n| n.trace)
        .find(|t| t.agent_id.as_deref() == Some(agent_id))
}

/// All steps in the tree attributed to an agent. A step belongs to the agent
/// named by its own `agent_id`, falling back to the enclosing trace's.
pub fn steps_for_agent<'a>(root: &'a Trace, agent_id: &str) -> Vec<&'a StepCommon> {
    let mut out = Vec::new();
    for node in collect_nodes(root) {
        for step in &node.trace.steps {
            let owner = step
                .common()
                .agent_id
                .as_deref()
                .or(node.trace.agent_id.as_deref());
            if owner == Some(agent_id) {
                out.push(step.common());
            }
        }
    }
    out
}

/// Delegation edges `(parent_agent, child_agent)` for every `agent_call`.
/// Traces with no agent id contribute an empty string on their side.
pub fn delegation_edges(root: &Trace) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for node in collect_nodes(root) {
        for step in &node.trace.steps {
            if let Some(sub) = step.sub_trace() {
                out.push((
                    node.trace.agent_id.clone().unwrap_or_default(),
                    sub.agent_id.clone().unwrap_or_default(),
                ));
            }
        }
    }
    out
}

/// Metadata sums across every node. Missing fields contribute zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TreeAggregates {
    pub cost_usd: f64,
    pub total_tokens: u64,
    pub latency_ms: u64,
}

pub fn aggregates(root: &Trace) -> TreeAggregates {
    let mut agg = TreeAggregates::default();
    for node in collect_nodes(root) {
        if let Some(meta) = &node.trace.metadata {
            agg.cost_usd += meta.cost_usd.unwrap_or(0.0);
            agg.total_tokens += meta.total_tokens.unwrap_or(0);
            agg.latency_ms += meta.latency_ms.unwrap_or(0);
        }
    }
    agg
}

/// Structural report for the `validate_trace_tree` method: unlike the
/// first-failure validator, this collects every problem it can find.
#[derive(Debug, Clone)]
pub struct TreeReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub depth: usize,
    pub agent_ids: Vec<String>,
    pub agent_count: usize,
    pub aggregates: TreeAggregates,
}

pub fn inspect(root: &Trace) -> TreeReport {
    let mut errors = Vec::new();
    let mut seen_ids = HashSet::new();
    inspect_at(root, 0, None, &mut seen_ids, &mut errors);

    let ids = agent_ids(root);
    TreeReport {
        valid: errors.is_empty(),
        errors,
        depth: tree_depth(root),
        agent_count: ids.len(),
        agent_ids: ids,
        aggregates: aggregates(root),
    }
}

fn inspect_at(
    trace: &Trace,
    depth: usize,
    parent_id: Option<&str>,
    seen_ids: &mut HashSet<String>,
    errors: &mut Vec<String>,
) {
    if trace.trace_id.trim().is_empty() {
        errors.push(format!("node at depth {}: empty trace_id", depth));
    } else if !seen_ids.insert(trace.trace_id.clone()) {
        errors.push(format!(
            "duplicate trace_id '{}' in tree (possible cycle)",
            trace.trace_id
        ));
        // Do not recurse below a duplicate; the subtree was already visited
        // or is cyclic.
        return;
    }

    if let (Some(parent), Some(declared)) = (parent_id, trace.parent_trace_id.as_deref()) {
        if parent != declared {
            errors.push(format!(
                "trace '{}': parent_trace_id '{}' does not match enclosing trace '{}'",
                trace.trace_id, declared, parent
            ));
        }
    }

    if depth > MAX_SUBTRACE_DEPTH {
        errors.push(format!(
            "trace '{}': depth {} exceeds the maximum of {}",
            trace.trace_id, depth, MAX_SUBTRACE_DEPTH
        ));
        return;
    }

    for (i, step) in trace.steps.iter().enumerate() {
        if let Step::AgentCall { sub_trace, .. } = step {
            match sub_trace {
                Some(sub) => inspect_at(sub, depth + 1, Some(&trace.trace_id), seen_ids, errors),
                None => errors.push(format!(
                    "trace '{}': agent_call step {} ('{}') has no sub_trace",
                    trace.trace_id,
                    i,
                    step.common().name
                )),
            }
        }
    }
}
