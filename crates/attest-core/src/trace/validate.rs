use std::collections::HashSet;

use crate::error::EngineError;
use crate::trace::{Step, Trace, SCHEMA_VERSION_CURRENT, SCHEMA_VERSION_MIN};

pub const MAX_TRACE_BYTES: usize = 10_485_760;
pub const MAX_STEPS: usize = 10_000;
pub const MAX_STEP_BYTES: usize = 1_048_576;
pub const MAX_OUTPUT_BYTES: usize = 500_000;
pub const MAX_SUBTRACE_DEPTH: usize = 5;

/// Pre-validation fixups: trim the trace id and default a zero
/// `schema_version` to the current version. Applied recursively.
pub fn normalize(trace: &mut Trace) {
    trace.trace_id = trace.trace_id.trim().to_string();
    if trace.schema_version == 0 {
        trace.schema_version = SCHEMA_VERSION_CURRENT;
    }
    for step in &mut trace.steps {
        if let Some(sub) = step.sub_trace_mut() {
            normalize(sub);
        }
    }
}

/// Validates a trace against engine limits, stopping at the first failure.
/// Every failure is an `INVALID_TRACE` with an actionable detail.
pub fn validate(trace: &Trace) -> Result<(), EngineError> {
    let mut seen_ids = HashSet::new();
    validate_at(trace, 0, None, &mut seen_ids)
}

fn validate_at(
    trace: &Trace,
    depth: usize,
    parent_id: Option<&str>,
    seen_ids: &mut HashSet<String>,
) -> Result<(), EngineError> {
    if trace.schema_version < SCHEMA_VERSION_MIN || trace.schema_version > SCHEMA_VERSION_CURRENT {
        return Err(EngineError::invalid_trace(format!(
            "unsupported schema_version {} (supported: {}..={})",
            trace.schema_version, SCHEMA_VERSION_MIN, SCHEMA_VERSION_CURRENT
        )));
    }

    if trace.trace_id.trim().is_empty() {
        return Err(EngineError::invalid_trace(
            "trace_id is empty; set a unique identifier on the trace",
        ));
    }

    match trace.output.as_object() {
        None => {
            return Err(EngineError::invalid_trace(format!(
                "trace '{}': output is missing or not an object",
                trace.trace_id
            )))
        }
        Some(obj) if obj.is_empty() => {
            return Err(EngineError::invalid_trace(format!(
                "trace '{}': output object is empty; at least one field is required",
                trace.trace_id
            )))
        }
        Some(_) => {}
    }
    let output_bytes = serde_json::to_string(&trace.output).map(|s| s.len()).unwrap_or(0);
    if output_bytes > MAX_OUTPUT_BYTES {
        return Err(EngineError::invalid_trace(format!(
            "trace '{}': output is {} bytes; the limit is {} bytes",
            trace.trace_id, output_bytes, MAX_OUTPUT_BYTES
        )));
    }

    let serialized = serde_json::to_string(trace).map_err(|e| {
        EngineError::invalid_trace(format!("trace '{}' is not serializable: {}", trace.trace_id, e))
    })?;
    if serialized.len() > MAX_TRACE_BYTES {
        return Err(EngineError::invalid_trace(format!(
            "trace '{}' is {} bytes; the limit is {} bytes",
            trace.trace_id,
            serialized.len(),
            MAX_TRACE_BYTES
        )));
    }

    if trace.steps.len() > MAX_STEPS {
        return Err(EngineError::invalid_trace(format!(
            "trace '{}' has {} steps; the limit is {}",
            trace.trace_id,
            trace.steps.len(),
            MAX_STEPS
        )));
    }

    for (i, step) in trace.steps.iter().enumerate() {
        if step.common().name.trim().is_empty() {
            return Err(EngineError::invalid_trace(format!(
                "trace '{}': step {} has an empty name",
                trace.trace_id, i
            )));
        }
        if matches!(step, Step::Unknown { .. }) {
            return Err(EngineError::invalid_trace(format!(
                "trace '{}': step {} has unknown type '{}' (expected llm_call, tool_call, retrieval or agent_call)",
                trace.trace_id,
                i,
                step.kind()
            )));
        }
        let step_bytes = serde_json::to_string(step).map(|s| s.len()).unwrap_or(0);
        if step_bytes > MAX_STEP_BYTES {
            return Err(EngineError::invalid_trace(format!(
                "trace '{}': step {} ('{}') is {} bytes; the per-step limit is {} bytes",
                trace.trace_id,
                i,
                step.common().name,
                step_bytes,
                MAX_STEP_BYTES
            )));
        }
    }

    // Tree invariants are checked as part of the recursion so that a bad
    // sub-trace is reported with its position in the parent.
    if !seen_ids.insert(trace.trace_id.clone()) {
        return Err(EngineError::invalid_trace(format!(
            "duplicate trace_id '{}' in trace tree (possible cycle)",
            trace.trace_id
        )));
    }
    if let (Some(parent), Some(declared)) = (parent_id, trace.parent_trace_id.as_deref()) {
        if parent != declared {
            return Err(EngineError::invalid_trace(format!(
                "trace '{}': parent_trace_id is '{}' but the enclosing trace is '{}'",
                trace.trace_id, declared, parent
            )));
        }
    }

    for (i, step) in trace.steps.iter().enumerate() {
        if let Step::AgentCall { sub_trace, .. } = step {
            let Some(sub) = sub_trace else {
                return Err(EngineError::invalid_trace(format!(
                    "trace '{}': agent_call step {} ('{}') has no sub_trace",
                    trace.trace_id,
                    i,
                    step.common().name
                )));
            };
            if depth + 1 > MAX_SUBTRACE_DEPTH {
                return Err(EngineError::invalid_trace(format!(
                    "trace '{}': sub-trace nesting exceeds the maximum depth of {}",
                    trace.trace_id, MAX_SUBTRACE_DEPTH
                )));
            }
            validate_at(sub, depth + 1, Some(&trace.trace_id), seen_ids)?;
        }
    }

    Ok(())
}
