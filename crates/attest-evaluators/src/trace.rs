//! Layer 3: structural checks over the ordered step names of the root trace.

use async_trait::async_trait;
use serde::Deserialize;

use attest_core::assertion::{Assertion, AssertionResult};
use attest_core::evaluator::Evaluator;
use attest_core::trace::Trace;

#[derive(Debug, Deserialize)]
struct TraceSpec {
    check: String,
    #[serde(default)]
    tools: Vec<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    max_repetitions: Option<u32>,
    #[serde(default)]
    soft: bool,
}

pub struct TraceEvaluator;

#[async_trait]
impl Evaluator for TraceEvaluator {
    fn assertion_type(&self) -> &'static str {
        "trace"
    }

    async fn evaluate(
        &self,
        trace: &Trace,
        assertion: &Assertion,
    ) -> anyhow::Result<AssertionResult> {
        let spec: TraceSpec = serde_json::from_value(assertion.spec.clone())
            .map_err(|e| anyhow::anyhow!("invalid trace spec: {}", e))?;
        let names = trace.step_names();

        let verdict = match spec.check.as_str() {
            "contains_in_order" => contains_in_order(&names, &spec.tools),
            "exact_order" => exact_order(&names, &spec.tools),
            "loop_detection" => {
                let tool = spec
                    .tool
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("loop_detection requires 'tool'"))?;
                let max = spec.max_repetitions.ok_or_else(|| {
                    anyhow::anyhow!("loop_detection requires 'max_repetitions' > 0")
                })?;
                if max == 0 {
                    anyhow::bail!("loop_detection requires 'max_repetitions' > 0");
                }
                loop_detection(&names, tool, max)
            }
            "no_duplicates" => no_duplicates(&names),
            "required_tools" => required_tools(&names, &spec.tools),
            "forbidden_tools" => forbidden_tools(&names, &spec.tools),
            other => anyhow::bail!("unknown trace check '{}'", other),
        };

        Ok(match verdict {
            Ok(explanation) => AssertionResult::pass(&assertion.assertion_id, explanation),
            Err(explanation) => {
                AssertionResult::fail(&assertion.assertion_id, spec.soft, 0.0, explanation)
            }
        })
    }
}

/// Greedy left-to-right subsequence match; each tool must appear strictly
/// after the previous match.
fn contains_in_order(names: &[&str], tools: &[String]) -> Result<String, String> {
    let mut cursor = 0usize;
    let mut positions = Vec::with_capacity(tools.len());
    for tool in tools {
        match names[cursor..].iter().position(|n| *n == tool) {
            Some(offset) => {
                positions.push(cursor + offset);
                cursor += offset + 1;
            }
            None => {
                return Err(format!(
                    "tool '{}' not found after position {} (step names: {:?})",
                    tool, cursor, names
                ))
            }
        }
    }
    Ok(format!("tools {:?} appear in order at indices {:?}", tools, positions))
}

/// Contiguous window equal to `tools`.
fn exact_order(names: &[&str], tools: &[String]) -> Result<String, String> {
    if tools.is_empty() {
        return Ok("empty sequence trivially matches".to_string());
    }
    let window = tools.len();
    if names.len() >= window {
        for start in 0..=(names.len() - window) {
            if names[start..start + window]
                .iter()
                .zip(tools)
                .all(|(n, t)| *n == t)
            {
                return Ok(format!(
                    "tools {:?} appear contiguously starting at index {}",
                    tools, start
                ));
            }
        }
    }
    Err(format!(
        "tools {:?} do not appear as a contiguous window in {:?}",
        tools, names
    ))
}

fn loop_detection(names: &[&str], tool: &str, max: u32) -> Result<String, String> {
    let count = names.iter().filter(|n| **n == tool).count() as u32;
    if count <= max {
        Ok(format!("tool '{}' ran {} time(s), within the limit of {}", tool, count, max))
    } else {
        let positions: Vec<usize> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == tool)
            .map(|(i, _)| i)
            .collect();
        Err(format!(
            "tool '{}' ran {} times at indices {:?}, exceeding the limit of {}",
            tool, count, positions, max
        ))
    }
}

fn no_duplicates(names: &[&str]) -> Result<String, String> {
    let mut seen = std::collections::HashMap::new();
    for (i, name) in names.iter().enumerate() {
        if let Some(first) = seen.insert(*name, i) {
            return Err(format!(
                "step name '{}' occurs more than once (indices {} and {})",
                name, first, i
            ));
        }
    }
    Ok("every step name occurs at most once".to_string())
}

fn required_tools(names: &[&str], tools: &[String]) -> Result<String, String> {
    let missing: Vec<&String> = tools.iter().filter(|t| !names.contains(&t.as_str())).collect();
    if missing.is_empty() {
        Ok(format!("all required tools present: {:?}", tools))
    } else {
        Err(format!(
            "required tools missing: {:?} (step names: {:?})",
            missing, names
        ))
    }
}

fn forbidden_tools(names: &[&str], tools: &[String]) -> Result<String, String> {
    let hits: Vec<(usize, &str)> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| tools.iter().any(|t| t == **n))
        .map(|(i, n)| (i, *n))
        .collect();
    if hits.is_empty() {
        Ok(format!("no forbidden tool present: {:?}", tools))
    } else {
        Err(format!("forbidden tools used at (index, name): {:?}", hits))
    }
}
