//! Layer 2: numeric constraints over resolved scalar fields.

use async_trait::async_trait;
use serde::Deserialize;

use attest_core::assertion::{Assertion, AssertionResult};
use attest_core::evaluator::Evaluator;
use attest_core::resolve;
use attest_core::trace::Trace;

const EQ_EPSILON: f64 = 1e-9;

#[derive(Debug, Deserialize)]
struct ConstraintSpec {
    field: String,
    operator: String,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    soft: bool,
}

pub struct ConstraintEvaluator;

#[async_trait]
impl Evaluator for ConstraintEvaluator {
    fn assertion_type(&self) -> &'static str {
        "constraint"
    }

    async fn evaluate(
        &self,
        trace: &Trace,
        assertion: &Assertion,
    ) -> anyhow::Result<AssertionResult> {
        let spec: ConstraintSpec = serde_json::from_value(assertion.spec.clone())
            .map_err(|e| anyhow::anyhow!("invalid constraint spec: {}", e))?;

        let actual = match resolve::resolve_numeric(trace, &spec.field) {
            Ok(v) => v,
            Err(e) => {
                return Ok(AssertionResult::fail(
                    &assertion.assertion_id,
                    spec.soft,
                    0.0,
                    e,
                ))
            }
        };

        let (holds, contract) = match spec.operator.as_str() {
            "lt" => {
                let v = expected(&spec)?;
                (actual < v, format!("{} < {}", spec.field, v))
            }
            "lte" => {
                let v = expected(&spec)?;
                (actual <= v, format!("{} <= {}", spec.field, v))
            }
            "gt" => {
                let v = expected(&spec)?;
                (actual > v, format!("{} > {}", spec.field, v))
            }
            "gte" => {
                let v = expected(&spec)?;
                (actual >= v, format!("{} >= {}", spec.field, v))
            }
            "eq" => {
                let v = expected(&spec)?;
                ((actual - v).abs() <= EQ_EPSILON, format!("{} == {}", spec.field, v))
            }
            "between" => {
                let (min, max) = match (spec.min, spec.max) {
                    (Some(min), Some(max)) => (min, max),
                    _ => anyhow::bail!("constraint operator 'between' requires min and max"),
                };
                (
                    actual >= min && actual <= max,
                    format!("{} in [{}, {}]", spec.field, min, max),
                )
            }
            other => anyhow::bail!("unknown constraint operator '{}'", other),
        };

        if holds {
            Ok(AssertionResult::pass(
                &assertion.assertion_id,
                format!("{} holds (observed {})", contract, actual),
            ))
        } else {
            Ok(AssertionResult::fail(
                &assertion.assertion_id,
                spec.soft,
                0.0,
                format!("{} violated (observed {})", contract, actual),
            ))
        }
    }
}

fn expected(spec: &ConstraintSpec) -> anyhow::Result<f64> {
    spec.value.ok_or_else(|| {
        anyhow::anyhow!("constraint operator '{}' requires a value", spec.operator)
    })
}
