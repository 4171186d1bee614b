//! Layer 1: JSON Schema validation of a resolved target value.

use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::{Draft, JSONSchema};
use moka::sync::Cache;
use serde::Deserialize;
use serde_json::Value;

use attest_core::assertion::{Assertion, AssertionResult};
use attest_core::embeddings::sha256_hex;
use attest_core::evaluator::Evaluator;
use attest_core::resolve;
use attest_core::trace::Trace;

const COMPILER_CACHE_ENTRIES: u64 = 128;

#[derive(Debug, Deserialize)]
struct SchemaSpec {
    target: String,
    schema: Value,
    #[serde(default)]
    soft: bool,
}

pub struct SchemaEvaluator {
    compiled: Cache<String, Arc<JSONSchema>>,
}

impl Default for SchemaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaEvaluator {
    pub fn new() -> Self {
        Self {
            compiled: Cache::new(COMPILER_CACHE_ENTRIES),
        }
    }

    fn compile(&self, schema: &Value) -> anyhow::Result<Arc<JSONSchema>> {
        let key = sha256_hex(&serde_json::to_string(schema)?);
        if let Some(hit) = self.compiled.get(&key) {
            return Ok(hit);
        }
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft202012)
            .compile(schema)
            .map_err(|e| anyhow::anyhow!("invalid JSON Schema: {}", e))?;
        let compiled = Arc::new(compiled);
        self.compiled.insert(key, compiled.clone());
        Ok(compiled)
    }
}

#[async_trait]
impl Evaluator for SchemaEvaluator {
    fn assertion_type(&self) -> &'static str {
        "schema"
    }

    async fn evaluate(
        &self,
        trace: &Trace,
        assertion: &Assertion,
    ) -> anyhow::Result<AssertionResult> {
        let spec: SchemaSpec = serde_json::from_value(assertion.spec.clone())
            .map_err(|e| anyhow::anyhow!("invalid schema spec: {}", e))?;

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

        let compiled = match self.compile(&spec.schema) {
            Ok(c) => c,
            Err(e) => {
                return Ok(AssertionResult::hard_fail(
                    &assertion.assertion_id,
                    e.to_string(),
                ))
            }
        };

        let result = match compiled.validate(&resolved.value) {
            Ok(()) => {
                let required = spec
                    .schema
                    .get("required")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    })
                    .unwrap_or_default();
                let explanation = if required.is_empty() {
                    format!("'{}' conforms to the schema", spec.target)
                } else {
                    format!(
                        "'{}' conforms to the schema; required fields satisfied: {}",
                        spec.target, required
                    )
                };
                Ok(AssertionResult::pass(&assertion.assertion_id, explanation))
            }
            Err(mut errors) => {
                // Report the first concrete violation.
                let cause = errors
                    .next()
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        if path.is_empty() {
                            e.to_string()
                        } else {
                            format!("{} (at {})", e, path)
                        }
                    })
                    .unwrap_or_else(|| "schema violation".to_string());
                Ok(AssertionResult::fail(
                    &assertion.assertion_id,
                    spec.soft,
                    0.0,
                    format!("'{}' violates the schema: {}", spec.target, cause),
                ))
            }
        };
        result
    }
}
