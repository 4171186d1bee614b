//! Layer 4: string checks over a resolved target.

use async_trait::async_trait;
use serde::Deserialize;

use attest_core::assertion::{Assertion, AssertionResult, AssertionStatus};
use attest_core::evaluator::Evaluator;
use attest_core::resolve;
use attest_core::trace::Trace;

pub const MAX_REGEX_PATTERN_LEN: usize = 10_000;

#[derive(Debug, Deserialize)]
struct ContentSpec {
    target: String,
    check: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    values: Vec<String>,
    #[serde(default)]
    case_sensitive: bool,
    #[serde(default)]
    soft: bool,
}

impl ContentSpec {
    fn single(&self) -> anyhow::Result<&str> {
        self.value
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("content check '{}' requires 'value'", self.check))
    }

    fn many(&self) -> anyhow::Result<&[String]> {
        if self.values.is_empty() {
            anyhow::bail!("content check '{}' requires non-empty 'values'", self.check);
        }
        Ok(&self.values)
    }
}

pub struct ContentEvaluator;

#[async_trait]
impl Evaluator for ContentEvaluator {
    fn assertion_type(&self) -> &'static str {
        "content"
    }

    async fn evaluate(
        &self,
        trace: &Trace,
        assertion: &Assertion,
    ) -> anyhow::Result<AssertionResult> {
        let spec: ContentSpec = serde_json::from_value(assertion.spec.clone())
            .map_err(|e| anyhow::anyhow!("invalid content spec: {}", e))?;

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

        // Case folding lower-cases both sides.
        let haystack = if spec.case_sensitive {
            resolved.text.clone()
        } else {
            resolved.text.to_lowercase()
        };
        let fold = |s: &str| {
            if spec.case_sensitive {
                s.to_string()
            } else {
                s.to_lowercase()
            }
        };
        let id = &assertion.assertion_id;

        let result = match spec.check.as_str() {
            "contains" => {
                let needle = fold(spec.single()?);
                if haystack.contains(&needle) {
                    AssertionResult::pass(id, format!("'{}' contains \"{}\"", spec.target, needle))
                } else {
                    AssertionResult::fail(
                        id,
                        spec.soft,
                        0.0,
                        format!(
                            "'{}' does not contain \"{}\" (content: \"{}\")",
                            spec.target,
                            needle,
                            preview(&haystack)
                        ),
                    )
                }
            }
            "not_contains" => {
                let needle = fold(spec.single()?);
                if haystack.contains(&needle) {
                    AssertionResult::fail(
                        id,
                        spec.soft,
                        0.0,
                        format!("'{}' contains \"{}\" but must not", spec.target, needle),
                    )
                } else {
                    AssertionResult::pass(id, format!("'{}' omits \"{}\"", spec.target, needle))
                }
            }
            "regex_match" => {
                let pattern = spec.single()?;
                if pattern.len() > MAX_REGEX_PATTERN_LEN {
                    return Ok(AssertionResult::hard_fail(
                        id,
                        format!(
                            "regex pattern is {} chars; the limit is {}",
                            pattern.len(),
                            MAX_REGEX_PATTERN_LEN
                        ),
                    ));
                }
                let regex = regex::RegexBuilder::new(pattern)
                    .case_insensitive(!spec.case_sensitive)
                    .build()
                    .map_err(|e| anyhow::anyhow!("invalid regex pattern: {}", e))?;
                if regex.is_match(&resolved.text) {
                    AssertionResult::pass(id, format!("'{}' matches /{}/", spec.target, pattern))
                } else {
                    AssertionResult::fail(
                        id,
                        spec.soft,
                        0.0,
                        format!(
                            "'{}' does not match /{}/ (content: \"{}\")",
                            spec.target,
                            pattern,
                            preview(&resolved.text)
                        ),
                    )
                }
            }
            "keyword_all" => {
                let keywords = spec.many()?;
                let missing: Vec<&String> = keywords
                    .iter()
                    .filter(|k| !haystack.contains(&fold(k)))
                    .collect();
                if missing.is_empty() {
                    AssertionResult::pass(id, format!("all keywords present: {:?}", keywords))
                } else {
                    let matched = keywords.len() - missing.len();
                    let score = matched as f64 / keywords.len() as f64;
                    AssertionResult::fail(
                        id,
                        spec.soft,
                        score,
                        format!(
                            "{}/{} keywords present; missing {:?}",
                            matched,
                            keywords.len(),
                            missing
                        ),
                    )
                }
            }
            "keyword_any" => {
                let keywords = spec.many()?;
                match keywords.iter().find(|k| haystack.contains(&fold(k))) {
                    Some(hit) => {
                        AssertionResult::pass(id, format!("keyword \"{}\" present", hit))
                    }
                    None => AssertionResult::fail(
                        id,
                        spec.soft,
                        0.0,
                        format!("none of the keywords {:?} present", keywords),
                    ),
                }
            }
            "forbidden" => {
                let terms = if spec.values.is_empty() {
                    std::slice::from_ref(
                        spec.value
                            .as_ref()
                            .ok_or_else(|| anyhow::anyhow!("forbidden requires value or values"))?,
                    )
                } else {
                    &spec.values[..]
                };
                let hits: Vec<&String> =
                    terms.iter().filter(|t| haystack.contains(&fold(t))).collect();
                if hits.is_empty() {
                    AssertionResult::pass(id, format!("no forbidden term present: {:?}", terms))
                } else {
                    // Forbidden content is always a hard failure, `soft` or not.
                    AssertionResult::new(
                        id,
                        AssertionStatus::HardFail,
                        0.0,
                        format!("forbidden terms present: {:?}", hits),
                    )
                }
            }
            other => anyhow::bail!("unknown content check '{}'", other),
        };

        Ok(result)
    }
}

fn preview(s: &str) -> String {
    const LIMIT: usize = 120;
    if s.len() <= LIMIT {
        s.to_string()
    } else {
        let cut: String = s.chars().take(LIMIT).collect();
        format!("{}...", cut)
    }
}
