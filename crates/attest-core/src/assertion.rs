use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_ASSERTION_ID_LEN: usize = 256;

/// A declarative check applied to a trace. `spec` is opaque here; each
/// evaluator deserializes its own shape out of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    pub assertion_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Assertion {
    /// True when the spec asks for history-calibrated reclassification.
    pub fn wants_dynamic_threshold(&self) -> bool {
        self.spec.get("threshold").and_then(|v| v.as_str()) == Some("dynamic")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionStatus {
    Pass,
    SoftFail,
    HardFail,
}

impl AssertionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AssertionStatus::Pass => "pass",
            AssertionStatus::SoftFail => "soft_fail",
            AssertionStatus::HardFail => "hard_fail",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    pub assertion_id: String,
    pub status: AssertionStatus,
    pub score: f64,
    pub explanation: String,
    pub cost: f64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl AssertionResult {
    pub fn new(assertion_id: &str, status: AssertionStatus, score: f64, explanation: String) -> Self {
        Self {
            assertion_id: assertion_id.to_string(),
            status,
            score: score.clamp(0.0, 1.0),
            explanation,
            cost: 0.0,
            duration_ms: 0,
            request_id: None,
        }
    }

    pub fn pass(assertion_id: &str, explanation: String) -> Self {
        Self::new(assertion_id, AssertionStatus::Pass, 1.0, explanation)
    }

    pub fn hard_fail(assertion_id: &str, explanation: String) -> Self {
        Self::new(assertion_id, AssertionStatus::HardFail, 0.0, explanation)
    }

    /// Failure helper honoring the `soft` downgrade flag.
    pub fn fail(assertion_id: &str, soft: bool, score: f64, explanation: String) -> Self {
        let status = if soft {
            AssertionStatus::SoftFail
        } else {
            AssertionStatus::HardFail
        };
        Self::new(assertion_id, status, score, explanation)
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

/// Fixed layer map driving the pipeline's stable sort. Layers 1-4 are
/// deterministic; 5-6 call out to providers.
pub fn layer_of(kind: &str) -> u8 {
    match kind {
        "schema" => 1,
        "constraint" => 2,
        "trace" | "trace_tree" => 3,
        "content" => 4,
        "embedding" => 5,
        "judge" => 6,
        // Unknown types run with the deterministic phase so their synthetic
        // hard_fail is produced without waiting on the gate.
        _ => 4,
    }
}

pub const LAYER_GATE_BOUNDARY: u8 = 4;
