use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod tree;
pub mod validate;

/// Current trace schema version. The engine accepts the current version and
/// the one before it.
pub const SCHEMA_VERSION_CURRENT: u32 = 2;
pub const SCHEMA_VERSION_MIN: u32 = SCHEMA_VERSION_CURRENT - 1;

/// One agent invocation as recorded by an SDK. Immutable from the engine's
/// view; handlers only read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TraceMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
}

impl Trace {
    /// Ordered step names of this trace (root only, no recursion).
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.common().name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Fields shared by every step variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepCommon {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// One observable action inside a trace. Tagged union on `type`; only
/// `agent_call` carries a sub-trace. Unrecognized tags are preserved so the
/// validator can report them instead of failing at decode time.
#[derive(Debug, Clone)]
pub enum Step {
    LlmCall(StepCommon),
    ToolCall(StepCommon),
    Retrieval(StepCommon),
    AgentCall {
        common: StepCommon,
        sub_trace: Option<Box<Trace>>,
    },
    Unknown {
        kind: String,
        common: StepCommon,
    },
}

impl Step {
    pub fn kind(&self) -> &str {
        match self {
            Step::LlmCall(_) => "llm_call",
            Step::ToolCall(_) => "tool_call",
            Step::Retrieval(_) => "retrieval",
            Step::AgentCall { .. } => "agent_call",
            Step::Unknown { kind, .. } => kind.as_str(),
        }
    }

    pub fn common(&self) -> &StepCommon {
        match self {
            Step::LlmCall(c) | Step::ToolCall(c) | Step::Retrieval(c) => c,
            Step::AgentCall { common, .. } => common,
            Step::Unknown { common, .. } => common,
        }
    }

    pub fn common_mut(&mut self) -> &mut StepCommon {
        match self {
            Step::LlmCall(c) | Step::ToolCall(c) | Step::Retrieval(c) => c,
            Step::AgentCall { common, .. } => common,
            Step::Unknown { common, .. } => common,
        }
    }

    pub fn sub_trace(&self) -> Option<&Trace> {
        match self {
            Step::AgentCall { sub_trace, .. } => sub_trace.as_deref(),
            _ => None,
        }
    }

    pub fn sub_trace_mut(&mut self) -> Option<&mut Trace> {
        match self {
            Step::AgentCall { sub_trace, .. } => sub_trace.as_deref_mut(),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawStep {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    common: StepCommon,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sub_trace: Option<Box<Trace>>,
}

impl Serialize for Step {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let raw = RawStep {
            kind: self.kind().to_string(),
            common: self.common().clone(),
            sub_trace: match self {
                Step::AgentCall { sub_trace, .. } => sub_trace.clone(),
                _ => None,
            },
        };
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawStep::deserialize(deserializer)?;
        Ok(match raw.kind.as_str() {
            "llm_call" => Step::LlmCall(raw.common),
            "tool_call" => Step::ToolCall(raw.common),
            "retrieval" => Step::Retrieval(raw.common),
            "agent_call" => Step::AgentCall {
                common: raw.common,
                sub_trace: raw.sub_trace,
            },
            _ => Step::Unknown {
                kind: raw.kind,
                common: raw.common,
            },
        })
    }
}
