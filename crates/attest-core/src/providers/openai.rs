use async_trait::async_trait;
use serde_json::json;

use crate::error::EngineError;
use crate::providers::{Completion, CompletionRequest, EmbeddingProvider, LlmProvider};

const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

pub const DEFAULT_JUDGE_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Rough per-million-token prices for cost accounting. Unknown models report
/// zero cost rather than guessing.
fn price_per_mtok(model: &str) -> Option<(f64, f64)> {
    match model {
        "gpt-4o-mini" => Some((0.15, 0.60)),
        "gpt-4o" => Some((2.50, 10.00)),
        "gpt-4.1-mini" => Some((0.40, 1.60)),
        _ => None,
    }
}

fn estimate_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    match price_per_mtok(model) {
        Some((input, output)) => {
            (prompt_tokens as f64 * input + completion_tokens as f64 * output) / 1_000_000.0
        }
        None => 0.0,
    }
}

/// Maps an OpenAI HTTP failure to the retryable/non-retryable families.
fn classify_status(status: reqwest::StatusCode, body: &str) -> EngineError {
    if status.as_u16() == 429 || status.is_server_error() {
        EngineError::provider(format!("openai returned {}: {}", status, body))
    } else {
        EngineError::assertion(format!("openai rejected the request ({}): {}", status, body))
    }
}

pub struct OpenAiJudge {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiJudge {
    pub fn new(model: Option<String>, api_key: String) -> Self {
        Self {
            model: model.unwrap_or_else(|| DEFAULT_JUDGE_MODEL.to_string()),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiJudge {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> String {
        self.model.clone()
    }

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<Completion> {
        let body = json!({
            "model": req.model,
            "messages": [
                {"role": "system", "content": req.system},
                {"role": "user", "content": req.user},
            ],
            "temperature": req.temperature,
            "max_tokens": req.max_tokens,
        });

        let resp = self
            .client
            .post(CHAT_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::provider(format!("openai request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text).into());
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::provider(format!("openai response unreadable: {}", e)))?;

        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngineError::provider("openai response missing content"))?
            .to_string();

        let prompt_tokens = payload
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let completion_tokens = payload
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(Completion {
            text,
            model: req.model.clone(),
            cost_usd: estimate_cost(&req.model, prompt_tokens, completion_tokens),
        })
    }
}

pub struct OpenAiEmbedder {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiEmbedder {
    pub fn new(model: Option<String>, api_key: String) -> Self {
        Self {
            model: model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let body = json!({ "model": self.model, "input": text });
        let resp = self
            .client
            .post(EMBEDDINGS_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::provider(format!("openai embeddings request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &text).into());
        }

        let payload: serde_json::Value = resp.json().await.map_err(|e| {
            EngineError::provider(format!("openai embeddings response unreadable: {}", e))
        })?;

        let values = payload
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| EngineError::provider("openai embeddings response missing vector"))?;

        let mut out = Vec::with_capacity(values.len());
        for v in values {
            let f = v
                .as_f64()
                .ok_or_else(|| EngineError::provider("openai embedding contains non-numeric value"))?;
            out.push(f as f32);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_models_cost_zero() {
        assert_eq!(estimate_cost("mystery-model", 1000, 1000), 0.0);
    }

    #[test]
    fn known_model_cost_is_positive() {
        let c = estimate_cost("gpt-4o-mini", 1_000_000, 0);
        assert!((c - 0.15).abs() < 1e-9);
    }

    #[test]
    fn rate_limits_and_5xx_are_retryable() {
        let e = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(e.kind.retryable());
        let e = classify_status(reqwest::StatusCode::BAD_GATEWAY, "oops");
        assert!(e.kind.retryable());
        let e = classify_status(reqwest::StatusCode::BAD_REQUEST, "bad schema");
        assert!(!e.kind.retryable());
    }
}
