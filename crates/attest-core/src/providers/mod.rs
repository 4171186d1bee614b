use async_trait::async_trait;

pub mod fake;
pub mod openai;
pub mod rate_limit;

/// One judge call. `system` carries the rubric prompt; `user` carries the
/// delimited agent output (plus optional criteria).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub cost_usd: f64,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn default_model(&self) -> String;
    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<Completion>;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn model_id(&self) -> String;
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}
