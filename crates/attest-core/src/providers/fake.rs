//! In-process providers for tests and for running the engine without
//! credentials. The judge replays a scripted queue of responses; the
//! embedder derives a stable vector from the text hash, so identical
//! strings map to identical vectors.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::providers::{Completion, CompletionRequest, EmbeddingProvider, LlmProvider};

#[derive(Debug)]
pub enum ScriptedResponse {
    Text(String),
    Error(String),
}

pub struct FakeJudge {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    calls: AtomicU64,
    pub cost_per_call: f64,
}

impl FakeJudge {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicU64::new(0),
            cost_per_call: 0.001,
        }
    }

    pub fn scoring(scores: &[f64]) -> Self {
        Self::new(
            scores
                .iter()
                .map(|s| {
                    ScriptedResponse::Text(format!(
                        r#"{{"score": {}, "explanation": "scripted run"}}"#,
                        s
                    ))
                })
                .collect(),
        )
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LlmProvider for FakeJudge {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn default_model(&self) -> String {
        "fake-judge".to_string()
    }

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<Completion> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(ScriptedResponse::Text(text)) => Ok(Completion {
                text,
                model: req.model.clone(),
                cost_usd: self.cost_per_call,
            }),
            Some(ScriptedResponse::Error(detail)) => Err(EngineError::provider(detail).into()),
            None => Err(EngineError::provider("fake judge script exhausted").into()),
        }
    }
}

pub struct FakeEmbedder {
    pub dims: usize,
    calls: AtomicU64,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn model_id(&self) -> String {
        format!("fake-embed-{}", self.dims)
    }

    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let digest = Sha256::digest(text.as_bytes());
        let mut out = Vec::with_capacity(self.dims);
        for i in 0..self.dims {
            let byte = digest[i % digest.len()];
            // Spread bytes into [-1, 1] with a per-index twist so distinct
            // texts rarely collide on direction.
            let v = ((byte as f32) + (i as f32) * 0.37).sin();
            out.push(v);
        }
        Ok(out)
    }
}
