use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::EngineError;
use crate::providers::{Completion, CompletionRequest, LlmProvider};

/// Token bucket guarding judge calls. Refill rate comes from
/// requests-per-minute; `burst` is the bucket capacity. When `max_wait` is
/// unset the acquire blocks indefinitely and the caller's deadline bounds
/// the wait.
pub struct RateLimitedProvider {
    inner: Arc<dyn LlmProvider>,
    bucket: Mutex<Bucket>,
    refill_per_sec: f64,
    capacity: f64,
    max_wait: Option<Duration>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitedProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, rpm: f64, burst: u32) -> Self {
        let capacity = (burst.max(1)) as f64;
        Self {
            inner,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            refill_per_sec: (rpm.max(0.001)) / 60.0,
            capacity,
            max_wait: None,
        }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Takes one token, sleeping until the bucket refills. Returns a
    /// retryable error when the required wait exceeds `max_wait`.
    async fn acquire(&self) -> anyhow::Result<()> {
        let wait = {
            let mut bucket = self.bucket.lock().unwrap();
            let now = Instant::now();
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            bucket.last_refill = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                None
            } else {
                let deficit = 1.0 - bucket.tokens;
                // Claim the token now; the sleep below covers its refill.
                bucket.tokens -= 1.0;
                Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
            }
        };

        if let Some(wait) = wait {
            if let Some(max_wait) = self.max_wait {
                if wait > max_wait {
                    // Undo the claim so a later call is not double-charged.
                    let mut bucket = self.bucket.lock().unwrap();
                    bucket.tokens += 1.0;
                    return Err(EngineError::provider(format!(
                        "rate limit: bucket dry, next token in {:.1}s exceeds wait limit {:.1}s",
                        wait.as_secs_f64(),
                        max_wait.as_secs_f64()
                    ))
                    .into());
                }
            }
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }
}

#[async_trait]
impl LlmProvider for RateLimitedProvider {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn default_model(&self) -> String {
        self.inner.default_model()
    }

    async fn complete(&self, req: &CompletionRequest) -> anyhow::Result<Completion> {
        self.acquire().await?;
        self.inner.complete(req).await
    }
}
