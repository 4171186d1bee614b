use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::assertion::{Assertion, AssertionResult};
use crate::trace::Trace;

/// The single-method surface every assertion type implements. Evaluators
/// return `Err` only for errors that should surface as an assertion-level
/// hard_fail; they never abort the batch.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn assertion_type(&self) -> &'static str;

    async fn evaluate(&self, trace: &Trace, assertion: &Assertion)
        -> anyhow::Result<AssertionResult>;
}

/// Maps assertion type tags to their implementations. Registration is
/// conditional on provider availability, so the set of keys doubles as the
/// engine's capability source.
#[derive(Default, Clone)]
pub struct EvaluatorRegistry {
    evaluators: HashMap<&'static str, Arc<dyn Evaluator>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, evaluator: Arc<dyn Evaluator>) {
        self.evaluators.insert(evaluator.assertion_type(), evaluator);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Evaluator>> {
        self.evaluators.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.evaluators.contains_key(kind)
    }

    pub fn types(&self) -> Vec<&'static str> {
        let mut out: Vec<&'static str> = self.evaluators.keys().copied().collect();
        out.sort_unstable();
        out
    }
}
