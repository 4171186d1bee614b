use serde_json::json;

/// Stable error families surfaced over the wire. Codes never change once
/// an SDK has shipped against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTrace,
    AssertionError,
    ProviderError,
    EngineError,
    Timeout,
    SessionError,
}

impl ErrorKind {
    pub fn code(self) -> i64 {
        match self {
            ErrorKind::InvalidTrace => 1001,
            ErrorKind::AssertionError => 1002,
            ErrorKind::ProviderError => 2001,
            ErrorKind::EngineError => 3001,
            ErrorKind::Timeout => 3002,
            ErrorKind::SessionError => 3003,
        }
    }

    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::ProviderError | ErrorKind::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidTrace => "INVALID_TRACE",
            ErrorKind::AssertionError => "ASSERTION_ERROR",
            ErrorKind::ProviderError => "PROVIDER_ERROR",
            ErrorKind::EngineError => "ENGINE_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::SessionError => "SESSION_ERROR",
        }
    }
}

/// Structured engine error: a stable kind plus an actionable detail string.
#[derive(Debug, Clone)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn invalid_trace(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTrace, detail)
    }

    pub fn assertion(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::AssertionError, detail)
    }

    pub fn provider(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderError, detail)
    }

    pub fn engine(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::EngineError, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn session(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::SessionError, detail)
    }

    /// The `data` sub-object of the wire error envelope.
    pub fn rpc_data(&self) -> serde_json::Value {
        json!({
            "error_type": self.kind.as_str(),
            "retryable": self.kind.retryable(),
            "detail": self.detail,
        })
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

impl std::error::Error for EngineError {}

/// Pull an `EngineError` back out of an `anyhow` chain, if one is there.
pub fn as_engine_error(err: &anyhow::Error) -> Option<&EngineError> {
    err.downcast_ref::<EngineError>()
}
