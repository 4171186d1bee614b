use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;

use attest_core::session::Session;

use crate::methods;

/// Generous line cap: a request carrying a maximum-size trace plus batch
/// framing still fits well under this.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: Option<String>,
    pub method: String,
    pub params: Option<Value>,
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn err(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Single wire writer shared by responses and notifications. The mutex
/// guarantees no two messages interleave on stdout.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn write_message(&self, message: &Value) -> Result<()> {
        let mut out = self.inner.lock().unwrap();
        serde_json::to_writer(&mut *out, message)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    /// Notifications carry no `id` field.
    pub fn write_notification(&self, method: &str, params: Value) {
        let message = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        if let Err(e) = self.write_message(&message) {
            tracing::warn!(event = "notification_write_failed", method = method, error = %e);
        }
    }
}

pub struct Engine {
    pub session: Session,
    pub pipeline: attest_core::pipeline::Pipeline,
    pub history: Arc<attest_core::storage::HistoryStore>,
    pub capabilities: Vec<String>,
    pub max_concurrent: usize,
    request_seq: AtomicU64,
}

impl Engine {
    pub fn new(
        session: Session,
        pipeline: attest_core::pipeline::Pipeline,
        history: Arc<attest_core::storage::HistoryStore>,
        capabilities: Vec<String>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            session,
            pipeline,
            history,
            capabilities,
            max_concurrent,
            request_seq: AtomicU64::new(0),
        }
    }

    /// Correlation id for stderr diagnostics; one sequence per engine, hex
    /// so grepping a busy log does not collide with numeric payload fields.
    fn next_request_id(&self) -> String {
        format!("req-{:08x}", self.request_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Parses one request line and writes its response (if any) through the
    /// shared writer. Invalid JSON lines are logged and skipped; stdio
    /// transports recover on the next newline.
    pub async fn dispatch_line(&self, line: &str, out: &SharedWriter) {
        let rid = self.next_request_id();
        let req: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(event = "json_parse_error", rid = %rid, error = %e);
                return;
            }
        };

        let id = req.id.clone();
        let method = req.method.clone();
        let start = std::time::Instant::now();
        tracing::info!(event = "request_start", rid = %rid, method = %method);

        let response = match methods::route(self, &req, out).await {
            Ok(result) => JsonRpcResponse::ok(id, result),
            Err(error) => JsonRpcResponse::err(id, error),
        };

        tracing::info!(
            event = "request_done",
            rid = %rid,
            method = %method,
            duration_ms = start.elapsed().as_millis() as u64,
            ok = response.error.is_none(),
        );

        // Requests without an id are notifications; no response goes out.
        if req.id.is_none() {
            return;
        }
        if let Ok(value) = serde_json::to_value(&response) {
            if let Err(e) = out.write_message(&value) {
                tracing::error!(event = "response_write_failed", rid = %rid, error = %e);
            }
        }
    }
}

pub struct Server {
    pub engine: Arc<Engine>,
}

impl Server {
    /// Reader loop: one task pulls newline-delimited requests; each request
    /// runs on a semaphore-limited worker (1 = sequential dispatch). A
    /// `shutdown` request drains in-flight workers and ends the loop.
    pub async fn run(self) -> Result<()> {
        let out = SharedWriter::stdout();
        let max_concurrent = self.engine.max_concurrent.max(1);
        let sem = Arc::new(Semaphore::new(max_concurrent));

        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_BYTES {
                tracing::warn!(event = "line_too_large", bytes = line.len());
                let error = JsonRpcError {
                    code: 1001,
                    message: "INVALID_TRACE".to_string(),
                    data: Some(serde_json::json!({
                        "error_type": "INVALID_TRACE",
                        "retryable": false,
                        "detail": format!(
                            "request line is {} bytes; the limit is {}",
                            line.len(), MAX_LINE_BYTES
                        ),
                    })),
                };
                let resp = JsonRpcResponse::err(None, error);
                if let Ok(value) = serde_json::to_value(&resp) {
                    let _ = out.write_message(&value);
                }
                continue;
            }

            let is_shutdown = serde_json::from_str::<JsonRpcRequest>(&line)
                .map(|r| r.method == "shutdown")
                .unwrap_or(false);
            if is_shutdown {
                // Drain every in-flight worker before the final transition.
                let _all = sem.acquire_many(max_concurrent as u32).await?;
                self.engine.dispatch_line(&line, &out).await;
                break;
            }

            let permit = sem.clone().acquire_owned().await?;
            let engine = self.engine.clone();
            let out = out.clone();
            tokio::spawn(async move {
                let _permit = permit;
                engine.dispatch_line(&line, &out).await;
            });
        }

        tracing::info!(event = "dispatch_loop_exit");
        Ok(())
    }
}
