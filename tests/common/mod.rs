#![allow(dead_code)] // each test binary uses a subset of these helpers

use async_trait::async_trait;
use quotagate::{ApiRequest, ApiResponse, Headers, RequestExecutor};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing_subscriber::fmt::MakeWriter;

/// `MakeWriter` that appends formatted log lines to a shared buffer, so
/// tests can assert on emitted diagnostics.
#[derive(Clone, Default)]
pub struct SharedWriter(pub Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// One scripted transport-layer reaction, consumed in order.
pub enum Script {
    Respond { status: u16, headers: Vec<(String, String)> },
    Fail(String),
}

/// Record of one executor invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub path: String,
    pub at: Instant,
}

/// Mock transport: replays a script of responses and records every call
/// with its (tokio) timestamp. An exhausted script answers 200.
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self { script: Mutex::new(VecDeque::new()), calls: Mutex::new(Vec::new()) }
    }

    pub fn push_status(&self, status: u16) {
        self.script.lock().unwrap().push_back(Script::Respond { status, headers: Vec::new() });
    }

    pub fn push_ok(&self) {
        self.push_status(200);
    }

    pub fn push_rate_limited(&self, retry_after_secs: Option<u64>) {
        self.push_429("rate", retry_after_secs);
    }

    pub fn push_daily_limited(&self, retry_after_secs: Option<u64>) {
        self.push_429("daily", retry_after_secs);
    }

    pub fn push_transport_error(&self, message: &str) {
        self.script.lock().unwrap().push_back(Script::Fail(message.to_string()));
    }

    fn push_429(&self, limit_type: &str, retry_after_secs: Option<u64>) {
        let mut headers = vec![("x-ratelimit-type".to_string(), limit_type.to_string())];
        if let Some(secs) = retry_after_secs {
            headers.push(("retry-after".to_string(), secs.to_string()));
        }
        self.script.lock().unwrap().push_back(Script::Respond { status: 429, headers });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    type Error = std::io::Error;

    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, Self::Error> {
        self.calls.lock().unwrap().push(Call {
            method: request.method.clone(),
            path: request.path.clone(),
            at: Instant::now(),
        });
        let step = self.script.lock().unwrap().pop_front();
        match step {
            None => Ok(ApiResponse {
                status: 200,
                headers: Headers::new(),
                body: serde_json::json!({}),
            }),
            Some(Script::Respond { status, headers }) => Ok(ApiResponse {
                status,
                headers: headers.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect(),
                body: serde_json::json!({}),
            }),
            Some(Script::Fail(message)) => {
                Err(std::io::Error::new(std::io::ErrorKind::Other, message))
            }
        }
    }
}
