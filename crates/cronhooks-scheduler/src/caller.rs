//! Outbound webhook call.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::error::ExecutionFailure;
use crate::types::{HttpMethod, WebhookTarget};

/// `User-Agent` sent unless the job overrides it.
pub const DEFAULT_USER_AGENT: &str = "CronHooks/1.0";

/// Bytes of response body kept on an attempt.
pub const RESPONSE_BODY_LIMIT: usize = 10_000;

/// Bytes of failure description kept on an attempt.
pub const ERROR_MESSAGE_LIMIT: usize = 1_000;

/// What came back from the target, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub status: u16,
    /// Body text, already truncated to [`RESPONSE_BODY_LIMIT`].
    pub body: String,
}

impl CallResponse {
    /// 2xx and 3xx count as delivered.
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }
}

/// Performs the HTTP request for a job.
///
/// Any received response is `Ok`, even a 500; only transport-level problems
/// are errors.
#[async_trait]
pub trait WebhookCaller: Send + Sync {
    async fn call(
        &self,
        target: &WebhookTarget,
        timeout_secs: u64,
    ) -> Result<CallResponse, ExecutionFailure>;
}

pub struct ReqwestCaller {
    client: reqwest::Client,
}

impl ReqwestCaller {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookCaller for ReqwestCaller {
    async fn call(
        &self,
        target: &WebhookTarget,
        timeout_secs: u64,
    ) -> Result<CallResponse, ExecutionFailure> {
        let headers = merge_headers(target)?;
        let mut req = self
            .client
            .request(reqwest_method(target.method), &target.url)
            .headers(headers)
            .timeout(Duration::from_secs(timeout_secs));
        if !is_empty_body(&target.body) {
            let body = serde_json::to_vec(&target.body)
                .map_err(|e| ExecutionFailure::TransportError(e.to_string()))?;
            req = req.body(body);
        }

        debug!(method = %target.method, url = %target.url, "calling webhook target");
        let resp = req
            .send()
            .await
            .map_err(|e| classify(e, timeout_secs))?;
        let status = resp.status().as_u16();
        let text = resp.text().await.map_err(|e| classify(e, timeout_secs))?;

        Ok(CallResponse {
            status,
            body: truncate_utf8(&text, RESPONSE_BODY_LIMIT),
        })
    }
}

fn classify(err: reqwest::Error, timeout_secs: u64) -> ExecutionFailure {
    if err.is_timeout() {
        ExecutionFailure::TransportTimeout { timeout_secs }
    } else {
        ExecutionFailure::TransportError(truncate_utf8(&err.to_string(), ERROR_MESSAGE_LIMIT))
    }
}

fn reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
    }
}

/// Defaults first, then the job's headers on top. Header names compare
/// case-insensitively, so `content-type` replaces `Content-Type`.
pub fn merge_headers(target: &WebhookTarget) -> Result<HeaderMap, ExecutionFailure> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    for (name, value) in &target.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ExecutionFailure::TransportError(format!("invalid header {name:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ExecutionFailure::TransportError(format!("invalid value for {name}: {e}")))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// `null`, `{}`, `[]` and `""` are not sent.
pub fn is_empty_body(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Cut `s` to at most `max` bytes without splitting a character.
pub fn truncate_utf8(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
