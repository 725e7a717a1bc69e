//! Backend handle that talks to a native model runtime over its
//! OpenAI-compatible HTTP API (`/v1/chat/completions`).
//!
//! Works with mlx-lm / vllm-mlx servers and llama.cpp-style GGUF servers.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    Backend, BackendFactory, BackendKind, ChatMessage, GenerationOutput, GenerationParams,
    TokenStream,
};
use crate::error::{EngineError, Result};
use crate::loader::LoadSpec;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RuntimeClientBackend {
    client: Client,
    base_url: String,
    model: String,
}

impl RuntimeClientBackend {
    pub fn new(client: Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }

    fn request_body(&self, messages: &[ChatMessage], params: &GenerationParams, stream: bool) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": stream,
        });
        if let Some(max_tokens) = params.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = params.top_p {
            body["top_p"] = json!(top_p);
        }
        if !params.stop.is_empty() {
            body["stop"] = json!(params.stop);
        }
        body
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| EngineError::inference(format!("Request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(EngineError::inference(format!("HTTP {status}: {text}")));
        }
        Ok(response)
    }
}

fn parse_completion(body: &Value) -> Result<GenerationOutput> {
    let choice = body
        .get("choices")
        .and_then(|c| c.get(0))
        .ok_or_else(|| EngineError::inference("Response has no choices"))?;
    let text = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = choice
        .get("finish_reason")
        .and_then(Value::as_str)
        .map(str::to_string);
    let usage = body.get("usage");
    let count = |field: &str| {
        usage
            .and_then(|u| u.get(field))
            .and_then(Value::as_u64)
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    };
    Ok(GenerationOutput {
        text,
        prompt_tokens: count("prompt_tokens"),
        completion_tokens: count("completion_tokens"),
        finish_reason,
    })
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return SseLine::Skip;
    };
    match value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
    {
        Some(content) if !content.is_empty() => SseLine::Token(content.to_string()),
        _ => SseLine::Skip,
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl SseState {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            match parse_sse_line(&String::from_utf8_lossy(&line)) {
                SseLine::Token(token) => self.pending.push_back(token),
                SseLine::Done => {
                    self.done = true;
                    return;
                }
                SseLine::Skip => {}
            }
        }
    }
}

fn sse_tokens(response: reqwest::Response) -> TokenStream {
    let state = SseState {
        body: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        done: false,
    };
    let stream = futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(token) = st.pending.pop_front() {
                return Some((Ok(token), st));
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(chunk)) => {
                    st.buffer.extend_from_slice(&chunk);
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(EngineError::inference(format!("Stream failed: {e}"))), st));
                }
                None => {
                    // Flush a final unterminated line.
                    st.buffer.push(b'\n');
                    st.drain_lines();
                    st.done = true;
                }
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl Backend for RuntimeClientBackend {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<GenerationOutput> {
        let body = self.request_body(messages, params, false);
        debug!(model = %self.model, base_url = %self.base_url, "runtime_generate");
        let response = self.post(&body).await?;
        let json: Value = response
            .json()
            .await
            .map_err(|e| EngineError::inference(format!("Invalid JSON: {e}")))?;
        parse_completion(&json)
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<TokenStream> {
        let body = self.request_body(messages, params, true);
        let response = self.post(&body).await?;
        Ok(sse_tokens(response))
    }
}

/// Builds [`RuntimeClientBackend`]s against the configured endpoints.
pub struct RuntimeClientFactory {
    client: Client,
    mlx_endpoint: String,
    gguf_endpoint: String,
}

impl RuntimeClientFactory {
    pub fn new(config: &lmx_core::BackendsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::backend(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            mlx_endpoint: config.mlx_endpoint.clone(),
            gguf_endpoint: config.gguf_endpoint.clone(),
        })
    }

    fn endpoint(&self, kind: BackendKind) -> &str {
        match kind {
            BackendKind::Gguf => &self.gguf_endpoint,
            BackendKind::VllmMlx | BackendKind::MlxLm => &self.mlx_endpoint,
        }
    }
}

#[async_trait]
impl BackendFactory for RuntimeClientFactory {
    async fn create(&self, kind: BackendKind, spec: &LoadSpec) -> Result<Arc<dyn Backend>> {
        let base = self.endpoint(kind).trim_end_matches('/');
        let url = format!("{base}/v1/models");
        let response = self
            .client
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::backend(format!("{kind} runtime unreachable at {base}: {e}")))?;
        if !response.status().is_success() {
            return Err(EngineError::backend(format!(
                "{kind} runtime at {base} answered HTTP {}",
                response.status()
            )));
        }
        Ok(Arc::new(RuntimeClientBackend::new(
            self.client.clone(),
            base,
            spec.model_id.clone(),
        )))
    }

    fn backend_version(&self, _kind: BackendKind) -> String {
        format!("openai-compat/{}", env!("CARGO_PKG_VERSION"))
    }
}
