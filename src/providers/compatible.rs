//! Generic OpenAI-compatible provider.
//! Speaks the `/chat/completions` format, both buffered and SSE-streamed.

use crate::providers::traits::{ChatMessage, Provider};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct OpenAiCompatibleProvider {
    pub(crate) name: String,
    pub(crate) base_url: String,
    pub(crate) api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Build the full URL for chat completions, detecting if base_url already includes the path.
    fn chat_completions_url(&self) -> String {
        let has_full_endpoint = reqwest::Url::parse(&self.base_url)
            .map(|url| {
                url.path()
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            })
            .unwrap_or_else(|_| {
                self.base_url
                    .trim_end_matches('/')
                    .ends_with("/chat/completions")
            });

        if has_full_endpoint {
            self.base_url.clone()
        } else {
            format!("{}/chat/completions", self.base_url)
        }
    }

    fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "{} API key not set. Set AGORA_API_KEY or OPENAI_API_KEY, or add api_key to config.toml.",
                self.name
            )
        })
    }

    fn build_request(
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
        stream: bool,
    ) -> ChatRequest {
        ChatRequest {
            model: model.to_string(),
            messages: messages
                .iter()
                .map(|m| Message {
                    role: m.role.clone(),
                    content: m.content.clone(),
                })
                .collect(),
            temperature,
            max_tokens,
            stream: Some(stream),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

// ══════════════════════════════════════════════════════════
// SSE streaming types for OpenAI-compatible chat completions
// ══════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct StreamChatResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Take every complete line out of `buffer` and return its `data:` payloads.
/// An unterminated tail stays in the buffer for the next read. Lines are
/// decoded only once complete, so multi-byte characters split across network
/// chunks survive.
fn drain_sse_payloads(buffer: &mut Vec<u8>) -> Vec<String> {
    let Some(last_newline) = buffer.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };
    let complete: Vec<u8> = buffer.drain(..=last_newline).collect();

    complete
        .split(|&b| b == b'\n')
        .filter_map(|line| {
            let line = String::from_utf8_lossy(line);
            let data = line.trim_end_matches('\r').strip_prefix("data:")?.trim();
            (!data.is_empty() && data != "[DONE]").then(|| data.to_string())
        })
        .collect()
}

/// Forward every content delta in `payloads`. Returns false once the receiver is gone.
fn forward_deltas(
    payloads: Vec<String>,
    content_buf: &mut String,
    tx: &mpsc::UnboundedSender<String>,
) -> bool {
    for payload in payloads {
        let Ok(chunk) = serde_json::from_str::<StreamChatResponse>(&payload) else {
            tracing::debug!(payload = %payload, "Skipping unparseable SSE payload");
            continue;
        };
        for choice in chunk.choices {
            let Some(content) = choice.delta.content else {
                continue;
            };
            if content.is_empty() {
                continue;
            }
            content_buf.push_str(&content);
            if tx.send(content).is_err() {
                return false;
            }
        }
    }
    true
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
    ) -> anyhow::Result<String> {
        let api_key = self.require_api_key()?;
        let request = Self::build_request(messages, model, temperature, max_tokens, false);

        let url = self.chat_completions_url();
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }

        let chat_response: ApiChatResponse = response.json().await?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| anyhow::anyhow!("No response from {}", self.name))
    }

    async fn stream_chat_with_history(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: Option<u32>,
        tx: mpsc::UnboundedSender<String>,
    ) -> anyhow::Result<String> {
        let api_key = self.require_api_key()?;
        let request = Self::build_request(messages, model, temperature, max_tokens, true);

        let url = self.chat_completions_url();
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(super::api_error(&self.name, response).await);
        }

        let mut content_buf = String::new();
        let mut sse_buf: Vec<u8> = Vec::new();
        let mut byte_stream = response.bytes_stream();

        while let Some(chunk_result) = byte_stream.next().await {
            let bytes = chunk_result?;
            sse_buf.extend_from_slice(&bytes);

            let payloads = drain_sse_payloads(&mut sse_buf);
            if !forward_deltas(payloads, &mut content_buf, &tx) {
                tracing::debug!(provider = %self.name, "Stream receiver closed; stopping early");
                return Ok(content_buf);
            }
        }

        // Flush a final event that arrived without a trailing newline
        if !sse_buf.iter().all(u8::is_ascii_whitespace) {
            sse_buf.push(b'\n');
            let payloads = drain_sse_payloads(&mut sse_buf);
            forward_deltas(payloads, &mut content_buf, &tx);
        }

        Ok(content_buf)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
