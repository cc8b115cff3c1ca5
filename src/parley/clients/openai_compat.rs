//! `OpenAICompatClient` implements [`ClientWrapper`] for any OpenAI-compatible
//! chat-completions endpoint (Groq, OpenAI, local servers), in JSON mode.
//!
//! Besides the completion text and token usage it reports the provider's quota
//! metadata:
//!
//! - `x-ratelimit-{limit,remaining,reset}-{requests,tokens}` response headers
//!   become a [`RateLimitSnapshot`];
//! - HTTP 429 becomes [`ClientError::RateLimited`], with `retry-after` parsed
//!   when present and the provider's message kept for its textual wait hint;
//! - error code `json_validate_failed` becomes [`ClientError::MalformedOutput`],
//!   carrying the provider's `failed_generation` for salvage;
//! - everything else becomes [`ClientError::Transport`].
//!
//! # Example
//!
//! ```rust,no_run
//! use parley::client_wrapper::{ChatRequest, ClientWrapper, Message};
//! use parley::clients::openai_compat::OpenAICompatClient;
//!
//! # async {
//! let key = std::env::var("GROQ_API_KEY").unwrap();
//! let client = OpenAICompatClient::new("https://api.groq.com/openai/v1", &key, "llama-3.3-70b-versatile");
//!
//! let completion = client
//!     .send_message(&ChatRequest::new(vec![Message::user("Reply with {\"ok\": true}")]))
//!     .await
//!     .unwrap();
//! println!("{} ({:?})", completion.content, completion.rate_limits);
//! # };
//! ```

use crate::parley::client_wrapper::{
    ChatRequest, ClientError, ClientWrapper, Completion, RateLimitSnapshot, TokenUsage,
};
use crate::parley::clients::http_pool::get_or_create_client;
use crate::parley::quota::parse_duration;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const JSON_VALIDATE_FAILED: &str = "json_validate_failed";

pub struct OpenAICompatClient {
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
    #[serde(default)]
    total_tokens: usize,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    failed_generation: Option<String>,
}

impl OpenAICompatClient {
    /// `base_url` is the API root without the `/chat/completions` suffix.
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let mut body = json!({ "model": self.model, "messages": messages });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if request.json_response {
            body["response_format"] = json!({ "type": "json_object" });
        }
        body
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn header_duration(headers: &HeaderMap, name: &str) -> Option<Duration> {
    parse_duration(headers.get(name)?.to_str().ok()?)
}

/// Quota metadata from the response headers, `None` when the provider sends none.
pub fn rate_limits_from_headers(headers: &HeaderMap) -> Option<RateLimitSnapshot> {
    let snapshot = RateLimitSnapshot {
        limit_requests: header_u64(headers, "x-ratelimit-limit-requests"),
        remaining_requests: header_u64(headers, "x-ratelimit-remaining-requests"),
        reset_requests: header_duration(headers, "x-ratelimit-reset-requests"),
        limit_tokens: header_u64(headers, "x-ratelimit-limit-tokens"),
        remaining_tokens: header_u64(headers, "x-ratelimit-remaining-tokens"),
        reset_tokens: header_duration(headers, "x-ratelimit-reset-tokens"),
    };
    if snapshot.is_empty() {
        None
    } else {
        Some(snapshot)
    }
}

fn classify_error(status: u16, headers: &HeaderMap, body: &str) -> ClientError {
    let detail = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
    let message = detail
        .as_ref()
        .map(|d| d.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| body.to_string());

    if status == 429 {
        return ClientError::RateLimited {
            message,
            retry_after: header_duration(headers, "retry-after"),
        };
    }
    match detail {
        Some(ErrorDetail {
            code: Some(code),
            failed_generation,
            ..
        }) if code == JSON_VALIDATE_FAILED => ClientError::MalformedOutput {
            message,
            failed_generation,
        },
        _ => ClientError::Transport {
            status: Some(status),
            message,
        },
    }
}

#[async_trait]
impl ClientWrapper for OpenAICompatClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(&self, request: &ChatRequest) -> Result<Completion, ClientError> {
        let transport = |message: String| ClientError::Transport {
            status: None,
            message,
        };

        let http = get_or_create_client(&self.base_url).map_err(|e| transport(e.to_string()))?;
        let response = http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let text = response.text().await.map_err(|e| transport(e.to_string()))?;

        if !(200..300).contains(&status) {
            let err = classify_error(status, &headers, &text);
            log::warn!("parley::openai_compat: {} answered {}: {}", self.model, status, err);
            return Err(err);
        }

        let body: CompletionBody = serde_json::from_str(&text).map_err(|e| ClientError::Transport {
            status: Some(status),
            message: format!("unexpected response body: {}", e),
        })?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClientError::Transport {
                status: Some(status),
                message: "response carried no choices".to_string(),
            })?;

        Ok(Completion {
            content,
            usage: body.usage.map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            rate_limits: rate_limits_from_headers(&headers),
        })
    }
}
