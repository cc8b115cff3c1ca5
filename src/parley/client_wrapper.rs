use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// A ClientWrapper is a wrapper around a specific semantic oracle endpoint.
/// It provides a common interface to send one structured request and receive the
/// raw completion together with whatever quota metadata the provider returned.
/// It does not retry, wait or track quota; that is the job of the
/// [`DispatchClient`](crate::dispatch::DispatchClient), which wraps a ClientWrapper.
// src/parley/client_wrapper.rs

/// Represents the possible roles for a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Role {
    System,
    // instructions for the oracle
    User,
    // the structured input for the current phase
    Assistant, // previous oracle output replayed as context
}

impl Role {
    /// Wire name used by OpenAI-compatible chat endpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// How many tokens were spent on prompt vs. completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
}

/// Represents a generic message to be sent to the oracle.
#[derive(Clone, Debug)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The actual content of the message.
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// One request to the oracle.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    /// Upper bound on generated tokens, forwarded as `max_tokens`.
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the provider to constrain output to a single JSON object.
    pub json_response: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            max_tokens: None,
            temperature: None,
            json_response: true,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// The smallest request that still yields quota headers.
    pub fn probe() -> Self {
        Self {
            messages: vec![Message::user("ping")],
            max_tokens: Some(1),
            temperature: None,
            json_response: false,
        }
    }

    /// Rough size of the request in tokens (one token per 4 characters),
    /// plus the generation ceiling when one is set.
    pub fn estimated_tokens(&self) -> u64 {
        let prompt: usize = self
            .messages
            .iter()
            .map(|m| estimate_token_count(&m.content) + 1)
            .sum();
        prompt as u64 + u64::from(self.max_tokens.unwrap_or(0))
    }
}

/// Estimates the number of tokens in a string.
/// Uses an approximate formula: one token per 4 characters.
pub fn estimate_token_count(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Quota metadata the provider attached to a successful response.
///
/// Every field is optional because providers differ in which headers they send.
/// Reset values are relative durations, measured from the moment the response
/// was received.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RateLimitSnapshot {
    pub limit_requests: Option<u64>,
    pub remaining_requests: Option<u64>,
    pub reset_requests: Option<Duration>,
    pub limit_tokens: Option<u64>,
    pub remaining_tokens: Option<u64>,
    pub reset_tokens: Option<Duration>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self == &RateLimitSnapshot::default()
    }
}

/// The raw result of a successful oracle call.
#[derive(Clone, Debug)]
pub struct Completion {
    /// Generated text; expected to hold one JSON object.
    pub content: String,
    pub usage: Option<TokenUsage>,
    pub rate_limits: Option<RateLimitSnapshot>,
}

impl Completion {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
            rate_limits: None,
        }
    }
}

/// Failures reported by a [`ClientWrapper`].
#[derive(Clone, Debug)]
pub enum ClientError {
    /// The provider refused the call because a quota bucket is exhausted.
    /// `message` usually carries the human-readable wait ("try again in 5s").
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The provider could not produce valid JSON. `failed_generation` carries
    /// the invalid text when the provider returns it.
    MalformedOutput {
        message: String,
        failed_generation: Option<String>,
    },

    /// Anything else: connection failures, auth errors, 5xx responses.
    Transport {
        status: Option<u16>,
        message: String,
    },
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::RateLimited { message, .. } => write!(f, "Rate limited: {}", message),
            ClientError::MalformedOutput { message, .. } => {
                write!(f, "Malformed output: {}", message)
            }
            ClientError::Transport {
                status: Some(status),
                message,
            } => write!(f, "Transport error ({}): {}", status, message),
            ClientError::Transport {
                status: None,
                message,
            } => write!(f, "Transport error: {}", message),
        }
    }
}

impl Error for ClientError {}

/// Trait defining the interface to the semantic oracle's transport.
#[async_trait]
pub trait ClientWrapper: Send + Sync {
    /// Model identifier; used as the default quota resource key.
    fn model_name(&self) -> &str;

    /// Send one request and return the completion with its quota metadata.
    async fn send_message(&self, request: &ChatRequest) -> Result<Completion, ClientError>;
}
