//! Quota-aware dispatch of structured oracle calls.
//!
//! [`DispatchClient::call`] sends one [`ChatRequest`] and returns its payload
//! parsed into the caller's schema. Around the single network call it:
//!
//! 1. seeds the shared [`QuotaTracker`] for the resource key with a probe, once;
//! 2. sleeps for any active wait requirement plus random jitter, or until the
//!    per-minute token budget resets when the estimated cost exceeds what is
//!    known to remain, then reserves the estimate atomically;
//! 3. holds the tracker's per-key in-flight gate while the call is out;
//! 4. settles the reservation against response metadata or actual usage, and
//!    feeds rate-limit errors back into the tracker;
//! 5. retries rate-limited calls up to `max_rate_limit_attempts` times;
//! 6. resends malformed output up to `max_malformed_retries` times after a short
//!    fixed delay, then attempts a structural repair before giving up.
//!
//! Every wait other than the malformed-output delay is derived from a reset
//! time reported by the provider; with budget available the client never
//! sleeps. All suspension points race against a [`CancellationToken`].
//!
//! ```rust,no_run
//! use parley::client_wrapper::{ChatRequest, Message};
//! use parley::clients::openai_compat::OpenAICompatClient;
//! use parley::dispatch::DispatchClient;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async {
//! let client = Arc::new(OpenAICompatClient::new(
//!     "https://api.groq.com/openai/v1",
//!     &std::env::var("GROQ_API_KEY").unwrap(),
//!     "llama-3.3-70b-versatile",
//! ));
//! let dispatch = DispatchClient::new(client);
//! let request = ChatRequest::new(vec![
//!     Message::system("Reply with a JSON object {\"ok\": true}."),
//!     Message::user("{}"),
//! ]);
//! let cost = request.estimated_tokens();
//! let value: serde_json::Value = dispatch
//!     .call(&request, dispatch.default_resource_key(), cost, &CancellationToken::new())
//!     .await
//!     .unwrap();
//! # };
//! ```

use crate::parley::client_wrapper::{ChatRequest, ClientError, ClientWrapper};
use crate::parley::config::DispatchConfig;
use crate::parley::event::{DispatchEvent, EventHandler, WaitReason};
use crate::parley::json_repair::{parse_structured, repair};
use crate::parley::quota::{Admission, QuotaTracker, RateLimitFailure, Reservation};
use rand::Rng;
use serde::de::DeserializeOwned;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Failures surfaced by [`DispatchClient::call`].
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// The output stayed malformed after every resend and could not be repaired.
    Parse { raw: String, reason: String },

    /// The provider kept answering with rate-limit errors.
    RateLimitExhausted { key: String, attempts: usize },

    /// A non-retryable transport failure.
    Transport(String),

    /// The caller's cancellation token fired.
    Cancelled,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Parse { reason, .. } => write!(f, "Unparseable oracle output: {}", reason),
            DispatchError::RateLimitExhausted { key, attempts } => write!(
                f,
                "Rate limit for '{}' still exhausted after {} attempts",
                key, attempts
            ),
            DispatchError::Transport(msg) => write!(f, "Transport failure: {}", msg),
            DispatchError::Cancelled => write!(f, "Dispatch cancelled"),
        }
    }
}

impl Error for DispatchError {}

/// Quota-aware wrapper around a [`ClientWrapper`].
pub struct DispatchClient {
    client: Arc<dyn ClientWrapper>,
    tracker: Arc<QuotaTracker>,
    config: DispatchConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl DispatchClient {
    /// Wrap `client`, sharing the process-wide [`QuotaTracker::global`].
    pub fn new(client: Arc<dyn ClientWrapper>) -> Self {
        Self {
            client,
            tracker: QuotaTracker::global(),
            config: DispatchConfig::default(),
            event_handler: None,
        }
    }

    pub fn with_tracker(mut self, tracker: Arc<QuotaTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn tracker(&self) -> &Arc<QuotaTracker> {
        &self.tracker
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The wrapped client's model name, the usual resource key.
    pub fn default_resource_key(&self) -> &str {
        self.client.model_name()
    }

    async fn emit(&self, event: DispatchEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_dispatch_event(&event).await;
        }
    }

    fn jitter(&self) -> Duration {
        if self.config.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        let ms = rand::rng().random_range(0..=self.config.max_jitter_ms);
        Duration::from_millis(ms)
    }

    /// Issue `request` against `resource_key` and parse the payload as `T`.
    ///
    /// `estimated_cost` is the caller's token estimate for the call, compared
    /// against the known per-minute budget before sending.
    pub async fn call<T>(
        &self,
        request: &ChatRequest,
        resource_key: &str,
        estimated_cost: u64,
        cancel: &CancellationToken,
    ) -> Result<T, DispatchError>
    where
        T: DeserializeOwned + Send,
    {
        let gate = self
            .tracker
            .gate(resource_key, self.config.max_in_flight_per_key);
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            permit = gate.acquire_owned() => permit
                .map_err(|_| DispatchError::Transport("dispatch gate closed".to_string()))?,
        };

        if self.config.probe_on_first_use && !self.tracker.is_initialized(resource_key).await {
            let probed = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                probed = self.tracker.initialize(resource_key, self.client.as_ref()) => probed,
            };
            if probed {
                self.emit(DispatchEvent::QuotaInitialized {
                    key: resource_key.to_string(),
                })
                .await;
            }
        }

        let mut attempts = 0;
        let mut rate_limited = 0;
        let mut malformed = 0;
        let mut last_malformed: Option<(String, String)> = None;

        loop {
            let reservation = self.admit(resource_key, estimated_cost, cancel).await?;

            attempts += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    self.tracker.release(resource_key, &reservation).await;
                    return Err(DispatchError::Cancelled);
                }
                result = self.client.send_message(request) => result,
            };
            // Malformed output still consumed tokens; the reservation stands in
            // for the unreported usage.
            if matches!(
                result,
                Err(ClientError::RateLimited { .. } | ClientError::Transport { .. })
            ) {
                self.tracker.release(resource_key, &reservation).await;
            }

            match result {
                Ok(completion) => {
                    self.tracker
                        .settle(
                            resource_key,
                            &reservation,
                            completion.rate_limits.as_ref(),
                            completion.usage.as_ref(),
                        )
                        .await;

                    match parse_structured::<T>(&completion.content) {
                        Ok(payload) => {
                            self.emit(DispatchEvent::CallCompleted {
                                key: resource_key.to_string(),
                                attempts,
                                total_tokens: completion.usage.as_ref().map(|u| u.total_tokens),
                            })
                            .await;
                            return Ok(payload);
                        }
                        Err(reason) => {
                            if let Some(payload) = repair::<T>(&completion.content) {
                                log::info!(
                                    "parley::dispatch: repaired malformed output for '{}'",
                                    resource_key
                                );
                                self.emit(DispatchEvent::Repaired {
                                    key: resource_key.to_string(),
                                })
                                .await;
                                return Ok(payload);
                            }
                            malformed += 1;
                            last_malformed = Some((completion.content, reason));
                        }
                    }
                }
                Err(ClientError::RateLimited {
                    message,
                    retry_after,
                }) => {
                    rate_limited += 1;
                    let failure = RateLimitFailure {
                        message,
                        retry_after,
                    };
                    let wait = self.tracker.update_from_failure(resource_key, &failure).await;
                    self.emit(DispatchEvent::RateLimited {
                        key: resource_key.to_string(),
                        attempt: rate_limited,
                        retry_after_ms: wait.as_millis() as u64,
                    })
                    .await;
                    if rate_limited >= self.config.max_rate_limit_attempts {
                        log::error!(
                            "parley::dispatch: giving up on '{}' after {} rate-limited attempts",
                            resource_key,
                            rate_limited
                        );
                        return Err(DispatchError::RateLimitExhausted {
                            key: resource_key.to_string(),
                            attempts: rate_limited,
                        });
                    }
                    continue;
                }
                Err(ClientError::MalformedOutput {
                    message,
                    failed_generation,
                }) => {
                    malformed += 1;
                    last_malformed = Some((failed_generation.unwrap_or_default(), message));
                }
                Err(err @ ClientError::Transport { .. }) => {
                    log::error!("parley::dispatch: transport failure for '{}': {}", resource_key, err);
                    return Err(DispatchError::Transport(err.to_string()));
                }
            }

            self.emit(DispatchEvent::MalformedOutput {
                key: resource_key.to_string(),
                attempt: malformed,
            })
            .await;

            if malformed > self.config.max_malformed_retries {
                let (raw, reason) = last_malformed.unwrap_or_default();
                if let Some(payload) = repair::<T>(&raw) {
                    self.emit(DispatchEvent::Repaired {
                        key: resource_key.to_string(),
                    })
                    .await;
                    return Ok(payload);
                }
                log::error!(
                    "parley::dispatch: output for '{}' still malformed after {} attempts",
                    resource_key,
                    malformed
                );
                return Err(DispatchError::Parse { raw, reason });
            }

            log::warn!(
                "parley::dispatch: malformed output for '{}' (attempt {}), resending",
                resource_key,
                malformed
            );
            sleep_or_cancel(self.config.malformed_retry_delay(), cancel).await?;
        }
    }

    /// Sleep until the tracker admits the call, then return its reservation.
    async fn admit(
        &self,
        key: &str,
        estimated_cost: u64,
        cancel: &CancellationToken,
    ) -> Result<Reservation, DispatchError> {
        loop {
            let (wait, reason) = match self.tracker.try_acquire(key, estimated_cost).await {
                Admission::Granted(reservation) => return Ok(reservation),
                Admission::Proactive(until_reset) => {
                    log::info!(
                        "parley::dispatch: estimated {} tokens exceed budget for '{}'",
                        estimated_cost,
                        key
                    );
                    (until_reset + self.config.reset_buffer(), WaitReason::Proactive)
                }
                Admission::Reactive(required) => {
                    log::info!("parley::dispatch: quota for '{}' exhausted", key);
                    (required + self.jitter(), WaitReason::Reactive)
                }
            };
            self.emit(DispatchEvent::QuotaWait {
                key: key.to_string(),
                wait_ms: wait.as_millis() as u64,
                reason,
            })
            .await;
            log::debug!("parley::dispatch: sleeping {} ms for '{}'", wait.as_millis(), key);
            sleep_or_cancel(wait, cancel).await?;
        }
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> Result<(), DispatchError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DispatchError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
