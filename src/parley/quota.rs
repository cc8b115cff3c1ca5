//! Per-resource quota tracking.
//!
//! A [`QuotaTracker`] is a keyed store mapping a resource key (normally a model
//! identifier) to a [`QuotaState`]. Remote providers enforce their limits per
//! account and key, not per connection, so one tracker must be shared by every
//! caller that targets the same resource; [`QuotaTracker::global`] hands out the
//! process-wide instance.
//!
//! Each record sits behind its own `tokio::sync::Mutex`.
//! [`QuotaTracker::try_acquire`] decides whether a call may go out and
//! reserves its estimated cost under that one lock, so two callers never spend
//! the same remaining budget. The reservation is settled against the actual
//! usage once the response arrives. The per-key in-flight gate also lives in
//! the tracker, so every dispatch client sharing the tracker shares the gate.
//!
//! ```rust
//! use parley::quota::{parse_duration, QuotaTracker, RateLimitFailure};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! assert_eq!(parse_duration("2h26m52.8s"), Some(Duration::from_millis(8_812_800)));
//!
//! let tracker = QuotaTracker::new();
//! assert_eq!(tracker.wait_ms("llama-3.3-70b").await, 0);
//!
//! tracker
//!     .update_from_failure(
//!         "llama-3.3-70b",
//!         &RateLimitFailure::new("Rate limit reached on tokens per minute (TPM). Please try again in 5s."),
//!     )
//!     .await;
//! assert!(tracker.wait_ms("llama-3.3-70b").await > 4_000);
//! # }
//! ```

use crate::parley::client_wrapper::{ChatRequest, ClientError, ClientWrapper, RateLimitSnapshot, TokenUsage};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

/// Wait applied when a rate-limit failure carries no usable hint and the
/// tracker has no known reset time for the exhausted bucket.
pub const FALLBACK_RETRY: Duration = Duration::from_secs(10);

lazy_static! {
    static ref GLOBAL_TRACKER: Arc<QuotaTracker> = Arc::new(QuotaTracker::new());
}

/// The quota bucket a rate-limit failure refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaBucket {
    Requests,
    TokensPerMinute,
    TokensPerDay,
}

/// Remaining budget for a single bucket.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Budget {
    /// Last known ceiling for the bucket, restored once its reset time passes.
    pub limit: Option<u64>,
    /// Remaining units, or `None` when the provider never told us.
    pub remaining: Option<u64>,
    /// When the bucket refills.
    pub reset_at: Option<Instant>,
}

impl Budget {
    /// How long a caller must wait before this bucket has budget again.
    pub fn wait(&self, now: Instant) -> Duration {
        match (self.remaining, self.reset_at) {
            (Some(0), Some(reset_at)) => reset_at.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }

    fn exhaust_for(&mut self, wait: Duration, now: Instant) {
        self.remaining = Some(0);
        self.reset_at = Some(now + wait);
    }

    fn apply(&mut self, limit: Option<u64>, remaining: Option<u64>, reset: Option<Duration>, now: Instant) {
        if limit.is_some() {
            self.limit = limit;
        }
        if remaining.is_some() {
            self.remaining = remaining;
        }
        if let Some(reset) = reset {
            self.reset_at = Some(now + reset);
        }
    }
}

/// Quota record for one resource key.
#[derive(Clone, Debug, Default)]
pub struct QuotaState {
    pub requests: Budget,
    pub tokens_per_minute: Budget,
    /// Rarely reported on success; filled in from "tokens per day" failures.
    pub tokens_per_day: Budget,
    pub last_updated: Option<DateTime<Utc>>,
    pub initialized: bool,
    /// Bumped by every authoritative overwrite; reservations taken before it
    /// are already accounted for and are not released.
    generation: u64,
}

/// Budget deducted for one in-flight call by [`QuotaTracker::try_acquire`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reservation {
    pub tokens: u64,
    pub requests: u64,
    generation: u64,
}

/// Outcome of [`QuotaTracker::try_acquire`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Budget is available and the call's estimate has been reserved.
    Granted(Reservation),
    /// The estimate exceeds the known per-minute budget; wait this long for
    /// its reset.
    Proactive(Duration),
    /// A bucket is exhausted; wait this long for its reset.
    Reactive(Duration),
}

impl QuotaState {
    /// The longest of all currently active wait requirements.
    pub fn wait(&self, now: Instant) -> Duration {
        self.requests
            .wait(now)
            .max(self.tokens_per_minute.wait(now))
            .max(self.tokens_per_day.wait(now))
    }

    fn bucket_mut(&mut self, bucket: QuotaBucket) -> &mut Budget {
        match bucket {
            QuotaBucket::Requests => &mut self.requests,
            QuotaBucket::TokensPerMinute => &mut self.tokens_per_minute,
            QuotaBucket::TokensPerDay => &mut self.tokens_per_day,
        }
    }

    /// Restore the per-minute budget to its ceiling once its reset time has
    /// passed. Without a known ceiling the budget becomes unknown.
    fn expire_minute_budget(&mut self, now: Instant) {
        let budget = &mut self.tokens_per_minute;
        if budget.reset_at.is_some_and(|reset_at| reset_at <= now) {
            budget.remaining = budget.limit;
            budget.reset_at = None;
            self.generation += 1;
        }
    }

    /// Time until the per-minute budget resets, when `estimated_cost` exceeds
    /// a known, non-zero remaining budget with a known reset. An exhausted
    /// bucket is a reactive wait; an unknown reset is left to the provider.
    fn proactive_wait(&self, estimated_cost: u64, now: Instant) -> Option<Duration> {
        let budget = &self.tokens_per_minute;
        let remaining = budget.remaining?;
        if remaining == 0 || estimated_cost <= remaining {
            return None;
        }
        budget
            .reset_at
            .map(|reset_at| reset_at.saturating_duration_since(now))
            .filter(|wait| !wait.is_zero())
    }

    fn reserve(&mut self, estimated_cost: u64) -> Reservation {
        let mut reservation = Reservation {
            generation: self.generation,
            ..Reservation::default()
        };
        if let Some(remaining) = self.tokens_per_minute.remaining.as_mut() {
            reservation.tokens = estimated_cost.min(*remaining);
            *remaining -= reservation.tokens;
        }
        if let Some(remaining) = self.requests.remaining.as_mut() {
            reservation.requests = (*remaining).min(1);
            *remaining -= reservation.requests;
        }
        reservation
    }

    /// Give back what `reservation` deducted, unless an authoritative update
    /// has replaced the counts since.
    fn release(&mut self, reservation: &Reservation) {
        if reservation.generation != self.generation {
            return;
        }
        restore(&mut self.tokens_per_minute, reservation.tokens);
        restore(&mut self.requests, reservation.requests);
    }

    fn apply_snapshot(&mut self, snapshot: &RateLimitSnapshot, now: Instant) {
        self.requests.apply(
            snapshot.limit_requests,
            snapshot.remaining_requests,
            snapshot.reset_requests,
            now,
        );
        self.tokens_per_minute.apply(
            snapshot.limit_tokens,
            snapshot.remaining_tokens,
            snapshot.reset_tokens,
            now,
        );
        self.last_updated = Some(Utc::now());
        self.generation += 1;
    }

    fn apply_usage(&mut self, usage: &TokenUsage) {
        if let Some(remaining) = self.tokens_per_minute.remaining.as_mut() {
            *remaining = remaining.saturating_sub(usage.total_tokens as u64);
        }
        if let Some(remaining) = self.tokens_per_day.remaining.as_mut() {
            *remaining = remaining.saturating_sub(usage.total_tokens as u64);
        }
        if let Some(remaining) = self.requests.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }
        self.last_updated = Some(Utc::now());
    }
}

fn restore(budget: &mut Budget, amount: u64) {
    if let Some(remaining) = budget.remaining.as_mut() {
        let restored = *remaining + amount;
        *remaining = budget.limit.map_or(restored, |limit| restored.min(limit));
    }
}

/// A rate-limit error as seen by the tracker.
#[derive(Clone, Debug)]
pub struct RateLimitFailure {
    pub message: String,
    /// Explicit `retry-after`, preferred over anything parsed from `message`.
    pub retry_after: Option<Duration>,
}

impl RateLimitFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

/// Keyed store of [`QuotaState`] records.
pub struct QuotaTracker {
    entries: StdMutex<HashMap<String, Arc<Mutex<QuotaState>>>>,
    gates: StdMutex<HashMap<String, Arc<Semaphore>>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            gates: StdMutex::new(HashMap::new()),
        }
    }

    /// The process-wide tracker shared by every dispatch client that does not
    /// bring its own.
    pub fn global() -> Arc<QuotaTracker> {
        Arc::clone(&GLOBAL_TRACKER)
    }

    fn entry(&self, key: &str) -> Arc<Mutex<QuotaState>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(entries.entry(key.to_string()).or_default())
    }

    /// The in-flight gate for `key`. The first caller fixes its permit count.
    pub fn gate(&self, key: &str, permits: usize) -> Arc<Semaphore> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            gates
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits.max(1)))),
        )
    }

    /// Seed `key` from one minimal probe call. Runs at most once per key; the
    /// record lock is held across the probe so concurrent first callers wait
    /// for it instead of probing again.
    ///
    /// Returns `true` when this call performed the probe. A failed probe is not
    /// fatal: the key is still marked initialized and the first real call will
    /// learn the quota from its own response.
    pub async fn initialize(&self, key: &str, client: &dyn ClientWrapper) -> bool {
        let entry = self.entry(key);
        let mut state = entry.lock().await;
        if state.initialized {
            return false;
        }

        match client.send_message(&ChatRequest::probe()).await {
            Ok(completion) => {
                if let Some(snapshot) = &completion.rate_limits {
                    state.apply_snapshot(snapshot, Instant::now());
                }
                log::debug!("parley::quota: seeded quota for '{}' from probe", key);
            }
            Err(ClientError::RateLimited {
                message,
                retry_after,
            }) => {
                let failure = RateLimitFailure {
                    message,
                    retry_after,
                };
                apply_failure(&mut state, &failure, Instant::now());
                log::warn!("parley::quota: probe for '{}' was rate limited", key);
            }
            Err(err) => {
                log::warn!("parley::quota: probe for '{}' failed (non-fatal): {}", key, err);
            }
        }

        state.initialized = true;
        true
    }

    pub async fn is_initialized(&self, key: &str) -> bool {
        self.entry(key).lock().await.initialized
    }

    /// Overwrite remaining counts and reset times with the provider's
    /// authoritative metadata. Without metadata, the known budget is reduced by
    /// the tokens the call actually used.
    pub async fn update_from_success(
        &self,
        key: &str,
        snapshot: Option<&RateLimitSnapshot>,
        usage: Option<&TokenUsage>,
    ) {
        self.settle(key, &Reservation::default(), snapshot, usage).await;
    }

    /// Settle a granted call. Metadata overwrites the record; otherwise the
    /// reservation is swapped for the actual usage, or kept as the best
    /// estimate when the response reports neither.
    pub async fn settle(
        &self,
        key: &str,
        reservation: &Reservation,
        snapshot: Option<&RateLimitSnapshot>,
        usage: Option<&TokenUsage>,
    ) {
        let entry = self.entry(key);
        let mut state = entry.lock().await;
        match (snapshot, usage) {
            (Some(snapshot), _) if !snapshot.is_empty() => {
                state.apply_snapshot(snapshot, Instant::now())
            }
            (_, Some(usage)) => {
                state.release(reservation);
                state.apply_usage(usage);
            }
            _ => {}
        }
    }

    /// Return a reservation whose call consumed nothing.
    pub async fn release(&self, key: &str, reservation: &Reservation) {
        self.entry(key).lock().await.release(reservation);
    }

    /// Zero the exhausted bucket and set its reset time from the failure's
    /// retry hint. Returns the wait that was recorded.
    pub async fn update_from_failure(&self, key: &str, failure: &RateLimitFailure) -> Duration {
        let entry = self.entry(key);
        let mut state = entry.lock().await;
        let wait = apply_failure(&mut state, failure, Instant::now());
        log::info!(
            "parley::quota: '{}' rate limited ({:?}), waiting {} ms",
            key,
            classify_bucket(&failure.message),
            wait.as_millis()
        );
        wait
    }

    /// Maximum of all active wait requirements for `key`, in milliseconds.
    /// Zero whenever every bucket has budget or its reset time has passed.
    pub async fn wait_ms(&self, key: &str) -> u64 {
        self.wait(key).await.as_millis() as u64
    }

    pub async fn wait(&self, key: &str) -> Duration {
        self.entry(key).lock().await.wait(Instant::now())
    }

    /// Decide whether a call costing `estimated_cost` may go out now and, if
    /// so, reserve its budget. Decision and deduction happen under one lock.
    pub async fn try_acquire(&self, key: &str, estimated_cost: u64) -> Admission {
        let entry = self.entry(key);
        let mut state = entry.lock().await;
        let now = Instant::now();
        state.expire_minute_budget(now);

        let required = state.wait(now);
        if !required.is_zero() {
            return Admission::Reactive(required);
        }
        if let Some(until_reset) = state.proactive_wait(estimated_cost, now) {
            return Admission::Proactive(until_reset);
        }
        Admission::Granted(state.reserve(estimated_cost))
    }

    /// Copy of the current record for `key`.
    pub async fn snapshot(&self, key: &str) -> QuotaState {
        self.entry(key).lock().await.clone()
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_failure(state: &mut QuotaState, failure: &RateLimitFailure, now: Instant) -> Duration {
    let bucket = classify_bucket(&failure.message);
    let budget = state.bucket_mut(bucket);
    let wait = failure
        .retry_after
        .or_else(|| parse_retry_hint(&failure.message))
        .or_else(|| {
            budget
                .reset_at
                .map(|reset_at| reset_at.saturating_duration_since(now))
                .filter(|d| !d.is_zero())
        })
        .unwrap_or(FALLBACK_RETRY);
    budget.exhaust_for(wait, now);
    state.last_updated = Some(Utc::now());
    state.generation += 1;
    wait
}

/// Infer which bucket a rate-limit message is about.
pub fn classify_bucket(message: &str) -> QuotaBucket {
    let lower = message.to_ascii_lowercase();
    if lower.contains("per day") || lower.contains("(tpd)") || lower.contains("daily") {
        QuotaBucket::TokensPerDay
    } else if lower.contains("requests per") || lower.contains("(rpm)") || lower.contains("(rpd)") {
        QuotaBucket::Requests
    } else {
        QuotaBucket::TokensPerMinute
    }
}

/// Find a human-readable wait in an error message, e.g.
/// `"... Please try again in 2h26m52.8s."`.
pub fn parse_retry_hint(message: &str) -> Option<Duration> {
    let lower = message.to_ascii_lowercase();
    for marker in ["try again in ", "retry after ", "retry in "] {
        if let Some(index) = lower.find(marker) {
            let rest = &lower[index + marker.len()..];
            let token = rest.split_whitespace().next()?;
            let token = token.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ')' | '"'));
            if let Some(duration) = parse_duration(token) {
                return Some(duration);
            }
        }
    }
    None
}

/// Parse provider durations such as `"2h26m52.8s"`, `"50.06s"`, `"2m59.56s"`,
/// `"120ms"` or a bare number of seconds (`"7"`). Rounds up to whole
/// milliseconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(seconds) = text.parse::<f64>() {
        return to_millis(seconds * 1000.0);
    }

    let mut total_ms = 0.0_f64;
    let mut chars = text.chars().peekable();
    let mut parsed_any = false;
    while chars.peek().is_some() {
        let mut number = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit() || *c == '.') {
            number.push(c);
            chars.next();
        }
        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_alphabetic()) {
            unit.push(c);
            chars.next();
        }
        if number.is_empty() || unit.is_empty() {
            return None;
        }
        let value: f64 = number.parse().ok()?;
        let scale = match unit.as_str() {
            "h" => 3_600_000.0,
            "m" => 60_000.0,
            "s" => 1_000.0,
            "ms" => 1.0,
            "us" | "µs" => 0.001,
            _ => return None,
        };
        total_ms += value * scale;
        parsed_any = true;
    }

    if parsed_any {
        to_millis(total_ms)
    } else {
        None
    }
}

fn to_millis(ms: f64) -> Option<Duration> {
    if ms.is_finite() && ms >= 0.0 {
        // Snap to microseconds first so "52.8s" does not ceil to 52_801 ms.
        let ms = (ms * 1000.0).round() / 1000.0;
        Some(Duration::from_millis(ms.ceil() as u64))
    } else {
        None
    }
}
