//! Negotiation and dispatch event system.
//!
//! Provides a callback-based observability layer for the orchestrator and the
//! dispatch client. Implement [`EventHandler`] to receive real-time
//! notifications about:
//!
//! - **Quota handling**: probe seeding, proactive and reactive waits, rate-limit retries
//! - **Malformed output**: retries and successful repairs
//! - **Elicitation**: per-party turns and completion (natural or forced)
//! - **Rounds**: phase boundaries, proposal selection, party responses, convergence checks
//!
//! # Architecture
//!
//! Events flow through a single [`EventHandler`] trait with two methods:
//! - [`on_dispatch_event`](EventHandler::on_dispatch_event) receives [`DispatchEvent`]s
//! - [`on_negotiation_event`](EventHandler::on_negotiation_event) receives [`NegotiationEvent`]s
//!
//! Both methods default to no-ops, so you only override what you care about.
//! When a handler is registered on an [`Orchestrator`](crate::orchestrator::Orchestrator)
//! via [`with_event_handler`](crate::orchestrator::Orchestrator::with_event_handler)
//! and the oracle is a [`DispatchOracle`](crate::oracle::DispatchOracle), hand
//! the same `Arc` to the oracle's dispatch client to see both streams in one place.
//!
//! # Example
//!
//! ```rust,no_run
//! use parley::event::{DispatchEvent, EventHandler, NegotiationEvent};
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_dispatch_event(&self, event: &DispatchEvent) {
//!         if let DispatchEvent::QuotaWait { key, wait_ms, .. } = event {
//!             println!("waiting {} ms for {}", wait_ms, key);
//!         }
//!     }
//!     async fn on_negotiation_event(&self, event: &NegotiationEvent) {
//!         println!("{:?}", event);
//!     }
//! }
//! ```

use crate::parley::model::{ElicitationSignal, ResponseType, RoundOutcome};
use async_trait::async_trait;

/// Why the dispatch client is sleeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    /// The estimated cost exceeds the known per-minute token budget.
    Proactive,
    /// A bucket is exhausted and its reset time lies in the future.
    Reactive,
}

/// Events emitted by the [`DispatchClient`](crate::dispatch::DispatchClient).
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// The quota record for `key` was seeded from a probe call.
    QuotaInitialized { key: String },

    /// The client is about to sleep for `wait_ms` (jitter included).
    QuotaWait {
        key: String,
        wait_ms: u64,
        reason: WaitReason,
    },

    /// The provider rejected attempt `attempt` with a rate-limit error.
    RateLimited {
        key: String,
        attempt: usize,
        retry_after_ms: u64,
    },

    /// The oracle returned output that did not parse into the expected schema.
    MalformedOutput { key: String, attempt: usize },

    /// A malformed payload was accepted after structural repair.
    Repaired { key: String },

    /// The call returned a parsed payload.
    CallCompleted {
        key: String,
        attempts: usize,
        total_tokens: Option<usize>,
    },
}

/// Negotiation phases, as reported in events and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Elicitation,
    Structuring,
    Synthesis,
    Contextualization,
    Response,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Elicitation => "elicitation",
            Phase::Structuring => "structuring",
            Phase::Synthesis => "synthesis",
            Phase::Contextualization => "contextualization",
            Phase::Response => "response",
        }
    }
}

/// Events emitted by the [`Orchestrator`](crate::orchestrator::Orchestrator).
///
/// # Event Flow
///
/// ```text
/// RunStarted
///   └─ per party: ElicitationStarted → ElicitationTurn* → ElicitationCompleted
///   └─ per round:
///       RoundStarted
///       PhaseCompleted { Structuring }
///       PhaseCompleted { Synthesis }
///       ProposalSelected
///       PartyResponded*           (one per party)
///       ConvergenceChecked
/// RunCompleted
/// ```
#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    RunStarted {
        negotiation_id: String,
        party_count: usize,
        max_rounds: usize,
    },

    ElicitationStarted { party_id: String },

    /// One oracle turn of the elicitation sub-loop (1-based).
    ElicitationTurn {
        party_id: String,
        turn: usize,
        signal: ElicitationSignal,
        new_tags: usize,
    },

    /// `forced` is true when the turn cap ended elicitation, not the oracle.
    ElicitationCompleted {
        party_id: String,
        turns: usize,
        tag_count: usize,
        forced: bool,
    },

    RoundStarted { round: usize },

    PhaseCompleted { round: usize, phase: Phase },

    ProposalSelected {
        round: usize,
        index: usize,
        candidates: usize,
    },

    PartyResponded {
        round: usize,
        party_id: String,
        response_type: ResponseType,
    },

    ConvergenceChecked {
        round: usize,
        converged: bool,
        outcome: RoundOutcome,
    },

    /// `terminal` is the state name: `converged`, `diverged` or `failed`.
    RunCompleted {
        negotiation_id: String,
        rounds: usize,
        terminal: String,
    },
}

/// Receives dispatch and negotiation events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_dispatch_event(&self, _event: &DispatchEvent) {}

    async fn on_negotiation_event(&self, _event: &NegotiationEvent) {}
}
