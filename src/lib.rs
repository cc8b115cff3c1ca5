//! # Parley
//!
//! Parley is a Rust engine for bounded, multi-round negotiations among several
//! parties, each holding private constraints and desires. It drives the parties
//! toward one proposal a majority can accept, and reports honestly when that is
//! impossible.
//!
//! The crate provides layered abstractions for:
//!
//! * **Quota-aware dispatch**: [`dispatch::DispatchClient`] issues structured calls
//!   to a rate-limited language model, waiting only as long as the provider's
//!   reported reset times require, retrying rate-limited and malformed calls a
//!   bounded number of times and repairing malformed JSON when it can
//! * **Shared quota tracking**: [`quota::QuotaTracker`] keeps one record per
//!   resource key, shared by every caller targeting that key
//! * **Negotiation orchestration**: [`orchestrator::Orchestrator`] runs per-party
//!   elicitation, then rounds of problem structuring, synthesis,
//!   contextualization and response collection until convergence or the round
//!   budget runs out
//! * **Result validation**: [`validator`] checks every non-negotiable constraint
//!   against its owner's final response
//! * **Scenario runs**: [`scenario::ScenarioRunner`] applies a wall-clock budget and
//!   always returns a serializable [`scenario::ScenarioResult`]
//! * **Pluggable reasoning**: the [`oracle::SemanticOracle`] trait has one method
//!   per phase; [`oracle::DispatchOracle`] implements it over any
//!   [`ClientWrapper`], and tests substitute deterministic implementations
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use parley::clients::openai_compat::OpenAICompatClient;
//! use parley::model::{Persona, PersonaConstraint, Severity};
//! use parley::scenario::{dispatch_oracle, Scenario, ScenarioRunner};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     parley::init_logger();
//!
//!     let scenario = Scenario::new("dinner", "Choose a restaurant for the team dinner")
//!         .with_persona(Persona::new("alice", "Alice").with_constraint(
//!             PersonaConstraint::concern("Vegan options on the menu", Severity::NonNegotiable, 0.0),
//!         ))
//!         .with_persona(Persona::new("bob", "Bob").with_constraint(
//!             PersonaConstraint::concern("Within walking distance of the office", Severity::StrongPreference, 0.4),
//!         ))
//!         .with_wall_clock_budget_ms(600_000);
//!
//!     let client = Arc::new(OpenAICompatClient::new(
//!         "https://api.groq.com/openai/v1",
//!         &std::env::var("GROQ_API_KEY")?,
//!         "llama-3.3-70b-versatile",
//!     ));
//!     let oracle = dispatch_oracle(client, &scenario, None);
//!
//!     let result = ScenarioRunner::new(oracle.clone(), oracle).run(&scenario).await;
//!     println!("{:?}: success={}", result.status, result.success);
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications opt in to `RUST_LOG` driven diagnostics; the library itself only
/// writes through the [`log`] facade.
///
/// ```rust
/// parley::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

pub mod parley;

// Re-exporting key items for easier external access.
pub use parley::client_wrapper;
pub use parley::client_wrapper::{ChatRequest, ClientError, ClientWrapper, Completion, Message, Role};
pub use parley::clients;
pub use parley::config;
pub use parley::config::{DispatchConfig, NegotiationConfig, ProposalPolicy, ScenarioConfig, SuccessCriteria};
pub use parley::convergence;
pub use parley::dispatch;
pub use parley::dispatch::{DispatchClient, DispatchError};
pub use parley::event;
pub use parley::event::{DispatchEvent, EventHandler, NegotiationEvent};
pub use parley::json_repair;
pub use parley::model;
pub use parley::oracle;
pub use parley::oracle::{DispatchOracle, PartyChannel, SemanticOracle};
pub use parley::orchestrator;
pub use parley::orchestrator::{NegotiationError, NegotiationOutcome, Orchestrator};
pub use parley::phases;
pub use parley::quota;
pub use parley::quota::QuotaTracker;
pub use parley::scenario;
pub use parley::scenario::{run_scenario, Scenario, ScenarioResult, ScenarioRunner};
pub use parley::validator;
