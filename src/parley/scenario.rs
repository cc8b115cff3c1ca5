//! Scenario harness.
//!
//! A [`Scenario`] bundles a desired outcome, the personas taking part and the
//! run configuration; it loads from JSON. [`ScenarioRunner::run`] drives one
//! negotiation under an optional wall-clock budget and always returns a
//! [`ScenarioResult`], whether the negotiation converged, diverged, failed,
//! was cancelled or ran out of time. The result carries every recorded round
//! and the validator's verdict on each non-negotiable.
//!
//! ```rust,no_run
//! use parley::clients::openai_compat::OpenAICompatClient;
//! use parley::scenario::{dispatch_oracle, Scenario, ScenarioRunner};
//! use std::sync::Arc;
//!
//! # async {
//! let scenario = Scenario::load("scenarios/team-dinner.json").unwrap();
//! let client = Arc::new(OpenAICompatClient::new("https://api.groq.com/openai/v1", "key", "llama-3.3-70b-versatile"));
//! let oracle = dispatch_oracle(client, &scenario, None);
//!
//! let result = ScenarioRunner::new(oracle.clone(), oracle).run(&scenario).await;
//! println!("{}", serde_json::to_string_pretty(&result).unwrap());
//! # };
//! ```

use crate::parley::client_wrapper::ClientWrapper;
use crate::parley::config::{DispatchConfig, NegotiationConfig, ScenarioConfig};
use crate::parley::convergence::{self, SuccessJudgment};
use crate::parley::dispatch::DispatchClient;
use crate::parley::event::EventHandler;
use crate::parley::model::{NegotiationState, PartyResponse, Persona, RoundRecord};
use crate::parley::oracle::{DispatchOracle, PartyChannel, Proposal, SemanticOracle, Tension};
use crate::parley::orchestrator::{NegotiationError, NegotiationOutcome, Orchestrator, TerminalState};
use crate::parley::validator::{self, ConstraintVerdict};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum ScenarioError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioError::Io(e) => write!(f, "Failed to read scenario: {}", e),
            ScenarioError::Json(e) => write!(f, "Invalid scenario: {}", e),
        }
    }
}

impl Error for ScenarioError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ScenarioError::Io(e) => Some(e),
            ScenarioError::Json(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for ScenarioError {
    fn from(e: std::io::Error) -> Self {
        ScenarioError::Io(e)
    }
}

impl From<serde_json::Error> for ScenarioError {
    fn from(e: serde_json::Error) -> Self {
        ScenarioError::Json(e)
    }
}

/// A negotiation to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    pub personas: Vec<Persona>,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub run: ScenarioConfig,
}

impl Scenario {
    pub fn new(name: impl Into<String>, outcome: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: outcome.into(),
            creator_id: None,
            personas: Vec::new(),
            negotiation: NegotiationConfig::default(),
            dispatch: DispatchConfig::default(),
            run: ScenarioConfig::default(),
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.personas.push(persona);
        self
    }

    pub fn with_negotiation(mut self, config: NegotiationConfig) -> Self {
        self.negotiation = config;
        self
    }

    pub fn with_wall_clock_budget_ms(mut self, budget_ms: u64) -> Self {
        self.run.wall_clock_budget_ms = Some(budget_ms);
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&text)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioStatus {
    Converged,
    Diverged,
    Failed,
    Cancelled,
    TimedOut,
}

/// Structured report of one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub scenario: String,
    pub negotiation_id: String,
    pub status: ScenarioStatus,
    pub success: bool,
    pub acceptance_rate: f64,
    pub opt_outs: usize,
    pub satisfied: Vec<ConstraintVerdict>,
    pub violated: Vec<ConstraintVerdict>,
    pub waived: Vec<ConstraintVerdict>,
    pub rounds: Vec<RoundRecord>,
    pub final_proposal: Option<Proposal>,
    pub tensions: Vec<Tension>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScenarioResult {
    pub fn converged(&self) -> bool {
        self.status == ScenarioStatus::Converged
    }
}

/// Build a [`DispatchOracle`] for `scenario` over `client`, using the
/// scenario's dispatch settings and the process-wide quota tracker.
pub fn dispatch_oracle(
    client: Arc<dyn ClientWrapper>,
    scenario: &Scenario,
    event_handler: Option<Arc<dyn EventHandler>>,
) -> Arc<DispatchOracle> {
    let mut dispatch = DispatchClient::new(client).with_config(scenario.dispatch.clone());
    if let Some(handler) = event_handler {
        dispatch = dispatch.with_event_handler(handler);
    }
    Arc::new(DispatchOracle::new(Arc::new(dispatch)))
}

/// Runs scenarios against one oracle.
pub struct ScenarioRunner {
    oracle: Arc<dyn SemanticOracle>,
    channel: Arc<dyn PartyChannel>,
    event_handler: Option<Arc<dyn EventHandler>>,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    pub fn new(oracle: Arc<dyn SemanticOracle>, channel: Arc<dyn PartyChannel>) -> Self {
        Self {
            oracle,
            channel,
            event_handler: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Cancelling `token` aborts every run started afterwards.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub async fn run(&self, scenario: &Scenario) -> ScenarioResult {
        let started = Instant::now();
        let cancel = self.cancel.child_token();

        let mut orchestrator = Orchestrator::new(
            scenario.outcome.clone(),
            Arc::clone(&self.oracle),
            Arc::clone(&self.channel),
        )
        .with_config(scenario.negotiation.clone())
        .with_cancellation(cancel.clone());
        if let Some(creator) = &scenario.creator_id {
            orchestrator = orchestrator.with_creator(creator.clone());
        }
        if let Some(handler) = &self.event_handler {
            orchestrator = orchestrator.with_event_handler(Arc::clone(handler));
        }

        for persona in &scenario.personas {
            if let Err(err) = orchestrator.add_party(persona.clone()) {
                log::error!("parley::scenario: '{}' rejected: {}", scenario.name, err);
                return report(scenario, orchestrator.state(), Err(err), false, started);
            }
        }

        let mut timed_out = false;
        let result = match scenario.run.wall_clock_budget() {
            Some(budget) => {
                tokio::select! {
                    result = orchestrator.run() => result,
                    _ = tokio::time::sleep(budget) => {
                        log::warn!(
                            "parley::scenario: '{}' exceeded its {} ms budget",
                            scenario.name,
                            budget.as_millis()
                        );
                        timed_out = true;
                        cancel.cancel();
                        Err(NegotiationError::Cancelled)
                    }
                }
            }
            None => orchestrator.run().await,
        };

        report(scenario, orchestrator.state(), result, timed_out, started)
    }
}

/// Run `scenario` with a fresh [`ScenarioRunner`].
pub async fn run_scenario(
    scenario: &Scenario,
    oracle: Arc<dyn SemanticOracle>,
    channel: Arc<dyn PartyChannel>,
) -> ScenarioResult {
    ScenarioRunner::new(oracle, channel).run(scenario).await
}

fn report(
    scenario: &Scenario,
    state: &NegotiationState,
    result: Result<NegotiationOutcome, NegotiationError>,
    timed_out: bool,
    started: Instant,
) -> ScenarioResult {
    let last_responses = || -> BTreeMap<String, PartyResponse> {
        state.last_round().map(|r| r.responses.clone()).unwrap_or_default()
    };

    let (status, converged, final_responses, final_proposal, tensions, error) = match result {
        Ok(outcome) => {
            let (status, error) = match &outcome.terminal {
                TerminalState::Converged { .. } => (ScenarioStatus::Converged, None),
                TerminalState::Diverged { .. } => (ScenarioStatus::Diverged, None),
                TerminalState::Failed { phase, round, reason } => (
                    ScenarioStatus::Failed,
                    Some(format!("{} output unusable in round {}: {}", phase.as_str(), round, reason)),
                ),
            };
            let converged = outcome.converged();
            (
                status,
                converged,
                outcome.final_responses,
                outcome.final_proposal,
                outcome.tensions,
                error,
            )
        }
        Err(err) => {
            let status = match err {
                NegotiationError::Cancelled if timed_out => ScenarioStatus::TimedOut,
                NegotiationError::Cancelled => ScenarioStatus::Cancelled,
                _ => ScenarioStatus::Failed,
            };
            let last = state.last_round();
            (
                status,
                false,
                last_responses(),
                last.and_then(|r| r.selected_proposal.and_then(|i| r.synthesis.proposals.get(i)).cloned()),
                last.map(|r| r.synthesis.tensions.clone()).unwrap_or_default(),
                Some(err.to_string()),
            )
        }
    };

    let validation = validator::validate(state, &final_responses);
    let SuccessJudgment {
        acceptance_rate,
        opt_outs,
        success,
        ..
    } = convergence::evaluate_success(converged, &final_responses, &validation, &scenario.negotiation.success);

    ScenarioResult {
        scenario: scenario.name.clone(),
        negotiation_id: state.id.clone(),
        status,
        success,
        acceptance_rate,
        opt_outs,
        satisfied: validation.satisfied,
        violated: validation.violated,
        waived: validation.waived,
        rounds: state.rounds().to_vec(),
        final_proposal,
        tensions,
        elapsed_ms: started.elapsed().as_millis() as u64,
        error,
    }
}
