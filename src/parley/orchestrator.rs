//! The negotiation round loop.
//!
//! An [`Orchestrator`] owns the [`NegotiationState`] and drives it through
//!
//! ```text
//! extracting → { structuring → synthesizing → contextualizing → responding → checking }* → converged | diverged
//! ```
//!
//! Elicitation runs once per party, strictly one party after another, so that
//! parties sharing a quota never contend for it. Each round then structures the
//! problem, synthesizes proposals, contextualizes the selected proposal for
//! every party, collects every party's response, appends an immutable
//! [`RoundRecord`] and checks convergence. Hitting `max_rounds` without
//! convergence ends the run as `diverged`, a normal reportable outcome.
//!
//! A proposal the oracle cannot produce in valid form ends the run as `failed`
//! with the phase and round. Transport failures and cancellation are returned
//! as errors, but the state (every completed round included) stays available
//! through [`Orchestrator::state`].
//!
//! # Example
//!
//! ```rust,no_run
//! use parley::clients::openai_compat::OpenAICompatClient;
//! use parley::dispatch::DispatchClient;
//! use parley::model::{Persona, PersonaConstraint, Severity};
//! use parley::oracle::DispatchOracle;
//! use parley::orchestrator::Orchestrator;
//! use std::sync::Arc;
//!
//! # async {
//! let client = Arc::new(OpenAICompatClient::new(
//!     "https://api.groq.com/openai/v1",
//!     "key",
//!     "llama-3.3-70b-versatile",
//! ));
//! let oracle = Arc::new(DispatchOracle::new(Arc::new(DispatchClient::new(client))));
//!
//! let mut orchestrator = Orchestrator::new("Pick a restaurant for Friday", oracle.clone(), oracle);
//! orchestrator.add_party(
//!     Persona::new("alice", "Alice")
//!         .with_constraint(PersonaConstraint::concern("Vegan options", Severity::NonNegotiable, 0.0)),
//! )?;
//! orchestrator.add_party(Persona::new("bob", "Bob"))?;
//!
//! let outcome = orchestrator.run().await?;
//! println!("{} after {} rounds", outcome.terminal.name(), outcome.rounds);
//! # Ok::<(), parley::orchestrator::NegotiationError>(())
//! # };
//! ```

use crate::parley::config::{NegotiationConfig, ProposalPolicy};
use crate::parley::convergence;
use crate::parley::dispatch::DispatchError;
use crate::parley::event::{EventHandler, NegotiationEvent, Phase};
use crate::parley::model::{NegotiationState, PartyResponse, PartyState, Persona, ResponseType, RoundRecord};
use crate::parley::oracle::{Contextualization, PartyChannel, Proposal, SemanticOracle, Tension};
use crate::parley::phases;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Errors returned by [`Orchestrator::add_party`] and [`Orchestrator::run`].
#[derive(Debug, Clone)]
pub enum NegotiationError {
    /// [`Orchestrator::run`] was called before any party was added.
    NoParties,

    /// A party with this id is already registered.
    DuplicateParty(String),

    /// A phase call failed in a way that ends the run.
    Dispatch {
        phase: Phase,
        round: usize,
        source: DispatchError,
    },

    /// The orchestrator's cancellation token fired.
    Cancelled,
}

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationError::NoParties => write!(f, "No parties in negotiation"),
            NegotiationError::DuplicateParty(id) => write!(f, "Duplicate party: {}", id),
            NegotiationError::Dispatch { phase, round, source } => {
                write!(f, "{} failed in round {}: {}", phase.as_str(), round, source)
            }
            NegotiationError::Cancelled => write!(f, "Negotiation cancelled"),
        }
    }
}

impl Error for NegotiationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NegotiationError::Dispatch { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn dispatch_failure(phase: Phase, round: usize, source: DispatchError) -> NegotiationError {
    match source {
        DispatchError::Cancelled => NegotiationError::Cancelled,
        source => NegotiationError::Dispatch { phase, round, source },
    }
}

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationStage {
    Idle,
    Extracting,
    Structuring,
    Synthesizing,
    Contextualizing,
    Responding,
    Checking,
    Converged,
    Diverged,
    Failed,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum TerminalState {
    /// No party objected in round `round`.
    Converged { round: usize },
    /// The round budget ran out with objections left.
    Diverged { rounds: usize },
    /// The oracle's output for `phase` could not be parsed or repaired.
    Failed {
        phase: Phase,
        round: usize,
        reason: String,
    },
}

impl TerminalState {
    pub fn name(&self) -> &'static str {
        match self {
            TerminalState::Converged { .. } => "converged",
            TerminalState::Diverged { .. } => "diverged",
            TerminalState::Failed { .. } => "failed",
        }
    }
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationOutcome {
    pub negotiation_id: String,
    pub terminal: TerminalState,
    pub rounds: usize,
    /// The proposal voted on in the last recorded round.
    pub final_proposal: Option<Proposal>,
    pub final_responses: BTreeMap<String, PartyResponse>,
    /// Tensions reported by the last synthesis.
    pub tensions: Vec<Tension>,
}

impl NegotiationOutcome {
    pub fn converged(&self) -> bool {
        matches!(self.terminal, TerminalState::Converged { .. })
    }
}

struct Evaluation {
    index: usize,
    contexts: BTreeMap<String, Contextualization>,
    responses: BTreeMap<String, PartyResponse>,
}

impl Evaluation {
    /// Fewest objections first, then most plain accepts.
    fn rank(&self) -> (usize, Reverse<usize>) {
        let count = |t: ResponseType| self.responses.values().filter(|r| r.response_type == t).count();
        (count(ResponseType::Object), Reverse(count(ResponseType::Accept)))
    }
}

/// Drives one negotiation from elicitation to a terminal state.
pub struct Orchestrator {
    state: NegotiationState,
    oracle: Arc<dyn SemanticOracle>,
    channel: Arc<dyn PartyChannel>,
    config: NegotiationConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    cancel: CancellationToken,
    stage: NegotiationStage,
}

impl Orchestrator {
    pub fn new(
        outcome: impl Into<String>,
        oracle: Arc<dyn SemanticOracle>,
        channel: Arc<dyn PartyChannel>,
    ) -> Self {
        Self::from_state(NegotiationState::new(outcome), oracle, channel)
    }

    /// Resume from an existing state, e.g. one with parties already elicited.
    pub fn from_state(
        state: NegotiationState,
        oracle: Arc<dyn SemanticOracle>,
        channel: Arc<dyn PartyChannel>,
    ) -> Self {
        Self {
            state,
            oracle,
            channel,
            config: NegotiationConfig::default(),
            event_handler: None,
            cancel: CancellationToken::new(),
            stage: NegotiationStage::Idle,
        }
    }

    pub fn with_config(mut self, config: NegotiationConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive [`NegotiationEvent`]s. Give the same handler to the
    /// [`DispatchClient`](crate::dispatch::DispatchClient) to see quota events too.
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Abort the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_creator(mut self, creator_id: impl Into<String>) -> Self {
        self.state.creator_id = Some(creator_id.into());
        self
    }

    pub fn add_party(&mut self, persona: Persona) -> Result<(), NegotiationError> {
        if self.state.has_party(&persona.id) {
            return Err(NegotiationError::DuplicateParty(persona.id));
        }
        self.state.parties.push(PartyState::new(persona));
        Ok(())
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn into_state(self) -> NegotiationState {
        self.state
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn stage(&self) -> NegotiationStage {
        self.stage
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn emit(&self, event: NegotiationEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_negotiation_event(&event).await;
        }
    }

    fn check_cancelled(&self) -> Result<(), NegotiationError> {
        if self.cancel.is_cancelled() {
            Err(NegotiationError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run elicitation and the round loop to a terminal state.
    pub async fn run(&mut self) -> Result<NegotiationOutcome, NegotiationError> {
        if self.state.parties.is_empty() {
            return Err(NegotiationError::NoParties);
        }

        log::info!(
            "parley::orchestrator: negotiation {} started with {} parties",
            self.state.id,
            self.state.parties.len()
        );
        self.emit(NegotiationEvent::RunStarted {
            negotiation_id: self.state.id.clone(),
            party_count: self.state.parties.len(),
            max_rounds: self.config.max_rounds,
        })
        .await;

        let terminal = match self.drive().await {
            Ok(terminal) => terminal,
            Err(NegotiationError::Dispatch {
                phase,
                round,
                source: DispatchError::Parse { reason, .. },
            }) => {
                log::error!(
                    "parley::orchestrator: {} output unusable in round {}: {}",
                    phase.as_str(),
                    round,
                    reason
                );
                self.stage = NegotiationStage::Failed;
                TerminalState::Failed { phase, round, reason }
            }
            Err(err) => {
                self.stage = NegotiationStage::Failed;
                return Err(err);
            }
        };

        let rounds = self.state.rounds().len();
        self.emit(NegotiationEvent::RunCompleted {
            negotiation_id: self.state.id.clone(),
            rounds,
            terminal: terminal.name().to_string(),
        })
        .await;
        log::info!(
            "parley::orchestrator: negotiation {} {} after {} rounds",
            self.state.id,
            terminal.name(),
            rounds
        );

        let last = self.state.last_round();
        Ok(NegotiationOutcome {
            negotiation_id: self.state.id.clone(),
            terminal,
            rounds,
            final_proposal: last.and_then(|r| {
                r.selected_proposal
                    .and_then(|i| r.synthesis.proposals.get(i))
                    .cloned()
            }),
            final_responses: last.map(|r| r.responses.clone()).unwrap_or_default(),
            tensions: last.map(|r| r.synthesis.tensions.clone()).unwrap_or_default(),
        })
    }

    async fn drive(&mut self) -> Result<TerminalState, NegotiationError> {
        self.state.seed_from_personas();

        self.stage = NegotiationStage::Extracting;
        for index in 0..self.state.parties.len() {
            if self.state.parties[index].elicitation_complete {
                continue;
            }
            self.check_cancelled()?;
            phases::elicit_party(
                &mut self.state,
                index,
                self.oracle.as_ref(),
                self.channel.as_ref(),
                self.config.max_elicitation_turns,
                self.event_handler.as_ref(),
                &self.cancel,
            )
            .await
            .map_err(|e| dispatch_failure(Phase::Elicitation, 0, e))?;
        }
        let merged = self.state.merge_party_tags();
        log::debug!("parley::orchestrator: {} extracted tags merged", merged);

        let first_round = self.state.rounds().len() + 1;
        for round in first_round..=self.config.max_rounds {
            self.check_cancelled()?;
            self.emit(NegotiationEvent::RoundStarted { round }).await;

            let structure = if self.config.structure_problem {
                self.stage = NegotiationStage::Structuring;
                let structure = phases::structure_problem(&self.state, self.oracle.as_ref(), &self.cancel)
                    .await
                    .map_err(|e| dispatch_failure(Phase::Structuring, round, e))?;
                self.emit(NegotiationEvent::PhaseCompleted {
                    round,
                    phase: Phase::Structuring,
                })
                .await;
                Some(structure)
            } else {
                None
            };

            self.stage = NegotiationStage::Synthesizing;
            let synthesis = phases::synthesize(&self.state, structure.as_ref(), self.oracle.as_ref(), &self.cancel)
                .await
                .map_err(|e| dispatch_failure(Phase::Synthesis, round, e))?;
            self.emit(NegotiationEvent::PhaseCompleted {
                round,
                phase: Phase::Synthesis,
            })
            .await;

            let candidates = match self.config.proposal_policy {
                ProposalPolicy::First => synthesis.proposals.len().min(1),
                ProposalPolicy::BestOfAll => synthesis.proposals.len(),
            };
            let mut best: Option<Evaluation> = None;
            for (index, proposal) in synthesis.proposals.iter().enumerate().take(candidates) {
                self.check_cancelled()?;
                self.stage = NegotiationStage::Contextualizing;
                let contexts = phases::contextualize_all(&self.state, proposal, self.oracle.as_ref(), &self.cancel)
                    .await
                    .map_err(|e| dispatch_failure(Phase::Contextualization, round, e))?;

                self.stage = NegotiationStage::Responding;
                let responses =
                    phases::collect_responses(&self.state, proposal, &contexts, self.oracle.as_ref(), &self.cancel)
                        .await
                        .map_err(|e| dispatch_failure(Phase::Response, round, e))?;

                let evaluation = Evaluation {
                    index,
                    contexts,
                    responses,
                };
                let better = match &best {
                    Some(current) => evaluation.rank() < current.rank(),
                    None => true,
                };
                if better {
                    best = Some(evaluation);
                }
            }

            let (selected_proposal, contextualizations, responses) = match best {
                Some(evaluation) => {
                    self.emit(NegotiationEvent::PhaseCompleted {
                        round,
                        phase: Phase::Contextualization,
                    })
                    .await;
                    self.emit(NegotiationEvent::PhaseCompleted {
                        round,
                        phase: Phase::Response,
                    })
                    .await;
                    self.emit(NegotiationEvent::ProposalSelected {
                        round,
                        index: evaluation.index,
                        candidates,
                    })
                    .await;
                    (Some(evaluation.index), evaluation.contexts, evaluation.responses)
                }
                None => (None, BTreeMap::new(), BTreeMap::new()),
            };

            for (party_id, response) in &responses {
                self.emit(NegotiationEvent::PartyResponded {
                    round,
                    party_id: party_id.clone(),
                    response_type: response.response_type,
                })
                .await;
            }

            self.stage = NegotiationStage::Checking;
            let converged = convergence::converged(&responses);
            let outcome = convergence::round_outcome(&responses);
            self.state.record_round(RoundRecord {
                number: round,
                structure,
                synthesis,
                selected_proposal,
                contextualizations,
                responses,
                outcome,
                completed_at: Utc::now(),
            });
            self.emit(NegotiationEvent::ConvergenceChecked {
                round,
                converged,
                outcome,
            })
            .await;

            if converged {
                self.stage = NegotiationStage::Converged;
                return Ok(TerminalState::Converged { round });
            }
            log::info!("parley::orchestrator: round {} ended with {:?}", round, outcome);
        }

        self.stage = NegotiationStage::Diverged;
        Ok(TerminalState::Diverged {
            rounds: self.state.rounds().len(),
        })
    }
}
