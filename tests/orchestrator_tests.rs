use async_trait::async_trait;
use parley::config::{NegotiationConfig, ProposalPolicy, SuccessCriteria};
use parley::dispatch::DispatchError;
use parley::event::{EventHandler, NegotiationEvent, Phase};
use parley::model::{
    normalize_text, ConstraintAnalysis, ElicitationSignal, NegotiationState, PartyResponse, PartyState, Persona,
    PersonaConstraint, ResponseType, RoundOutcome, Severity, Tag,
};
use parley::oracle::{
    Confidence, Contextualization, DecisionQuestion, ElicitationReply, PartyChannel, ProblemStructure, Proposal,
    SemanticOracle, SynthesisOutput, Tension,
};
use parley::orchestrator::{NegotiationError, NegotiationStage, Orchestrator, TerminalState};
use parley::scenario::{run_scenario, Scenario, ScenarioStatus};
use parley::validator::VerdictBasis;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Deterministic stand-in for the language model.
///
/// A party accepts a proposal iff every one of its non-negotiables appears in
/// the proposal's `addressedConcerns`; otherwise it objects.
struct ScriptedOracle {
    signals: HashMap<String, ElicitationSignal>,
    extracted: HashMap<String, Vec<Tag>>,
    reservations: HashMap<String, Vec<String>>,
    rounds: Mutex<VecDeque<Result<SynthesisOutput, DispatchError>>>,
    fallback: SynthesisOutput,
    explicit_flag: bool,
    synthesis_delay: Option<Duration>,
    elicit_calls: Mutex<HashMap<String, usize>>,
    decide_calls: Mutex<Vec<String>>,
    reply_calls: AtomicUsize,
}

impl ScriptedOracle {
    fn new(fallback: SynthesisOutput) -> Self {
        Self {
            signals: HashMap::new(),
            extracted: HashMap::new(),
            reservations: HashMap::new(),
            rounds: Mutex::new(VecDeque::new()),
            fallback,
            explicit_flag: false,
            synthesis_delay: None,
            elicit_calls: Mutex::new(HashMap::new()),
            decide_calls: Mutex::new(Vec::new()),
            reply_calls: AtomicUsize::new(0),
        }
    }

    fn with_signal(mut self, party_id: &str, signal: ElicitationSignal) -> Self {
        self.signals.insert(party_id.to_string(), signal);
        self
    }

    /// Extra tags surfaced for `party_id` beyond its declared constraints.
    fn with_extracted(mut self, party_id: &str, tag: Tag) -> Self {
        self.extracted.entry(party_id.to_string()).or_default().push(tag);
        self
    }

    /// Accept with reservations, quoting `concern`, whenever the party would accept.
    fn with_reservation(mut self, party_id: &str, concern: &str) -> Self {
        self.reservations
            .entry(party_id.to_string())
            .or_default()
            .push(concern.to_string());
        self
    }

    fn with_round(self, result: Result<SynthesisOutput, DispatchError>) -> Self {
        self.rounds.lock().unwrap().push_back(result);
        self
    }

    fn with_explicit_flag(mut self) -> Self {
        self.explicit_flag = true;
        self
    }

    fn with_synthesis_delay(mut self, delay: Duration) -> Self {
        self.synthesis_delay = Some(delay);
        self
    }

    fn elicit_calls(&self, party_id: &str) -> usize {
        self.elicit_calls.lock().unwrap().get(party_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SemanticOracle for ScriptedOracle {
    async fn elicit(
        &self,
        _state: &NegotiationState,
        party: &PartyState,
        _cancel: &CancellationToken,
    ) -> Result<ElicitationReply, DispatchError> {
        *self
            .elicit_calls
            .lock()
            .unwrap()
            .entry(party.id().to_string())
            .or_default() += 1;
        let tags = party
            .persona
            .constraints
            .iter()
            .map(|c| Tag::concern(c.text.clone(), c.severity.unwrap_or(Severity::Mild)))
            .chain(self.extracted.get(party.id()).into_iter().flatten().cloned())
            .collect();
        Ok(ElicitationReply {
            tags,
            message: format!("Tell me more, {}", party.persona.name),
            signal: self
                .signals
                .get(party.id())
                .copied()
                .unwrap_or(ElicitationSignal::Complete),
        })
    }

    async fn structure_problem(
        &self,
        _state: &NegotiationState,
        _cancel: &CancellationToken,
    ) -> Result<ProblemStructure, DispatchError> {
        Ok(ProblemStructure {
            questions: vec![DecisionQuestion {
                category: "venue".into(),
                question: "Where do we meet?".into(),
                has_conflict: false,
            }],
            couplings: Vec::new(),
            consensus_items: Vec::new(),
        })
    }

    async fn synthesize(
        &self,
        _state: &NegotiationState,
        _structure: Option<&ProblemStructure>,
        _cancel: &CancellationToken,
    ) -> Result<SynthesisOutput, DispatchError> {
        if let Some(delay) = self.synthesis_delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.rounds.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn contextualize(
        &self,
        _state: &NegotiationState,
        _party: &PartyState,
        proposal: &Proposal,
        _cancel: &CancellationToken,
    ) -> Result<Contextualization, DispatchError> {
        Ok(Contextualization {
            confidence: Confidence::Medium,
            highlights: Vec::new(),
            concerns: Vec::new(),
            summary: proposal.proposal.clone(),
        })
    }

    async fn decide(
        &self,
        _state: &NegotiationState,
        party: &PartyState,
        proposal: &Proposal,
        _context: &Contextualization,
        _cancel: &CancellationToken,
    ) -> Result<PartyResponse, DispatchError> {
        self.decide_calls.lock().unwrap().push(party.id().to_string());
        let addressed: Vec<String> = proposal.addressed_concerns.iter().map(|c| normalize_text(c)).collect();
        let analysis: Vec<ConstraintAnalysis> = party
            .persona
            .non_negotiables()
            .map(|c| {
                let satisfied = addressed.contains(&normalize_text(&c.text));
                ConstraintAnalysis {
                    constraint: c.text.clone(),
                    satisfied,
                    evidence: if satisfied {
                        proposal.proposal.clone()
                    } else {
                        "NOT ADDRESSED".into()
                    },
                }
            })
            .collect();
        let all_satisfied = analysis.iter().all(|a| a.satisfied);
        let mut response = PartyResponse::new(
            if all_satisfied {
                ResponseType::Accept
            } else {
                ResponseType::Object
            },
            "scripted",
        );
        if let Some(concerns) = self.reservations.get(party.id()).filter(|_| all_satisfied) {
            response.response_type = ResponseType::AcceptWithReservations;
            response.concerns = concerns.clone();
        }
        if self.explicit_flag {
            response.non_negotiables_satisfied = Some(all_satisfied);
        }
        response.constraint_analysis = analysis;
        Ok(response)
    }
}

#[async_trait]
impl PartyChannel for ScriptedOracle {
    async fn reply(
        &self,
        _state: &NegotiationState,
        party: &PartyState,
        _oracle_message: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        self.reply_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{} has nothing to add", party.persona.name))
    }
}

#[derive(Default)]
struct RecordingHandler {
    events: Mutex<Vec<NegotiationEvent>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn on_negotiation_event(&self, event: &NegotiationEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn persona(id: &str, non_negotiable: &str) -> Persona {
    Persona::new(id, id.to_uppercase()).with_constraint(PersonaConstraint::concern(
        non_negotiable,
        Severity::NonNegotiable,
        0.0,
    ))
}

fn proposal(text: &str, addressed: &[&str]) -> Proposal {
    Proposal {
        question: "Where do we meet?".into(),
        proposal: text.into(),
        rationale: String::new(),
        addressed_concerns: addressed.iter().map(|s| s.to_string()).collect(),
        addressed_desires: Vec::new(),
    }
}

fn synthesis(proposals: Vec<Proposal>) -> SynthesisOutput {
    SynthesisOutput {
        proposals,
        tensions: Vec::new(),
    }
}

fn orchestrator(oracle: Arc<ScriptedOracle>, config: NegotiationConfig, personas: Vec<Persona>) -> Orchestrator {
    let mut orchestrator = Orchestrator::new("Pick a restaurant", oracle.clone(), oracle).with_config(config);
    for p in personas {
        orchestrator.add_party(p).unwrap();
    }
    orchestrator
}

#[tokio::test]
async fn test_trivial_convergence_succeeds() {
    let oracle = Arc::new(ScriptedOracle::new(synthesis(vec![proposal(
        "Green Table, a quiet vegan bistro with step-free access",
        &["Vegan menu", "Wheelchair accessible"],
    )])));
    let scenario = Scenario::new("trivial", "Pick a restaurant")
        .with_persona(persona("alice", "Vegan menu"))
        .with_persona(persona("bob", "Wheelchair accessible"));

    let result = run_scenario(&scenario, oracle.clone(), oracle.clone()).await;

    assert_eq!(result.status, ScenarioStatus::Converged);
    assert!(result.success);
    assert!(result.violated.is_empty());
    assert_eq!(result.satisfied.len(), 2);
    assert!(result
        .satisfied
        .iter()
        .all(|v| v.basis == VerdictBasis::ConstraintAnalysis));
    assert_eq!(result.rounds.len(), 1);
    assert_eq!(result.acceptance_rate, 1.0);
    assert!(result.final_proposal.unwrap().proposal.contains("Green Table"));
}

#[tokio::test]
async fn test_irreconcilable_conflict_reports_tension_and_fails() {
    let forced = SynthesisOutput {
        proposals: vec![proposal("Alternate between two restaurants each month", &[])],
        tensions: vec![Tension {
            description: "A fully vegan venue cannot also serve meat".into(),
            concerns_involved: vec!["Only a fully vegan venue".into(), "Must have a meat option".into()],
            possible_resolutions: vec!["Alternate venues".into(), "Split the group".into()],
        }],
    };
    let oracle = Arc::new(ScriptedOracle::new(forced));
    let scenario = Scenario::new("conflict", "Pick a restaurant")
        .with_persona(persona("alice", "Only a fully vegan venue"))
        .with_persona(persona("bob", "Must have a meat option"))
        .with_negotiation(NegotiationConfig::default().with_max_rounds(1));

    let result = run_scenario(&scenario, oracle.clone(), oracle.clone()).await;

    assert_eq!(result.status, ScenarioStatus::Diverged);
    assert!(!result.success);
    assert_eq!(result.tensions.len(), 1);
    let mut violated: Vec<&str> = result.violated.iter().map(|v| v.constraint.as_str()).collect();
    violated.sort();
    assert_eq!(violated, vec!["Must have a meat option", "Only a fully vegan venue"]);
    assert_eq!(result.rounds[0].outcome, RoundOutcome::Objections);
}

#[tokio::test]
async fn test_round_counter_never_exceeds_maximum() {
    let oracle = Arc::new(ScriptedOracle::new(synthesis(vec![proposal("Anywhere", &[])])));
    let mut orchestrator = orchestrator(
        oracle.clone(),
        NegotiationConfig::default().with_max_rounds(3),
        vec![persona("alice", "Vegan menu"), persona("bob", "Quiet room")],
    );

    let outcome = orchestrator.run().await.unwrap();

    assert_eq!(outcome.terminal, TerminalState::Diverged { rounds: 3 });
    assert_eq!(orchestrator.state().rounds().len(), 3);
    assert_eq!(orchestrator.stage(), NegotiationStage::Diverged);
    let numbers: Vec<usize> = orchestrator.state().rounds().iter().map(|r| r.number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_elicitation_forced_to_end_at_turn_cap() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("Green Table", &["Vegan menu"])]))
            .with_signal("alice", ElicitationSignal::Deepen),
    );
    let handler = Arc::new(RecordingHandler::default());
    let mut orchestrator = orchestrator(
        oracle.clone(),
        NegotiationConfig::default().with_max_elicitation_turns(4),
        vec![persona("alice", "Vegan menu"), persona("bob", "Vegan menu")],
    )
    .with_event_handler(handler.clone());

    orchestrator.run().await.unwrap();

    assert_eq!(oracle.elicit_calls("alice"), 4);
    assert_eq!(oracle.elicit_calls("bob"), 1);
    assert_eq!(oracle.reply_calls.load(Ordering::SeqCst), 3);

    let alice = orchestrator.state().party("alice").unwrap();
    assert!(alice.elicitation_complete);
    assert_eq!(alice.transcript.len(), 7);

    let events = handler.events.lock().unwrap();
    let completions: Vec<(String, bool)> = events
        .iter()
        .filter_map(|e| match e {
            NegotiationEvent::ElicitationCompleted { party_id, forced, .. } => Some((party_id.clone(), *forced)),
            _ => None,
        })
        .collect();
    assert_eq!(completions, vec![("alice".to_string(), true), ("bob".to_string(), false)]);
}

#[tokio::test]
async fn test_parties_elicited_sequentially_in_order() {
    let oracle = Arc::new(ScriptedOracle::new(synthesis(vec![proposal("x", &["a rule", "b rule"])])));
    let handler = Arc::new(RecordingHandler::default());
    let mut orchestrator = orchestrator(
        oracle.clone(),
        NegotiationConfig::default(),
        vec![persona("a", "a rule"), persona("b", "b rule")],
    )
    .with_event_handler(handler.clone());

    orchestrator.run().await.unwrap();

    let events = handler.events.lock().unwrap();
    let order: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            NegotiationEvent::ElicitationStarted { party_id } => Some(format!("start:{}", party_id)),
            NegotiationEvent::ElicitationCompleted { party_id, .. } => Some(format!("end:{}", party_id)),
            _ => None,
        })
        .collect();
    assert_eq!(order, vec!["start:a", "end:a", "start:b", "end:b"]);
}

#[tokio::test]
async fn test_opted_out_party_does_not_block_convergence() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("Green Table", &["Vegan menu"])]))
            .with_signal("bob", ElicitationSignal::OptOut),
    );
    let scenario = Scenario::new("opt-out", "Pick a restaurant")
        .with_persona(persona("alice", "Vegan menu"))
        .with_persona(persona("bob", "Steakhouse only"))
        .with_negotiation(NegotiationConfig::default().with_success(SuccessCriteria {
            min_acceptance_rate: 0.5,
            max_opt_outs: 0,
        }));

    let result = run_scenario(&scenario, oracle.clone(), oracle.clone()).await;

    assert_eq!(result.status, ScenarioStatus::Converged);
    assert_eq!(result.rounds[0].outcome, RoundOutcome::OptOuts);
    assert_eq!(result.rounds[0].responses["bob"].response_type, ResponseType::OptOut);
    assert_eq!(oracle.decide_calls.lock().unwrap().as_slice(), ["alice"]);
    assert_eq!(result.opt_outs, 1);
    assert_eq!(result.waived.len(), 1);
    assert!(result.violated.is_empty());
    assert!(!result.success);
}

#[tokio::test]
async fn test_best_of_all_selects_proposal_with_fewest_objections() {
    let proposals = vec![
        proposal("Green Table", &["Vegan menu"]),
        proposal("Harbor Hall", &["Vegan menu", "Wheelchair accessible"]),
    ];
    let personas = || vec![persona("alice", "Vegan menu"), persona("bob", "Wheelchair accessible")];

    let best = Arc::new(ScriptedOracle::new(synthesis(proposals.clone())));
    let mut best_of_all = orchestrator(
        best,
        NegotiationConfig::default()
            .with_max_rounds(1)
            .with_proposal_policy(ProposalPolicy::BestOfAll),
        personas(),
    );
    let outcome = best_of_all.run().await.unwrap();
    assert!(outcome.converged());
    assert_eq!(best_of_all.state().rounds()[0].selected_proposal, Some(1));
    assert_eq!(outcome.final_proposal.unwrap().proposal, "Harbor Hall");

    let first = Arc::new(ScriptedOracle::new(synthesis(proposals)));
    let mut first_only = orchestrator(first, NegotiationConfig::default().with_max_rounds(1), personas());
    let outcome = first_only.run().await.unwrap();
    assert!(!outcome.converged());
    assert_eq!(first_only.state().rounds()[0].selected_proposal, Some(0));
}

#[tokio::test]
async fn test_round_without_proposals_never_converges() {
    let oracle = Arc::new(ScriptedOracle::new(SynthesisOutput {
        proposals: Vec::new(),
        tensions: vec![Tension {
            description: "No venue fits both".into(),
            concerns_involved: Vec::new(),
            possible_resolutions: Vec::new(),
        }],
    }));
    let mut orchestrator = orchestrator(
        oracle.clone(),
        NegotiationConfig::default().with_max_rounds(2),
        vec![persona("alice", "Vegan menu")],
    );

    let outcome = orchestrator.run().await.unwrap();

    assert_eq!(outcome.terminal, TerminalState::Diverged { rounds: 2 });
    let round = &orchestrator.state().rounds()[0];
    assert!(round.responses.is_empty());
    assert_eq!(round.selected_proposal, None);
    assert_eq!(round.outcome, RoundOutcome::Objections);
    assert!(oracle.decide_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_later_round_can_converge_and_history_is_kept() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("Harbor Hall", &["Vegan menu"])]))
            .with_round(Ok(synthesis(vec![proposal("Steak Barn", &[])]))),
    );
    let mut orchestrator = orchestrator(oracle, NegotiationConfig::default(), vec![persona("alice", "Vegan menu")]);

    let outcome = orchestrator.run().await.unwrap();

    assert_eq!(outcome.terminal, TerminalState::Converged { round: 2 });
    let rounds = orchestrator.state().rounds();
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0].outcome, RoundOutcome::Objections);
    assert_eq!(rounds[1].outcome, RoundOutcome::Accepted);
}

#[tokio::test]
async fn test_explicit_flag_drives_validation() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("Green Table", &["Vegan menu"])])).with_explicit_flag(),
    );
    let scenario = Scenario::new("flag", "Pick a restaurant").with_persona(persona("alice", "Vegan menu"));

    let result = run_scenario(&scenario, oracle.clone(), oracle.clone()).await;

    assert!(result.success);
    assert_eq!(result.satisfied[0].basis, VerdictBasis::ExplicitFlag);
}

#[tokio::test]
async fn test_extracted_non_negotiable_is_validated() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("The Cellar Bar", &[])]))
            .with_extracted("dana", Tag::concern("Wheelchair accessible venue", Severity::NonNegotiable))
            .with_reservation("dana", "No wheelchair accessible entrance"),
    );
    let scenario = Scenario::new("extracted", "Pick a restaurant").with_persona(Persona::new("dana", "DANA"));

    let result = run_scenario(&scenario, oracle.clone(), oracle.clone()).await;

    assert_eq!(result.status, ScenarioStatus::Converged);
    assert!(!result.success);
    assert!(result.satisfied.is_empty());
    assert_eq!(result.violated.len(), 1);
    assert_eq!(result.violated[0].party_id, "dana");
    assert_eq!(result.violated[0].constraint, "Wheelchair accessible venue");
    assert_eq!(result.violated[0].basis, VerdictBasis::ResponseType);
}

#[tokio::test]
async fn test_parse_failure_ends_run_as_failed() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("x", &[])])).with_round(Err(DispatchError::Parse {
            raw: "garbage".into(),
            reason: "expected value at line 1 column 1".into(),
        })),
    );
    let mut orchestrator = orchestrator(oracle, NegotiationConfig::default(), vec![persona("alice", "Vegan menu")]);

    let outcome = orchestrator.run().await.unwrap();

    match outcome.terminal {
        TerminalState::Failed { phase, round, .. } => {
            assert_eq!(phase, Phase::Synthesis);
            assert_eq!(round, 1);
        }
        other => panic!("unexpected terminal {:?}", other),
    }
    assert_eq!(orchestrator.stage(), NegotiationStage::Failed);
    assert!(orchestrator.state().rounds().is_empty());
}

#[tokio::test]
async fn test_transport_failure_keeps_completed_rounds() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("x", &[])]))
            .with_round(Ok(synthesis(vec![proposal("Steak Barn", &[])])))
            .with_round(Err(DispatchError::Transport("connection reset".into()))),
    );
    let scenario = Scenario::new("transport", "Pick a restaurant").with_persona(persona("alice", "Vegan menu"));

    let result = run_scenario(&scenario, oracle.clone(), oracle.clone()).await;

    assert_eq!(result.status, ScenarioStatus::Failed);
    assert_eq!(result.rounds.len(), 1);
    assert!(result.error.unwrap().contains("connection reset"));
    assert!(!result.success);
}

#[tokio::test]
async fn test_add_party_rejects_duplicates_and_run_requires_parties() {
    let oracle = Arc::new(ScriptedOracle::new(SynthesisOutput::default()));
    let mut orchestrator = Orchestrator::new("Pick a restaurant", oracle.clone(), oracle);

    assert!(matches!(orchestrator.run().await, Err(NegotiationError::NoParties)));

    orchestrator.add_party(persona("alice", "Vegan menu")).unwrap();
    match orchestrator.add_party(persona("alice", "Other")) {
        Err(NegotiationError::DuplicateParty(id)) => assert_eq!(id, "alice"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_cancelled_token_aborts_run() {
    let oracle = Arc::new(ScriptedOracle::new(synthesis(vec![proposal("x", &[])])));
    let cancel = CancellationToken::new();
    let mut orchestrator = orchestrator(oracle.clone(), NegotiationConfig::default(), vec![persona("alice", "Vegan")])
        .with_cancellation(cancel.clone());
    cancel.cancel();

    assert!(matches!(orchestrator.run().await, Err(NegotiationError::Cancelled)));
    assert_eq!(oracle.elicit_calls("alice"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_wall_clock_budget_times_out() {
    let oracle = Arc::new(
        ScriptedOracle::new(synthesis(vec![proposal("x", &["Vegan menu"])]))
            .with_synthesis_delay(Duration::from_secs(3_600)),
    );
    let scenario = Scenario::new("slow", "Pick a restaurant")
        .with_persona(persona("alice", "Vegan menu"))
        .with_wall_clock_budget_ms(1_000);

    let result = run_scenario(&scenario, oracle.clone(), oracle.clone()).await;

    assert_eq!(result.status, ScenarioStatus::TimedOut);
    assert!(!result.success);
    assert!(result.rounds.is_empty());
    assert_eq!(result.violated[0].basis, VerdictBasis::NoResponse);
}

#[tokio::test]
async fn test_seeding_is_idempotent_across_runs() {
    let oracle = Arc::new(ScriptedOracle::new(synthesis(vec![proposal("x", &["Vegan menu"])])));
    let mut orchestrator = orchestrator(
        oracle.clone(),
        NegotiationConfig::default(),
        vec![persona("alice", "Vegan menu").with_constraint(PersonaConstraint::concern(
            "Quiet  room.",
            Severity::StrongPreference,
            0.2,
        ))],
    );
    orchestrator.run().await.unwrap();
    let mut state = orchestrator.into_state();

    assert_eq!(state.seed_from_personas(), 0);
    let texts: Vec<&str> = state.constraints.iter().map(|t| t.text.as_str()).collect();
    assert_eq!(texts, vec!["Vegan menu", "Quiet room"]);
}
