//! Phase executors.
//!
//! Each executor reads the [`NegotiationState`] and produces one phase's
//! structured output through the [`SemanticOracle`]. Only elicitation writes
//! to the state, and only to the party being elicited.

use crate::parley::dispatch::DispatchError;
use crate::parley::event::{EventHandler, NegotiationEvent};
use crate::parley::model::{
    normalize_text, ElicitationSignal, NegotiationState, PartyResponse, Speaker, Turn,
};
use crate::parley::oracle::{
    Contextualization, PartyChannel, ProblemStructure, Proposal, SemanticOracle, SynthesisOutput,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How one party's elicitation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElicitationSummary {
    pub turns: usize,
    /// The turn cap ended the dialogue, not the oracle.
    pub forced: bool,
    pub opted_out: bool,
}

async fn emit(events: Option<&Arc<dyn EventHandler>>, event: NegotiationEvent) {
    if let Some(handler) = events {
        handler.on_negotiation_event(&event).await;
    }
}

/// Run the elicitation dialogue for `state.parties[index]`.
///
/// Each turn the oracle processes the party's latest message (or greets it)
/// and returns its current extraction plus a signal. `complete` and `opt-out`
/// end the dialogue; any other signal asks the [`PartyChannel`] for a reply,
/// until `max_turns` oracle turns have run.
pub async fn elicit_party(
    state: &mut NegotiationState,
    index: usize,
    oracle: &dyn SemanticOracle,
    channel: &dyn PartyChannel,
    max_turns: usize,
    events: Option<&Arc<dyn EventHandler>>,
    cancel: &CancellationToken,
) -> Result<ElicitationSummary, DispatchError> {
    let party_id = state.parties[index].id().to_string();
    emit(
        events,
        NegotiationEvent::ElicitationStarted {
            party_id: party_id.clone(),
        },
    )
    .await;

    {
        let party = &mut state.parties[index];
        if party.transcript.is_empty() {
            if let Some(opening) = party.persona.opening.clone() {
                party.transcript.push(Turn {
                    speaker: Speaker::Party,
                    text: opening,
                });
            }
        }
    }

    let mut summary = ElicitationSummary {
        turns: 0,
        forced: true,
        opted_out: false,
    };

    while summary.turns < max_turns {
        summary.turns += 1;
        let reply = oracle.elicit(state, &state.parties[index], cancel).await?;

        let party = &mut state.parties[index];
        let known: HashSet<String> = party.tags.iter().map(|t| normalize_text(&t.text)).collect();
        let new_tags = reply
            .tags
            .iter()
            .filter(|t| !known.contains(&normalize_text(&t.text)))
            .count();
        if !reply.tags.is_empty() {
            party.set_tags(reply.tags);
        }
        party.transcript.push(Turn {
            speaker: Speaker::Oracle,
            text: reply.message.clone(),
        });

        emit(
            events,
            NegotiationEvent::ElicitationTurn {
                party_id: party_id.clone(),
                turn: summary.turns,
                signal: reply.signal,
                new_tags,
            },
        )
        .await;

        match reply.signal {
            ElicitationSignal::Complete => {
                summary.forced = false;
                break;
            }
            ElicitationSignal::OptOut => {
                summary.forced = false;
                summary.opted_out = true;
                state.parties[index].opted_out = true;
                log::info!("parley::phases: party '{}' opted out during elicitation", party_id);
                break;
            }
            _ if summary.turns >= max_turns => break,
            _ => {
                let answer = channel
                    .reply(state, &state.parties[index], &reply.message, cancel)
                    .await?;
                state.parties[index].transcript.push(Turn {
                    speaker: Speaker::Party,
                    text: answer,
                });
            }
        }
    }

    if summary.forced {
        log::warn!(
            "parley::phases: elicitation of '{}' ended at the {}-turn cap",
            party_id,
            max_turns
        );
    }

    let party = &mut state.parties[index];
    party.elicitation_complete = true;
    let tag_count = party.tags.len();
    emit(
        events,
        NegotiationEvent::ElicitationCompleted {
            party_id,
            turns: summary.turns,
            tag_count,
            forced: summary.forced,
        },
    )
    .await;

    Ok(summary)
}

pub async fn structure_problem(
    state: &NegotiationState,
    oracle: &dyn SemanticOracle,
    cancel: &CancellationToken,
) -> Result<ProblemStructure, DispatchError> {
    let structure = oracle.structure_problem(state, cancel).await?;
    log::debug!(
        "parley::phases: {} decision questions, {} in conflict",
        structure.questions.len(),
        structure.conflicts().count()
    );
    Ok(structure)
}

pub async fn synthesize(
    state: &NegotiationState,
    structure: Option<&ProblemStructure>,
    oracle: &dyn SemanticOracle,
    cancel: &CancellationToken,
) -> Result<SynthesisOutput, DispatchError> {
    let synthesis = oracle.synthesize(state, structure, cancel).await?;
    if synthesis.proposals.is_empty() {
        log::warn!(
            "parley::phases: synthesis produced no proposal ({} tensions)",
            synthesis.tensions.len()
        );
    }
    Ok(synthesis)
}

/// Contextualize `proposal` for every party still taking part.
pub async fn contextualize_all(
    state: &NegotiationState,
    proposal: &Proposal,
    oracle: &dyn SemanticOracle,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, Contextualization>, DispatchError> {
    let mut contexts = BTreeMap::new();
    for party in state.parties.iter().filter(|p| !p.opted_out) {
        let context = oracle.contextualize(state, party, proposal, cancel).await?;
        contexts.insert(party.id().to_string(), context);
    }
    Ok(contexts)
}

/// Collect every party's response to `proposal`. Opted-out parties get an
/// `opt-out` response without an oracle call.
pub async fn collect_responses(
    state: &NegotiationState,
    proposal: &Proposal,
    contexts: &BTreeMap<String, Contextualization>,
    oracle: &dyn SemanticOracle,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, PartyResponse>, DispatchError> {
    let mut responses = BTreeMap::new();
    for party in &state.parties {
        let response = match contexts.get(party.id()) {
            Some(context) if !party.opted_out => {
                oracle.decide(state, party, proposal, context, cancel).await?
            }
            _ => PartyResponse::opted_out(),
        };
        responses.insert(party.id().to_string(), response);
    }
    Ok(responses)
}
