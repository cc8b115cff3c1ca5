//! The semantic oracle capability.
//!
//! Everything that requires reading or writing natural language (extracting
//! constraints from a party's words, structuring the problem, proposing
//! solutions, explaining a proposal to one party, deciding on it for a
//! simulated party) sits behind [`SemanticOracle`]. The trait has one method
//! per phase, so a deterministic decision engine can stand in for an LLM in
//! tests. [`PartyChannel`] produces the party side of an elicitation dialogue.
//!
//! [`DispatchOracle`] is the production implementation of both traits: every
//! method is exactly one [`DispatchClient::call`] with a short system
//! instruction and a JSON input document, parsed into the schema below.

use crate::parley::client_wrapper::{ChatRequest, Message};
use crate::parley::dispatch::{DispatchClient, DispatchError};
use crate::parley::model::{
    ElicitationSignal, NegotiationState, PartyResponse, PartyState, ResponseType, Speaker, Tag,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Elicitation turn output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElicitationReply {
    /// The party's full extracted constraint set so far.
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub message: String,
    pub signal: ElicitationSignal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionQuestion {
    pub category: String,
    pub question: String,
    #[serde(default)]
    pub has_conflict: bool,
}

/// Categories where resolving one constrains the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coupling {
    pub categories: Vec<String>,
    #[serde(default)]
    pub nature: String,
}

/// Problem Structuring output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemStructure {
    pub questions: Vec<DecisionQuestion>,
    #[serde(default)]
    pub couplings: Vec<Coupling>,
    #[serde(default)]
    pub consensus_items: Vec<String>,
}

impl ProblemStructure {
    pub fn conflicts(&self) -> impl Iterator<Item = &DecisionQuestion> {
        self.questions.iter().filter(|q| q.has_conflict)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    #[serde(default)]
    pub question: String,
    pub proposal: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub addressed_concerns: Vec<String>,
    #[serde(default)]
    pub addressed_desires: Vec<String>,
}

/// A conflict synthesis could not resolve, with its tradeoffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tension {
    pub description: String,
    #[serde(default)]
    pub concerns_involved: Vec<String>,
    #[serde(default)]
    pub possible_resolutions: Vec<String>,
}

/// Synthesis output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisOutput {
    #[serde(default)]
    pub proposals: Vec<Proposal>,
    #[serde(default, alias = "unresolvedTensions")]
    pub tensions: Vec<Tension>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

/// Contextualization output for one party.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contextualization {
    pub confidence: Confidence,
    #[serde(default)]
    pub highlights: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

/// One method per phase. Implementations must not reveal the owner of an
/// anonymous constraint to any other party.
#[async_trait]
pub trait SemanticOracle: Send + Sync {
    /// Process the party's latest message (or greet it on the first turn).
    async fn elicit(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        cancel: &CancellationToken,
    ) -> Result<ElicitationReply, DispatchError>;

    async fn structure_problem(
        &self,
        state: &NegotiationState,
        cancel: &CancellationToken,
    ) -> Result<ProblemStructure, DispatchError>;

    /// Propose solutions, surfacing genuine conflicts as tensions.
    async fn synthesize(
        &self,
        state: &NegotiationState,
        structure: Option<&ProblemStructure>,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutput, DispatchError>;

    async fn contextualize(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        proposal: &Proposal,
        cancel: &CancellationToken,
    ) -> Result<Contextualization, DispatchError>;

    /// Decide on `proposal` on behalf of `party`.
    async fn decide(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        proposal: &Proposal,
        context: &Contextualization,
        cancel: &CancellationToken,
    ) -> Result<PartyResponse, DispatchError>;
}

/// The party side of an elicitation dialogue.
#[async_trait]
pub trait PartyChannel: Send + Sync {
    async fn reply(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        oracle_message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError>;
}

const ELICIT_INSTRUCTIONS: &str = "You help one participant of a group decision state what they need. \
Extract every concern and desire from their words as tags with type, severity or intensity, quote and \
underlyingReason. Reply with JSON {\"tags\": [...], \"message\": string, \"signal\": \
\"complete\"|\"deepen\"|\"expand\"|\"needs-more-info\"|\"opt-out\"}.";

const STRUCTURE_INSTRUCTIONS: &str = "Organize the constraints of a group decision into decision \
categories. Reply with JSON {\"questions\": [{\"category\", \"question\", \"hasConflict\"}], \
\"couplings\": [{\"categories\", \"nature\"}], \"consensusItems\": [string]}.";

const SYNTHESIZE_INSTRUCTIONS: &str = "Propose solutions that satisfy every non-negotiable constraint. \
Never pretend a genuine conflict is resolved: report it as a tension with its tradeoffs. Reply with JSON \
{\"proposals\": [{\"question\", \"proposal\", \"rationale\", \"addressedConcerns\", \"addressedDesires\"}], \
\"tensions\": [{\"description\", \"concernsInvolved\", \"possibleResolutions\"}]}.";

const CONTEXTUALIZE_INSTRUCTIONS: &str = "Explain a proposal to one participant in terms of their own \
constraints. Never reveal who owns an anonymous constraint. Reply with JSON {\"confidence\": \
\"high\"|\"medium\"|\"low\", \"highlights\": [string], \"concerns\": [string], \"summary\": string}.";

const DECIDE_INSTRUCTIONS: &str = "Decide on a proposal as the participant described. Any \
non-negotiable not explicitly addressed means \"object\"; an unmet strong preference means at best \
\"accept-with-reservations\"; a clean match means \"accept\". Reply with JSON {\"type\", \"reasoning\", \
\"nonNegotiablesSatisfied\", \"constraintAnalysis\": [{\"constraint\", \"satisfied\", \"evidence\"}], \
\"concerns\", \"suggestions\"}. Use \"NOT ADDRESSED\" as evidence for unaddressed constraints.";

const REPLY_INSTRUCTIONS: &str = "Speak as the participant described, in their communication style, \
answering the facilitator's last message. Reply with JSON {\"message\": string}.";

#[derive(Deserialize)]
struct PartyReply {
    message: String,
}

/// [`SemanticOracle`] and [`PartyChannel`] over a [`DispatchClient`].
pub struct DispatchOracle {
    dispatch: Arc<DispatchClient>,
    resource_key: Option<String>,
    max_tokens: Option<u32>,
}

impl DispatchOracle {
    pub fn new(dispatch: Arc<DispatchClient>) -> Self {
        Self {
            dispatch,
            resource_key: None,
            max_tokens: None,
        }
    }

    /// Track quota under `key` instead of the client's model name.
    pub fn with_resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn resource_key(&self) -> &str {
        self.resource_key
            .as_deref()
            .unwrap_or_else(|| self.dispatch.default_resource_key())
    }

    async fn ask<T>(&self, instructions: &str, input: Value, cancel: &CancellationToken) -> Result<T, DispatchError>
    where
        T: DeserializeOwned + Send,
    {
        let mut request = ChatRequest::new(vec![
            Message::system(instructions),
            Message::user(input.to_string()),
        ]);
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        let cost = request.estimated_tokens();
        self.dispatch.call(&request, self.resource_key(), cost, cancel).await
    }
}

fn transcript_json(party: &PartyState) -> Vec<Value> {
    party
        .transcript
        .iter()
        .map(|turn| {
            let speaker = match turn.speaker {
                Speaker::Oracle => "facilitator",
                Speaker::Party => "participant",
            };
            json!({ "speaker": speaker, "text": turn.text })
        })
        .collect()
}

/// Objections, concerns and suggestions from the last recorded round.
fn previous_feedback(state: &NegotiationState) -> Value {
    let Some(round) = state.last_round() else {
        return Value::Null;
    };
    let responses: Vec<Value> = round
        .responses
        .values()
        .filter(|r| r.response_type != ResponseType::Accept)
        .map(|r| {
            json!({
                "type": r.response_type,
                "reasoning": r.reasoning,
                "concerns": r.concerns,
                "suggestions": r.suggestions,
            })
        })
        .collect();
    json!({
        "round": round.number,
        "proposal": round
            .selected_proposal
            .and_then(|i| round.synthesis.proposals.get(i))
            .map(|p| p.proposal.clone()),
        "tensions": round.synthesis.tensions,
        "responses": responses,
    })
}

fn own_constraints(party: &PartyState) -> Value {
    json!({
        "declared": party.persona.constraints,
        "extracted": party.tags,
    })
}

#[async_trait]
impl SemanticOracle for DispatchOracle {
    async fn elicit(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        cancel: &CancellationToken,
    ) -> Result<ElicitationReply, DispatchError> {
        let input = json!({
            "outcome": state.outcome,
            "participant": party.persona.name,
            "transcript": transcript_json(party),
            "currentTags": party.tags,
        });
        self.ask(ELICIT_INSTRUCTIONS, input, cancel).await
    }

    async fn structure_problem(
        &self,
        state: &NegotiationState,
        cancel: &CancellationToken,
    ) -> Result<ProblemStructure, DispatchError> {
        let input = json!({
            "outcome": state.outcome,
            "constraints": state.anonymized_constraints(),
            "resolved": { "when": state.resolved_when, "where": state.resolved_where },
        });
        self.ask(STRUCTURE_INSTRUCTIONS, input, cancel).await
    }

    async fn synthesize(
        &self,
        state: &NegotiationState,
        structure: Option<&ProblemStructure>,
        cancel: &CancellationToken,
    ) -> Result<SynthesisOutput, DispatchError> {
        let input = json!({
            "outcome": state.outcome,
            "constraints": state.anonymized_constraints(),
            "structure": structure,
            "previousRound": previous_feedback(state),
        });
        self.ask(SYNTHESIZE_INSTRUCTIONS, input, cancel).await
    }

    async fn contextualize(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        proposal: &Proposal,
        cancel: &CancellationToken,
    ) -> Result<Contextualization, DispatchError> {
        let input = json!({
            "outcome": state.outcome,
            "participant": party.persona.name,
            "ownConstraints": own_constraints(party),
            "allConstraints": state.visible_constraints_for(party.id()),
            "proposal": proposal,
        });
        self.ask(CONTEXTUALIZE_INSTRUCTIONS, input, cancel).await
    }

    async fn decide(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        proposal: &Proposal,
        context: &Contextualization,
        cancel: &CancellationToken,
    ) -> Result<PartyResponse, DispatchError> {
        let input = json!({
            "outcome": state.outcome,
            "participant": party.persona.name,
            "ownConstraints": own_constraints(party),
            "proposal": proposal,
            "context": context,
        });
        self.ask(DECIDE_INSTRUCTIONS, input, cancel).await
    }
}

#[async_trait]
impl PartyChannel for DispatchOracle {
    async fn reply(
        &self,
        state: &NegotiationState,
        party: &PartyState,
        oracle_message: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DispatchError> {
        let input = json!({
            "outcome": state.outcome,
            "participant": {
                "name": party.persona.name,
                "communicationStyle": party.persona.communication_style,
                "constraints": party.persona.constraints,
            },
            "transcript": transcript_json(party),
            "facilitatorMessage": oracle_message,
        });
        let reply: PartyReply = self.ask(REPLY_INSTRUCTIONS, input, cancel).await?;
        Ok(reply.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesis_accepts_unresolved_tensions_alias() {
        let output: SynthesisOutput = serde_json::from_str(
            r#"{"proposals": [], "unresolvedTensions": [{"description": "vegan vs steakhouse"}]}"#,
        )
        .unwrap();
        assert!(output.proposals.is_empty());
        assert_eq!(output.tensions[0].description, "vegan vs steakhouse");
    }

    #[test]
    fn structure_reports_conflicting_questions() {
        let structure: ProblemStructure = serde_json::from_str(
            r#"{"questions": [
                {"category": "venue", "question": "Where?", "hasConflict": true},
                {"category": "time", "question": "When?"}
            ]}"#,
        )
        .unwrap();
        let conflicts: Vec<_> = structure.conflicts().map(|q| q.category.as_str()).collect();
        assert_eq!(conflicts, vec!["venue"]);
    }

    #[test]
    fn elicitation_reply_parses_signal() {
        let reply: ElicitationReply = serde_json::from_str(
            r#"{"tags": [{"text": "No meat", "type": "concern", "severity": "non-negotiable"}],
                "message": "Thanks!", "signal": "needs-more-info"}"#,
        )
        .unwrap();
        assert_eq!(reply.signal, ElicitationSignal::NeedsMoreInfo);
        assert!(reply.tags[0].is_non_negotiable());
    }
}
