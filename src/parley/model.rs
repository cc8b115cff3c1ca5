//! Negotiation data model.
//!
//! A [`NegotiationState`] is the shared problem record: the desired outcome,
//! the ordered [`PartyState`] list, the accumulated constraint set and the
//! append-only history of [`RoundRecord`]s. Parties are described by
//! [`Persona`]s whose constraint declarations never change during a run; only
//! the transcript and the extracted [`Tag`]s of a party evolve, and only during
//! elicitation.
//!
//! All types serialize with camelCase field names and kebab-case enum values,
//! the same shape the semantic oracle reads and writes.

use crate::parley::oracle::{Contextualization, ProblemStructure, SynthesisOutput};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Strength of a concern, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Mild,
    Moderate,
    StrongPreference,
    NonNegotiable,
}

/// Strength of a desire, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Intensity {
    NiceToHave,
    Important,
    Essential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Concern,
    Desire,
}

/// A constraint or desire in the shared constraint set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub text: String,
    #[serde(rename = "type")]
    pub kind: TagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Intensity>,
    /// The party's own words that produced this tag.
    #[serde(default)]
    pub quote: String,
    #[serde(default)]
    pub underlying_reason: String,
    /// Owning party. Kept for anonymous tags too, so the owner can still edit
    /// or remove them; [`NegotiationState::visible_constraints_for`] hides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
}

impl Tag {
    pub fn concern(text: impl Into<String>, severity: Severity) -> Self {
        Self {
            text: text.into(),
            kind: TagKind::Concern,
            severity: Some(severity),
            intensity: None,
            quote: String::new(),
            underlying_reason: String::new(),
            owner_id: None,
            anonymous: false,
        }
    }

    pub fn desire(text: impl Into<String>, intensity: Intensity) -> Self {
        Self {
            text: text.into(),
            kind: TagKind::Desire,
            severity: None,
            intensity: Some(intensity),
            quote: String::new(),
            underlying_reason: String::new(),
            owner_id: None,
            anonymous: false,
        }
    }

    pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    pub fn is_non_negotiable(&self) -> bool {
        self.severity == Some(Severity::NonNegotiable)
    }

    fn key(&self) -> (Option<String>, String) {
        (self.owner_id.clone(), normalize_text(&self.text))
    }
}

/// A persistent constraint declared by a persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConstraint {
    pub text: String,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: TagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<Intensity>,
    /// 0.0 is absolutely rigid, 1.0 fully flexible.
    #[serde(default, deserialize_with = "deserialize_flexibility")]
    pub flexibility: f64,
    #[serde(default)]
    pub reason: String,
}

fn default_kind() -> TagKind {
    TagKind::Concern
}

fn deserialize_flexibility<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = f64::deserialize(deserializer)?;
    Ok(clamp_flexibility(raw))
}

fn clamp_flexibility(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

impl PersonaConstraint {
    pub fn concern(text: impl Into<String>, severity: Severity, flexibility: f64) -> Self {
        Self {
            text: text.into(),
            kind: TagKind::Concern,
            severity: Some(severity),
            intensity: None,
            flexibility: clamp_flexibility(flexibility),
            reason: String::new(),
        }
    }

    pub fn desire(text: impl Into<String>, intensity: Intensity, flexibility: f64) -> Self {
        Self {
            text: text.into(),
            kind: TagKind::Desire,
            severity: None,
            intensity: Some(intensity),
            flexibility: clamp_flexibility(flexibility),
            reason: String::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn is_non_negotiable(&self) -> bool {
        self.severity == Some(Severity::NonNegotiable)
    }

    /// Non-negotiables and strong preferences are seeded into the shared set.
    pub fn is_seeded(&self) -> bool {
        matches!(
            self.severity,
            Some(Severity::NonNegotiable) | Some(Severity::StrongPreference)
        )
    }
}

/// One negotiating participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub constraints: Vec<PersonaConstraint>,
    /// Only read by the oracle when it speaks for the party.
    #[serde(default)]
    pub communication_style: String,
    /// First message of the party during elicitation, if scripted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening: Option<String>,
}

impl Persona {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            constraints: Vec::new(),
            communication_style: String::new(),
            opening: None,
        }
    }

    pub fn with_constraint(mut self, constraint: PersonaConstraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_communication_style(mut self, style: impl Into<String>) -> Self {
        self.communication_style = style.into();
        self
    }

    pub fn with_opening(mut self, opening: impl Into<String>) -> Self {
        self.opening = Some(opening.into());
        self
    }

    pub fn non_negotiables(&self) -> impl Iterator<Item = &PersonaConstraint> {
        self.constraints.iter().filter(|c| c.is_non_negotiable())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Oracle,
    Party,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
}

/// Signal returned with each elicitation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElicitationSignal {
    Complete,
    Deepen,
    Expand,
    NeedsMoreInfo,
    OptOut,
}

/// Per-participant record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyState {
    pub persona: Persona,
    pub transcript: Vec<Turn>,
    /// Extraction result of the elicitation phase.
    pub tags: Vec<Tag>,
    pub elicitation_complete: bool,
    pub opted_out: bool,
}

impl PartyState {
    pub fn new(persona: Persona) -> Self {
        Self {
            persona,
            transcript: Vec::new(),
            tags: Vec::new(),
            elicitation_complete: false,
            opted_out: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.persona.id
    }

    /// The party's most recent message, if any.
    pub fn last_party_message(&self) -> Option<&str> {
        self.transcript
            .iter()
            .rev()
            .find(|turn| turn.speaker == Speaker::Party)
            .map(|turn| turn.text.as_str())
    }

    /// Replace the extraction result, stamping ownership on each tag.
    pub fn set_tags(&mut self, tags: Vec<Tag>) {
        let owner = self.persona.id.clone();
        self.tags = tags
            .into_iter()
            .map(|mut tag| {
                tag.owner_id = Some(owner.clone());
                tag
            })
            .collect();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseType {
    Accept,
    AcceptWithReservations,
    Object,
    OptOut,
}

impl ResponseType {
    /// `accept` or `accept-with-reservations`.
    pub fn is_acceptance(&self) -> bool {
        matches!(self, ResponseType::Accept | ResponseType::AcceptWithReservations)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintAnalysis {
    pub constraint: String,
    pub satisfied: bool,
    /// Supporting quote from the proposal, or `NOT ADDRESSED`.
    #[serde(default)]
    pub evidence: String,
}

/// A party's decision on one proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartyResponse {
    #[serde(rename = "type")]
    pub response_type: ResponseType,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub non_negotiables_satisfied: Option<bool>,
    #[serde(default)]
    pub constraint_analysis: Vec<ConstraintAnalysis>,
    #[serde(default)]
    pub concerns: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

impl PartyResponse {
    pub fn new(response_type: ResponseType, reasoning: impl Into<String>) -> Self {
        Self {
            response_type,
            reasoning: reasoning.into(),
            non_negotiables_satisfied: None,
            constraint_analysis: Vec::new(),
            concerns: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// The recorded response of a party that left during elicitation.
    pub fn opted_out() -> Self {
        Self::new(ResponseType::OptOut, "Opted out during elicitation")
    }
}

/// Derived outcome tag of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundOutcome {
    Accepted,
    Objections,
    OptOuts,
}

/// Immutable record of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub number: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structure: Option<ProblemStructure>,
    pub synthesis: SynthesisOutput,
    /// Index into `synthesis.proposals` that was contextualized and voted on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_proposal: Option<usize>,
    pub contextualizations: BTreeMap<String, Contextualization>,
    pub responses: BTreeMap<String, PartyResponse>,
    pub outcome: RoundOutcome,
    pub completed_at: DateTime<Utc>,
}

/// The shared problem record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationState {
    pub id: String,
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<String>,
    pub parties: Vec<PartyState>,
    pub constraints: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_where: Option<String>,
    rounds: Vec<RoundRecord>,
    pub created_at: DateTime<Utc>,
}

impl NegotiationState {
    pub fn new(outcome: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            outcome: outcome.into(),
            creator_id: None,
            parties: Vec::new(),
            constraints: Vec::new(),
            resolved_when: None,
            resolved_where: None,
            rounds: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_creator(mut self, creator_id: impl Into<String>) -> Self {
        self.creator_id = Some(creator_id.into());
        self
    }

    pub fn has_party(&self, party_id: &str) -> bool {
        self.parties.iter().any(|p| p.id() == party_id)
    }

    pub fn party(&self, party_id: &str) -> Option<&PartyState> {
        self.parties.iter().find(|p| p.id() == party_id)
    }

    pub fn party_mut(&mut self, party_id: &str) -> Option<&mut PartyState> {
        self.parties.iter_mut().find(|p| p.id() == party_id)
    }

    /// Round history, oldest first.
    pub fn rounds(&self) -> &[RoundRecord] {
        &self.rounds
    }

    pub fn last_round(&self) -> Option<&RoundRecord> {
        self.rounds.last()
    }

    /// Append a finished round. Records are never touched afterwards.
    pub fn record_round(&mut self, record: RoundRecord) {
        self.rounds.push(record);
    }

    /// Insert `tag` unless one with the same owner and normalized text exists.
    pub fn add_tag(&mut self, tag: Tag) -> bool {
        let key = tag.key();
        if self.constraints.iter().any(|t| t.key() == key) {
            return false;
        }
        self.constraints.push(tag);
        true
    }

    /// Remove the owner's tag matching `text` after normalization.
    pub fn remove_tag(&mut self, owner_id: &str, text: &str) -> bool {
        let normalized = normalize_text(text);
        let before = self.constraints.len();
        self.constraints.retain(|t| {
            !(t.owner_id.as_deref() == Some(owner_id) && normalize_text(&t.text) == normalized)
        });
        self.constraints.len() != before
    }

    /// Seed every non-negotiable and strong-preference persona constraint into
    /// the shared set. Safe to call repeatedly; returns how many were added.
    pub fn seed_from_personas(&mut self) -> usize {
        let seeds: Vec<Tag> = self
            .parties
            .iter()
            .flat_map(|party| {
                party
                    .persona
                    .constraints
                    .iter()
                    .filter(|c| c.is_seeded())
                    .map(move |c| Tag {
                        text: canonical_text(&c.text),
                        kind: c.kind,
                        severity: c.severity,
                        intensity: c.intensity,
                        quote: String::new(),
                        underlying_reason: c.reason.clone(),
                        owner_id: Some(party.persona.id.clone()),
                        anonymous: false,
                    })
            })
            .collect();
        self.add_tags(seeds)
    }

    /// Merge the extracted tags of every party still taking part into the shared set.
    pub fn merge_party_tags(&mut self) -> usize {
        let tags: Vec<Tag> = self
            .parties
            .iter()
            .filter(|p| !p.opted_out)
            .flat_map(|p| p.tags.iter().cloned())
            .collect();
        self.add_tags(tags)
    }

    fn add_tags(&mut self, tags: Vec<Tag>) -> usize {
        let mut added = 0;
        for tag in tags {
            if self.add_tag(tag) {
                added += 1;
            }
        }
        added
    }

    /// The constraint set as shown to `party_id`: anonymous tags of other
    /// parties lose their owner.
    pub fn visible_constraints_for(&self, party_id: &str) -> Vec<Tag> {
        self.constraints
            .iter()
            .cloned()
            .map(|mut tag| {
                if tag.anonymous && tag.owner_id.as_deref() != Some(party_id) {
                    tag.owner_id = None;
                }
                tag
            })
            .collect()
    }

    /// The constraint set with every anonymous owner hidden.
    pub fn anonymized_constraints(&self) -> Vec<Tag> {
        self.visible_constraints_for("")
    }

    /// Ids of parties still taking part.
    pub fn active_party_ids(&self) -> Vec<String> {
        self.parties
            .iter()
            .filter(|p| !p.opted_out)
            .map(|p| p.id().to_string())
            .collect()
    }

    pub fn party_ids(&self) -> HashSet<String> {
        self.parties.iter().map(|p| p.id().to_string()).collect()
    }
}

/// Collapse whitespace and trim trailing periods; the stored form of seeded text.
fn canonical_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches('.')
        .to_string()
}

/// Comparison key for constraint text.
pub fn normalize_text(text: &str) -> String {
    canonical_text(text).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> NegotiationState {
        let mut state = NegotiationState::new("Team dinner");
        state.parties.push(PartyState::new(
            Persona::new("alice", "Alice")
                .with_constraint(PersonaConstraint::concern("Must be vegan  friendly.", Severity::NonNegotiable, 0.0))
                .with_constraint(PersonaConstraint::concern("Not too loud", Severity::Mild, 0.8)),
        ));
        state.parties.push(PartyState::new(
            Persona::new("bob", "Bob")
                .with_constraint(PersonaConstraint::concern("Close to the office", Severity::StrongPreference, 0.3)),
        ));
        state
    }

    #[test]
    fn seeding_is_idempotent_and_skips_mild_constraints() {
        let mut state = state();
        assert_eq!(state.seed_from_personas(), 2);
        assert_eq!(state.seed_from_personas(), 0);
        assert_eq!(state.constraints.len(), 2);
        assert_eq!(state.constraints[0].text, "Must be vegan friendly");
        assert_eq!(state.constraints[0].owner_id.as_deref(), Some("alice"));
    }

    #[test]
    fn anonymous_owner_hidden_from_other_parties_only() {
        let mut state = state();
        state.add_tag(Tag::concern("Budget under $40", Severity::Moderate).owned_by("bob").anonymous());

        let for_bob = state.visible_constraints_for("bob");
        assert_eq!(for_bob[0].owner_id.as_deref(), Some("bob"));

        let for_alice = state.visible_constraints_for("alice");
        assert_eq!(for_alice[0].owner_id, None);
        assert_eq!(state.constraints[0].owner_id.as_deref(), Some("bob"));
    }

    #[test]
    fn remove_tag_requires_matching_owner() {
        let mut state = state();
        state.seed_from_personas();
        assert!(!state.remove_tag("bob", "must be vegan friendly"));
        assert!(state.remove_tag("alice", "Must be vegan friendly."));
        assert_eq!(state.constraints.len(), 1);
    }

    #[test]
    fn flexibility_is_clamped() {
        let c: PersonaConstraint =
            serde_json::from_str(r#"{"text": "x", "type": "concern", "flexibility": 3.5}"#).unwrap();
        assert_eq!(c.flexibility, 1.0);
        assert_eq!(PersonaConstraint::concern("y", Severity::Mild, -1.0).flexibility, 0.0);
    }

    #[test]
    fn response_types_use_kebab_case() {
        let r: PartyResponse = serde_json::from_str(
            r#"{"type": "accept-with-reservations", "reasoning": "ok", "nonNegotiablesSatisfied": true}"#,
        )
        .unwrap();
        assert_eq!(r.response_type, ResponseType::AcceptWithReservations);
        assert_eq!(r.non_negotiables_satisfied, Some(true));
        assert!(r.response_type.is_acceptance());
        assert!(!ResponseType::OptOut.is_acceptance());
    }
}
