//! Result validation of non-negotiable constraints.
//!
//! A party's non-negotiables are its declared persona constraints plus any
//! non-negotiable tags it contributed during elicitation. Each party's own
//! final response is the source of truth for them. Per constraint, in
//! priority order:
//!
//! 1. the response's explicit `nonNegotiablesSatisfied` flag;
//! 2. the best matching entry of its `constraintAnalysis` (word overlap);
//! 3. the response type: `object` is unsatisfied, `accept` satisfied, and
//!    `accept-with-reservations` unsatisfied only when the response's own
//!    concerns or reasoning mention the constraint's key terms.
//!
//! The proposal text is never re-read here.

use crate::parley::convergence::jaccard_similarity;
use crate::parley::model::{normalize_text, NegotiationState, PartyResponse, PartyState, ResponseType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Minimum word-set similarity for an analysis entry to count as a match.
pub const ANALYSIS_MATCH_THRESHOLD: f32 = 0.3;

const STOP_WORDS: &[&str] = &[
    "about", "also", "been", "being", "could", "each", "every", "from", "have", "into", "just",
    "more", "most", "must", "need", "needs", "only", "other", "should", "some", "such", "than",
    "that", "their", "them", "there", "they", "this", "very", "want", "what", "when", "where",
    "which", "will", "with", "would",
];

/// What decided a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictBasis {
    ExplicitFlag,
    ConstraintAnalysis,
    ResponseType,
    NoResponse,
    OptedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintVerdict {
    pub party_id: String,
    pub constraint: String,
    pub basis: VerdictBasis,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub satisfied: Vec<ConstraintVerdict>,
    pub violated: Vec<ConstraintVerdict>,
    /// Constraints of parties that opted out.
    pub waived: Vec<ConstraintVerdict>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.violated.is_empty()
    }
}

/// Validate every party's non-negotiables against `final_responses`, keyed by party id.
pub fn validate(state: &NegotiationState, final_responses: &BTreeMap<String, PartyResponse>) -> ValidationReport {
    let mut report = ValidationReport::default();

    for party in &state.parties {
        let response = final_responses.get(party.id());
        for constraint in non_negotiables_of(state, party) {
            let verdict = |basis, evidence| ConstraintVerdict {
                party_id: party.id().to_string(),
                constraint: constraint.clone(),
                basis,
                evidence,
            };

            let Some(response) = response else {
                if party.opted_out {
                    report.waived.push(verdict(VerdictBasis::OptedOut, None));
                } else {
                    report.violated.push(verdict(VerdictBasis::NoResponse, None));
                }
                continue;
            };
            if response.response_type == ResponseType::OptOut {
                report.waived.push(verdict(VerdictBasis::OptedOut, None));
                continue;
            }

            let (satisfied, basis, evidence) = check_constraint(&constraint, response);
            if satisfied {
                report.satisfied.push(verdict(basis, evidence));
            } else {
                report.violated.push(verdict(basis, evidence));
            }
        }
    }

    log::debug!(
        "parley::validator: {} satisfied, {} violated, {} waived",
        report.satisfied.len(),
        report.violated.len(),
        report.waived.len()
    );
    report
}

/// Declared constraints first, then extracted tags owned by `party` whose
/// normalized text is not already listed.
pub fn non_negotiables_of(state: &NegotiationState, party: &PartyState) -> Vec<String> {
    let mut seen = HashSet::new();
    let declared = party.persona.non_negotiables().map(|c| c.text.as_str());
    let extracted = state
        .constraints
        .iter()
        .filter(|t| t.is_non_negotiable() && t.owner_id.as_deref() == Some(party.id()))
        .map(|t| t.text.as_str());
    declared
        .chain(extracted)
        .filter(|text| seen.insert(normalize_text(text)))
        .map(str::to_string)
        .collect()
}

/// Decide one constraint from one response. Returns the verdict, its basis
/// and any evidence quoted by the response.
pub fn check_constraint(constraint: &str, response: &PartyResponse) -> (bool, VerdictBasis, Option<String>) {
    if let Some(flag) = response.non_negotiables_satisfied {
        return (flag, VerdictBasis::ExplicitFlag, None);
    }

    if let Some(entry) = best_analysis_match(constraint, response) {
        let evidence = if entry.evidence.is_empty() {
            None
        } else {
            Some(entry.evidence.clone())
        };
        return (entry.satisfied, VerdictBasis::ConstraintAnalysis, evidence);
    }

    let satisfied = match response.response_type {
        ResponseType::Object => false,
        ResponseType::AcceptWithReservations => !mentions_key_terms(constraint, response),
        ResponseType::Accept | ResponseType::OptOut => true,
    };
    (satisfied, VerdictBasis::ResponseType, None)
}

fn best_analysis_match<'a>(
    constraint: &str,
    response: &'a PartyResponse,
) -> Option<&'a crate::parley::model::ConstraintAnalysis> {
    let target = normalize_text(constraint);
    response
        .constraint_analysis
        .iter()
        .map(|entry| {
            let candidate = normalize_text(&entry.constraint);
            let score = if !candidate.is_empty()
                && (candidate.contains(&target) || target.contains(&candidate))
            {
                1.0
            } else {
                jaccard_similarity(&target, &candidate)
            };
            (score, entry)
        })
        .filter(|(score, _)| *score >= ANALYSIS_MATCH_THRESHOLD)
        .fold(None, |best: Option<(f32, _)>, (score, entry)| match best {
            Some((best_score, _)) if best_score >= score => best,
            _ => Some((score, entry)),
        })
        .map(|(_, entry)| entry)
}

/// Lowercased words of four or more characters that are not stop words.
pub fn key_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| w.chars().count() >= 4 && !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// At least half (minimum one) of the constraint's key terms appear in the
/// response's concerns or reasoning.
fn mentions_key_terms(constraint: &str, response: &PartyResponse) -> bool {
    let terms = key_terms(constraint);
    if terms.is_empty() {
        return false;
    }
    let haystack = format!("{} {}", response.concerns.join(" "), response.reasoning).to_lowercase();
    let hits = terms.iter().filter(|t| haystack.contains(t.as_str())).count();
    let needed = ((terms.len() + 1) / 2).max(1);
    hits >= needed
}
