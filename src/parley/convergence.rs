//! Round-level convergence and the scenario-level success judgment.
//!
//! A round converges when nobody objects. Reservations and opt-outs do not
//! block it: the majority may proceed while a minority dissents or leaves.
//! Success is stricter and needs four independent conditions at once:
//! convergence, an acceptance rate at or above the threshold, no more opt-outs
//! than allowed, and zero violated non-negotiables.

use crate::parley::config::SuccessCriteria;
use crate::parley::model::{PartyResponse, ResponseType, RoundOutcome};
use crate::parley::validator::ValidationReport;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// `true` iff there is at least one response and none of them is `object`.
///
/// A round without responses (synthesis produced no proposal) never converges.
pub fn converged(responses: &BTreeMap<String, PartyResponse>) -> bool {
    !responses.is_empty()
        && responses
            .values()
            .all(|r| r.response_type != ResponseType::Object)
}

/// Outcome tag for a round: any objection wins, then any opt-out.
pub fn round_outcome(responses: &BTreeMap<String, PartyResponse>) -> RoundOutcome {
    if !converged(responses) {
        RoundOutcome::Objections
    } else if responses.values().any(|r| r.response_type == ResponseType::OptOut) {
        RoundOutcome::OptOuts
    } else {
        RoundOutcome::Accepted
    }
}

/// Share of responses that are `accept` or `accept-with-reservations`.
pub fn acceptance_rate(responses: &BTreeMap<String, PartyResponse>) -> f64 {
    if responses.is_empty() {
        return 0.0;
    }
    let accepted = responses
        .values()
        .filter(|r| r.response_type.is_acceptance())
        .count();
    accepted as f64 / responses.len() as f64
}

pub fn opt_out_count(responses: &BTreeMap<String, PartyResponse>) -> usize {
    responses
        .values()
        .filter(|r| r.response_type == ResponseType::OptOut)
        .count()
}

/// The success judgment with each condition spelled out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuccessJudgment {
    pub converged: bool,
    pub acceptance_rate: f64,
    pub acceptance_ok: bool,
    pub opt_outs: usize,
    pub opt_outs_ok: bool,
    pub violated: usize,
    pub success: bool,
}

pub fn evaluate_success(
    converged: bool,
    final_responses: &BTreeMap<String, PartyResponse>,
    validation: &ValidationReport,
    criteria: &SuccessCriteria,
) -> SuccessJudgment {
    let rate = acceptance_rate(final_responses);
    let opt_outs = opt_out_count(final_responses);
    let acceptance_ok = rate >= criteria.min_acceptance_rate;
    let opt_outs_ok = opt_outs <= criteria.max_opt_outs;
    let violated = validation.violated.len();
    SuccessJudgment {
        converged,
        acceptance_rate: rate,
        acceptance_ok,
        opt_outs,
        opt_outs_ok,
        violated,
        success: converged && acceptance_ok && opt_outs_ok && violated == 0,
    }
}

/// Lowercased words longer than two characters, punctuation trimmed.
pub fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Jaccard similarity of the two texts' word sets.
///
/// Returns `1.0` when both are empty and `0.0` when only one is.
pub fn jaccard_similarity(text1: &str, text2: &str) -> f32 {
    let words1 = word_set(text1);
    let words2 = word_set(text2);

    if words1.is_empty() && words2.is_empty() {
        return 1.0;
    }
    if words1.is_empty() || words2.is_empty() {
        return 0.0;
    }

    let intersection_size = words1.intersection(&words2).count();
    let union_size = words1.union(&words2).count();
    intersection_size as f32 / union_size as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responses(types: &[ResponseType]) -> BTreeMap<String, PartyResponse> {
        types
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("p{}", i), PartyResponse::new(*t, "")))
            .collect()
    }

    #[test]
    fn any_objection_blocks_convergence() {
        use ResponseType::*;
        for set in [
            vec![Accept, Accept],
            vec![Accept, AcceptWithReservations, OptOut],
            vec![Accept, Object],
            vec![Object],
            vec![],
        ] {
            let r = responses(&set);
            assert_eq!(converged(&r), !set.is_empty() && !set.contains(&Object));
        }
    }

    #[test]
    fn outcome_prefers_objections_over_opt_outs() {
        use ResponseType::*;
        assert_eq!(round_outcome(&responses(&[Object, OptOut])), RoundOutcome::Objections);
        assert_eq!(round_outcome(&responses(&[Accept, OptOut])), RoundOutcome::OptOuts);
        assert_eq!(round_outcome(&responses(&[Accept, AcceptWithReservations])), RoundOutcome::Accepted);
        assert_eq!(round_outcome(&responses(&[])), RoundOutcome::Objections);
    }

    #[test]
    fn success_requires_all_four_conditions() {
        use ResponseType::*;
        let criteria = SuccessCriteria {
            min_acceptance_rate: 0.5,
            max_opt_outs: 0,
        };
        let clean = ValidationReport::default();

        let r = responses(&[Accept, AcceptWithReservations]);
        assert!(evaluate_success(true, &r, &clean, &criteria).success);
        assert!(!evaluate_success(false, &r, &clean, &criteria).success);

        let with_opt_out = responses(&[Accept, OptOut]);
        let judgment = evaluate_success(true, &with_opt_out, &clean, &criteria);
        assert!(judgment.acceptance_ok);
        assert!(!judgment.opt_outs_ok);
        assert!(!judgment.success);
    }

    #[test]
    fn jaccard_ignores_case_and_short_words() {
        assert_eq!(jaccard_similarity("A Vegan menu!", "vegan MENU"), 1.0);
        assert_eq!(jaccard_similarity("", ""), 1.0);
        assert_eq!(jaccard_similarity("vegan", ""), 0.0);
        assert!((jaccard_similarity("vegan menu options", "vegan menu") - 2.0 / 3.0).abs() < 1e-6);
    }
}
