//! Configuration for the dispatch layer, the orchestrator and scenario runs.
//!
//! Users construct these structs directly, tweak them with the `with_*`
//! builders, or deserialize them from JSON; every field has a default, so a
//! partial document is enough.
//!
//! # Example
//!
//! ```rust
//! use parley::config::{NegotiationConfig, ProposalPolicy};
//!
//! let config: NegotiationConfig =
//!     serde_json::from_str(r#"{ "maxRounds": 5, "proposalPolicy": "best-of-all" }"#).unwrap();
//! assert_eq!(config.max_rounds, 5);
//! assert_eq!(config.max_elicitation_turns, 5);
//! assert_eq!(config.proposal_policy, ProposalPolicy::BestOfAll);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry and wait behaviour of the [`DispatchClient`](crate::dispatch::DispatchClient).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Total attempts allowed while the provider keeps answering with
    /// rate-limit errors. Several parties' calls can queue against one budget,
    /// so this is deliberately generous.
    pub max_rate_limit_attempts: usize,

    /// Resends after malformed output before falling back to repair.
    pub max_malformed_retries: usize,

    /// Fixed delay before resending after malformed output.
    pub malformed_retry_delay_ms: u64,

    /// Added to a known reset time before a proactive wait ends.
    pub reset_buffer_ms: u64,

    /// Upper bound of the random jitter added to every quota wait.
    pub max_jitter_ms: u64,

    /// Calls allowed in flight per resource key at once.
    pub max_in_flight_per_key: usize,

    /// Seed quota state with a probe call the first time a key is used.
    pub probe_on_first_use: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_rate_limit_attempts: 10,
            max_malformed_retries: 3,
            malformed_retry_delay_ms: 1_000,
            reset_buffer_ms: 500,
            max_jitter_ms: 1_000,
            max_in_flight_per_key: 1,
            probe_on_first_use: true,
        }
    }
}

impl DispatchConfig {
    pub fn with_max_rate_limit_attempts(mut self, attempts: usize) -> Self {
        self.max_rate_limit_attempts = attempts.max(1);
        self
    }

    pub fn with_max_malformed_retries(mut self, retries: usize) -> Self {
        self.max_malformed_retries = retries;
        self
    }

    pub fn with_max_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.max_jitter_ms = jitter_ms;
        self
    }

    pub fn with_max_in_flight_per_key(mut self, in_flight: usize) -> Self {
        self.max_in_flight_per_key = in_flight.max(1);
        self
    }

    pub fn with_probe_on_first_use(mut self, probe: bool) -> Self {
        self.probe_on_first_use = probe;
        self
    }

    pub fn malformed_retry_delay(&self) -> Duration {
        Duration::from_millis(self.malformed_retry_delay_ms)
    }

    pub fn reset_buffer(&self) -> Duration {
        Duration::from_millis(self.reset_buffer_ms)
    }
}

/// Which synthesized proposals get contextualized and voted on each round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProposalPolicy {
    /// Evaluate only the first proposal.
    First,
    /// Evaluate every proposal and keep the one with the fewest objections,
    /// then the most plain accepts, then the lowest index.
    BestOfAll,
}

impl Default for ProposalPolicy {
    fn default() -> Self {
        ProposalPolicy::First
    }
}

/// Thresholds for the scenario-level success judgment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SuccessCriteria {
    /// Minimum share of final responses that are `accept` or
    /// `accept-with-reservations`.
    pub min_acceptance_rate: f64,
    /// Maximum number of parties that may end opted out.
    pub max_opt_outs: usize,
}

impl Default for SuccessCriteria {
    fn default() -> Self {
        Self {
            min_acceptance_rate: 0.5,
            max_opt_outs: 0,
        }
    }
}

/// Orchestrator settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NegotiationConfig {
    pub max_rounds: usize,
    pub max_elicitation_turns: usize,
    pub proposal_policy: ProposalPolicy,
    /// Run Problem Structuring before Synthesis each round.
    pub structure_problem: bool,
    pub success: SuccessCriteria,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            max_elicitation_turns: 5,
            proposal_policy: ProposalPolicy::First,
            structure_problem: true,
            success: SuccessCriteria::default(),
        }
    }
}

impl NegotiationConfig {
    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_max_elicitation_turns(mut self, turns: usize) -> Self {
        self.max_elicitation_turns = turns;
        self
    }

    pub fn with_proposal_policy(mut self, policy: ProposalPolicy) -> Self {
        self.proposal_policy = policy;
        self
    }

    pub fn with_success(mut self, success: SuccessCriteria) -> Self {
        self.success = success;
        self
    }
}

/// Settings that apply to a whole scenario run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScenarioConfig {
    /// Wall-clock budget for the run; `None` means unbounded.
    pub wall_clock_budget_ms: Option<u64>,
}

impl ScenarioConfig {
    pub fn wall_clock_budget(&self) -> Option<Duration> {
        self.wall_clock_budget_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_defaults_match_reference_limits() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_rate_limit_attempts, 10);
        assert_eq!(config.max_malformed_retries, 3);
        assert_eq!(config.max_in_flight_per_key, 1);
    }

    #[test]
    fn builders_clamp_zero_values() {
        let config = DispatchConfig::default()
            .with_max_rate_limit_attempts(0)
            .with_max_in_flight_per_key(0);
        assert_eq!(config.max_rate_limit_attempts, 1);
        assert_eq!(config.max_in_flight_per_key, 1);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: DispatchConfig = serde_json::from_str(r#"{"maxJitterMs": 0}"#).unwrap();
        assert_eq!(config.max_jitter_ms, 0);
        assert_eq!(config.reset_buffer_ms, 500);
    }
}
