//! Simulator configuration types
//!
//! This module defines the settings shared by the decode loop, the cyclic
//! scheduler and the live value generator. Application concerns (which bus
//! to open, output format) live in the CLI configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the scheduler does when a message fires more than one period late
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedDeadlinePolicy {
    /// Fire once, then schedule the next deadline one period from now
    #[default]
    Realign,
    /// Keep the additive schedule and fire the backlog back-to-back
    ///
    /// Only suitable for short stalls. If every send takes longer than the
    /// period the backlog never drains and keeps growing; each late fire is
    /// still counted as a missed deadline and logged.
    CatchUp,
}

/// Configuration for the simulator library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Largest change of a generated value between two cycles (physical units)
    #[serde(default = "default_max_step")]
    pub max_step: f64,

    /// Recovery strategy for stalled transmissions
    #[serde(default)]
    pub missed_deadline_policy: MissedDeadlinePolicy,

    /// Period for messages whose catalog entry has none (default: not scheduled)
    #[serde(default)]
    pub default_cycle_time_ms: Option<u64>,

    /// Optional: only decode and schedule these CAN message IDs
    #[serde(default)]
    pub message_filter: Option<Vec<u32>>,

    /// Optional: seed for reproducible generated traffic
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_max_step() -> f64 {
    10.0
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            max_step: default_max_step(),
            missed_deadline_policy: MissedDeadlinePolicy::default(),
            default_cycle_time_ms: None,
            message_filter: None,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// Create a new simulator configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the generator step
    pub fn with_max_step(mut self, max_step: f64) -> Self {
        self.max_step = max_step;
        self
    }

    /// Builder method: set the missed-deadline policy
    pub fn with_missed_deadline_policy(mut self, policy: MissedDeadlinePolicy) -> Self {
        self.missed_deadline_policy = policy;
        self
    }

    /// Builder method: schedule messages without a period at this one
    pub fn with_default_cycle_time(mut self, cycle_time_ms: u64) -> Self {
        self.default_cycle_time_ms = Some(cycle_time_ms);
        self
    }

    /// Builder method: set message filter
    pub fn with_message_filter(mut self, messages: Vec<u32>) -> Self {
        self.message_filter = Some(messages);
        self
    }

    /// Builder method: seed the generator
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Check if a message ID should be processed
    pub fn should_process_message(&self, can_id: u32) -> bool {
        match &self.message_filter {
            Some(messages) => messages.contains(&can_id),
            None => true,
        }
    }

    /// Effective period for a message, if it is to be scheduled at all
    ///
    /// A period of zero is treated as "not scheduled".
    pub fn cycle_time_for(&self, message_cycle_time_ms: Option<u64>) -> Option<Duration> {
        message_cycle_time_ms
            .or(self.default_cycle_time_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulator_config_builder() {
        let config = SimulatorConfig::new()
            .with_max_step(4.0)
            .with_missed_deadline_policy(MissedDeadlinePolicy::CatchUp)
            .with_default_cycle_time(250)
            .with_seed(7);

        assert_eq!(config.max_step, 4.0);
        assert_eq!(config.missed_deadline_policy, MissedDeadlinePolicy::CatchUp);
        assert_eq!(config.default_cycle_time_ms, Some(250));
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn test_defaults() {
        let config = SimulatorConfig::default();
        assert_eq!(config.max_step, 10.0);
        assert_eq!(config.missed_deadline_policy, MissedDeadlinePolicy::Realign);
        assert!(config.should_process_message(0x123));
    }

    #[test]
    fn test_filter_logic() {
        let config = SimulatorConfig::new().with_message_filter(vec![0x123, 0x456]);

        assert!(config.should_process_message(0x123));
        assert!(config.should_process_message(0x456));
        assert!(!config.should_process_message(0x789));
    }

    #[test]
    fn test_cycle_time_resolution() {
        let config = SimulatorConfig::new();
        assert_eq!(config.cycle_time_for(Some(100)), Some(Duration::from_millis(100)));
        assert_eq!(config.cycle_time_for(None), None);
        assert_eq!(config.cycle_time_for(Some(0)), None);

        let config = config.with_default_cycle_time(50);
        assert_eq!(config.cycle_time_for(None), Some(Duration::from_millis(50)));
        assert_eq!(config.cycle_time_for(Some(20)), Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SimulatorConfig =
            serde_json::from_str(r#"{"missed_deadline_policy": "catch_up"}"#).unwrap();
        assert_eq!(config.max_step, 10.0);
        assert_eq!(config.missed_deadline_policy, MissedDeadlinePolicy::CatchUp);
    }
}
