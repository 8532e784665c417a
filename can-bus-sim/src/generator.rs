//! Live value generator
//!
//! Produces plausible, slowly evolving physical values for synthetic traffic:
//! a uniform start inside each signal's `[min, max]`, then a bounded random
//! walk. The generator keeps no per-signal history; callers store the last
//! values in a [`GeneratorState`].

use crate::config::SimulatorConfig;
use crate::signals::catalog::{MessageDefinition, SignalDefinition};
use crate::types::SignalValues;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Last emitted physical values of one message, keyed by signal name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratorState {
    values: SignalValues,
}

impl GeneratorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, signal_name: &str) -> Option<f64> {
        self.values.get(signal_name).copied()
    }

    pub fn values(&self) -> &SignalValues {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Random-walk value source
pub struct LiveValueGenerator<R = StdRng> {
    rng: R,
    max_step: f64,
}

impl LiveValueGenerator<StdRng> {
    /// Create a generator seeded from the operating system
    pub fn new(max_step: f64) -> Self {
        Self::with_rng(StdRng::from_entropy(), max_step)
    }

    /// Create a reproducible generator
    pub fn seeded(max_step: f64, seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed), max_step)
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        match config.seed {
            Some(seed) => Self::seeded(config.max_step, seed),
            None => Self::new(config.max_step),
        }
    }
}

impl<R: Rng> LiveValueGenerator<R> {
    pub fn with_rng(rng: R, max_step: f64) -> Self {
        Self {
            rng,
            max_step: max_step.abs(),
        }
    }

    pub fn max_step(&self) -> f64 {
        self.max_step
    }

    /// First value of a signal: uniform over `[min, max]`
    pub fn initial(&mut self, signal: &SignalDefinition) -> f64 {
        if signal.min >= signal.max {
            return signal.min;
        }
        self.rng.gen_range(signal.min..=signal.max)
    }

    /// Next value of a signal: `previous` moved by at most `max_step / 2`
    ///
    /// Draws uniformly from the part of `[previous - max_step/2,
    /// previous + max_step/2]` that lies inside `[min, max]`, which is the
    /// distribution of resampling the full window until the result is in
    /// bounds. A `previous` too far outside the bounds to reach them is
    /// clamped.
    pub fn next(&mut self, signal: &SignalDefinition, previous: f64) -> f64 {
        if signal.min >= signal.max {
            return signal.min;
        }

        let half_step = self.max_step / 2.0;
        if half_step == 0.0 || !half_step.is_finite() {
            return previous.clamp(signal.min, signal.max);
        }

        let low = (previous - half_step).max(signal.min);
        let high = (previous + half_step).min(signal.max);

        if low > high {
            log::debug!(
                "{} = {} cannot reach [{}, {}], clamping",
                signal.name,
                previous,
                signal.min,
                signal.max
            );
            previous.clamp(signal.min, signal.max)
        } else if low == high {
            low
        } else {
            self.rng.gen_range(low..=high)
        }
    }

    /// Produce the next value of every signal of a message
    ///
    /// Signals seen for the first time start from [`initial`](Self::initial);
    /// all others continue their walk. `state` is updated in place.
    pub fn next_values(
        &mut self,
        message: &MessageDefinition,
        state: &mut GeneratorState,
    ) -> SignalValues {
        for signal in &message.signals {
            let value = match state.get(&signal.name) {
                Some(previous) => self.next(signal, previous),
                None => self.initial(signal),
            };
            state.values.insert(signal.name.clone(), value);
        }
        state.values.clone()
    }
}
