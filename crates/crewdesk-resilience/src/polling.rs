//! ---
//! cd_section: "07-resilience-fault-tolerance"
//! cd_subsection: "module"
//! cd_type: "source"
//! cd_scope: "code"
//! cd_description: "Resilience strategies for background polling."
//! cd_version: "v0.0.0-prealpha"
//! cd_owner: "tbd"
//! ---
//! Explicit polling circuit.
//!
//! A loop reports each run to a [`PollingCircuit`]. Failures back off
//! exponentially up to a cap; after `max_consecutive_failures` in a row the
//! circuit suspends and stays suspended until [`PollingCircuit::resume`] is
//! called. Nothing resumes on its own.

use std::fmt;
use std::time::Duration;

use crewdesk_common::config::PollingConfig;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::metrics::ResilienceMetrics;

const MAX_EXPONENT: u32 = 16;

/// Current state of a polling circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PollingState {
    /// Running on the regular schedule.
    Polling,
    /// Retrying after `attempt` consecutive failures.
    BackingOff {
        /// Consecutive failures so far.
        attempt: u32,
    },
    /// Stopped until an operator resumes it.
    Suspended,
}

impl PollingState {
    /// Every label returned by [`label`](Self::label).
    pub const LABELS: &'static [&'static str] = &["polling", "backing_off", "suspended"];

    /// Static label for metrics and status payloads.
    pub fn label(&self) -> &'static str {
        match self {
            PollingState::Polling => "polling",
            PollingState::BackingOff { .. } => "backing_off",
            PollingState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for PollingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the loop should do after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDirective {
    /// Try again after the delay.
    RetryAfter(Duration),
    /// Stop polling until resumed.
    Suspend,
}

/// Bounds for retries and suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    /// Failures in a row that suspend the circuit.
    pub max_consecutive_failures: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Ceiling for any delay, jitter included.
    pub max_delay: Duration,
    /// Maximum random delay added to each retry.
    pub jitter: Duration,
}

impl PollingPolicy {
    /// Construct a policy; at least one failure is always tolerated.
    pub fn new(
        max_consecutive_failures: u32,
        base_delay: Duration,
        max_delay: Duration,
        jitter: Duration,
    ) -> Self {
        Self {
            max_consecutive_failures: max_consecutive_failures.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
            jitter,
        }
    }

    /// Policy from the `sweeper.polling` configuration table.
    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(
            config.max_consecutive_failures,
            config.base_delay,
            config.max_delay,
            config.jitter,
        )
    }

    /// Delay for the given attempt (1-indexed) with exponential growth.
    fn backoff_delay(&self, attempt: u32, rng: &mut StdRng) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_EXPONENT);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        let delay = if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base.saturating_add(Duration::from_millis(jitter_ms))
        };
        delay.min(self.max_delay)
    }
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

#[derive(Debug)]
struct Inner {
    state: PollingState,
    consecutive_failures: u32,
    rng: StdRng,
}

/// Thread-safe polling circuit shared between a loop and its operators.
#[derive(Debug)]
pub struct PollingCircuit {
    name: String,
    policy: PollingPolicy,
    inner: Mutex<Inner>,
    resumed: Notify,
    metrics: Option<ResilienceMetrics>,
}

impl PollingCircuit {
    /// Create a circuit in the [`PollingState::Polling`] state.
    pub fn new(
        name: impl Into<String>,
        policy: PollingPolicy,
        metrics: Option<ResilienceMetrics>,
    ) -> Self {
        let circuit = Self {
            name: name.into(),
            policy,
            inner: Mutex::new(Inner {
                state: PollingState::Polling,
                consecutive_failures: 0,
                rng: StdRng::from_entropy(),
            }),
            resumed: Notify::new(),
            metrics,
        };
        if let Some(metrics) = &circuit.metrics {
            metrics.record_transition(&circuit.name, PollingState::Polling);
        }
        circuit
    }

    /// Seed the internal RNG for deterministic testing.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.inner.get_mut().rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Loop name used in logs and metric labels.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> PollingState {
        self.inner.lock().state
    }

    /// Whether the circuit is waiting for [`resume`](Self::resume).
    pub fn is_suspended(&self) -> bool {
        self.state() == PollingState::Suspended
    }

    /// Failures recorded since the last success or resume.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Report a successful run; resets any backoff.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != PollingState::Polling {
            info!(
                target: "crewdesk::resilience::polling",
                circuit = %self.name,
                previous = %inner.state,
                "polling recovered",
            );
            inner.state = PollingState::Polling;
            self.transition(PollingState::Polling);
        }
    }

    /// Report a failed run and learn what to do next.
    pub fn record_failure(&self) -> PollDirective {
        let mut inner = self.inner.lock();
        if inner.state == PollingState::Suspended {
            return PollDirective::Suspend;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let attempt = inner.consecutive_failures;

        if attempt >= self.policy.max_consecutive_failures {
            inner.state = PollingState::Suspended;
            warn!(
                target: "crewdesk::resilience::polling",
                circuit = %self.name,
                failures = attempt,
                "polling suspended after consecutive failures",
            );
            self.transition(PollingState::Suspended);
            return PollDirective::Suspend;
        }

        let delay = self.policy.backoff_delay(attempt, &mut inner.rng);
        inner.state = PollingState::BackingOff { attempt };
        warn!(
            target: "crewdesk::resilience::polling",
            circuit = %self.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "polling failed; backing off",
        );
        self.transition(inner.state);
        if let Some(metrics) = &self.metrics {
            metrics.observe_backoff(&self.name, delay);
        }
        PollDirective::RetryAfter(delay)
    }

    /// Leave [`PollingState::Suspended`]. Returns `false` when the circuit was
    /// not suspended.
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != PollingState::Suspended {
            return false;
        }
        inner.state = PollingState::Polling;
        inner.consecutive_failures = 0;
        drop(inner);

        info!(
            target: "crewdesk::resilience::polling",
            circuit = %self.name,
            "polling resumed by operator",
        );
        self.transition(PollingState::Polling);
        self.resumed.notify_one();
        true
    }

    /// Wait until the circuit is no longer suspended.
    pub async fn wait_resumed(&self) {
        while self.is_suspended() {
            self.resumed.notified().await;
        }
    }

    fn transition(&self, state: PollingState) {
        if let Some(metrics) = &self.metrics {
            metrics.record_transition(&self.name, state);
        }
    }
}
