//! The virtual user runtime.
//!
//! A [`VirtualUser`] is one simulated client. It owns its context, its
//! random generator and exactly one [`Behavior`], and loops until cancelled:
//! think, pick the next action, send it, classify, record. Cancellation is
//! observed only while thinking and between journey steps; a request in
//! flight always runs to completion or to its timeout.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::context::{PreconditionUnmet, UserContext};
use crate::errors::ConfigError;
use crate::journey::{JourneyMachine, StepResult};
use crate::metrics;
use crate::outcome::Outcome;
use crate::scheduler::WeightedSelector;
use crate::stats::StatsAggregator;
use crate::transport::Transport;

/// Think time between actions, sampled uniformly from `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTime {
    pub min: Duration,
    pub max: Duration,
}

impl WaitTime {
    pub fn between(min: Duration, max: Duration) -> Result<Self, ConfigError> {
        if min > max {
            return Err(ConfigError::InvalidRunConfig(format!(
                "wait time minimum {:?} exceeds maximum {:?}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn constant(wait: Duration) -> Self {
        Self {
            min: wait,
            max: wait,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.min >= self.max {
            self.min
        } else {
            rng.gen_range(self.min..=self.max)
        }
    }
}

impl Default for WaitTime {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(3),
        }
    }
}

/// Resolves once the run is cancelled or the controller is gone.
pub(crate) async fn stopped(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// What a user does each cycle.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Independent weighted tasks.
    Tasks(WeightedSelector),
    /// An ordered journey, repeated.
    Journey(JourneyMachine),
}

/// Result of running one action.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionRun {
    /// The request was sent and classified.
    Completed(Outcome),
    /// A precondition was unmet; nothing was sent or recorded.
    Skipped(PreconditionUnmet),
}

/// Totals reported when a user terminates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSummary {
    pub user_id: usize,
    pub user_type: String,
    pub requests: u64,
    pub failures: u64,
    pub skipped: u64,
}

pub struct VirtualUser {
    id: usize,
    user_type: String,
    host: String,
    wait_time: WaitTime,
    request_timeout: Duration,
    behavior: Behavior,
    on_start: Option<Action>,
    on_stop: Option<Action>,
    context: UserContext,
    rng: StdRng,
    transport: Arc<dyn Transport>,
    aggregator: StatsAggregator,
    summary: UserSummary,
}

impl VirtualUser {
    pub fn new(
        id: usize,
        user_type: impl Into<String>,
        host: impl Into<String>,
        behavior: Behavior,
        transport: Arc<dyn Transport>,
        aggregator: StatsAggregator,
    ) -> Self {
        let user_type = user_type.into();
        Self {
            id,
            host: host.into(),
            wait_time: WaitTime::default(),
            request_timeout: Duration::from_secs(30),
            behavior,
            on_start: None,
            on_stop: None,
            context: UserContext::new(),
            rng: StdRng::from_entropy(),
            transport,
            aggregator,
            summary: UserSummary {
                user_id: id,
                user_type: user_type.clone(),
                ..UserSummary::default()
            },
            user_type,
        }
    }

    pub fn with_wait_time(mut self, wait_time: WaitTime) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Seed the generator with `seed ^ id` so runs are reproducible per user.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed ^ self.id as u64);
        }
        self
    }

    pub fn with_hooks(mut self, on_start: Option<Action>, on_stop: Option<Action>) -> Self {
        self.on_start = on_start;
        self.on_stop = on_stop;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn user_type(&self) -> &str {
        &self.user_type
    }

    pub fn context(&self) -> &UserContext {
        &self.context
    }

    /// Run until `cancel` turns true (or its sender is dropped).
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) -> UserSummary {
        info!(user_id = self.id, user_type = %self.user_type, host = %self.host, "Virtual user started");

        if let Some(on_start) = self.on_start.clone() {
            self.execute(&on_start).await;
        }

        loop {
            if *cancel.borrow() {
                break;
            }

            let wait = self.wait_time.sample(&mut self.rng);
            tokio::select! {
                _ = time::sleep(wait) => {}
                _ = stopped(&mut cancel) => break,
            }

            self.cycle(&cancel).await;
        }

        if let Some(on_stop) = self.on_stop.clone() {
            self.execute(&on_stop).await;
        }

        info!(
            user_id = self.id,
            user_type = %self.user_type,
            requests = self.summary.requests,
            failures = self.summary.failures,
            "Virtual user stopped"
        );
        self.summary
    }

    /// One cycle: a single task, or journey steps up to the first one that
    /// sends a request.
    async fn cycle(&mut self, cancel: &watch::Receiver<bool>) {
        let journey_step = match &mut self.behavior {
            Behavior::Tasks(selector) => {
                let action = selector.select(&mut self.rng).clone();
                self.execute(&action).await;
                return;
            }
            Behavior::Journey(machine) => machine.current().clone(),
        };

        let mut step = journey_step;
        loop {
            let run = self.execute(&step.action).await;
            let result = match &run {
                ActionRun::Completed(outcome) if outcome.succeeded => StepResult::Succeeded,
                ActionRun::Completed(_) => StepResult::Failed,
                ActionRun::Skipped(_) => StepResult::Skipped,
            };

            let Behavior::Journey(machine) = &mut self.behavior else {
                return;
            };
            let journey = machine.journey().name().to_string();
            if result == StepResult::Skipped {
                self.aggregator.record_step_skipped(&journey);
                metrics::observe_step_skipped(&journey, step.action.name());
            }

            let state = machine.advance(result);
            if state.is_terminal() {
                self.aggregator.record_journey_cycle(&journey, state);
                metrics::observe_journey_cycle(&journey, state);
                return;
            }
            if result != StepResult::Skipped || *cancel.borrow() {
                return;
            }
            step = machine.current().clone();
        }
    }

    /// Prepare, send and classify one action, then record its outcome.
    pub async fn execute(&mut self, action: &Action) -> ActionRun {
        let handler = action.handler();
        let prepared = match handler.prepare(&self.context, &mut self.rng) {
            Ok(prepared) => prepared,
            Err(unmet) => {
                debug!(
                    user_id = self.id,
                    action = action.name(),
                    missing = %unmet.key,
                    "Skipping action with unmet precondition"
                );
                self.summary.skipped += 1;
                return ActionRun::Skipped(unmet);
            }
        };
        let request = prepared.to_request(&self.host);

        let started = Instant::now();
        let result = time::timeout(self.request_timeout, self.transport.send(&request)).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Err(_) => Outcome::timed_out(self.request_timeout, elapsed),
            Ok(result) => {
                let outcome = Outcome::classify(&result, elapsed, handler.expectation());
                match (&result, outcome.succeeded) {
                    (Ok(reply), true) => {
                        match handler.absorb(&prepared, reply, &mut self.context) {
                            Ok(()) => outcome,
                            Err(reason) => outcome.into_extraction_failure(reason),
                        }
                    }
                    _ => outcome,
                }
            }
        };

        if outcome.succeeded {
            debug!(
                user_id = self.id,
                action = action.name(),
                status_code = ?outcome.status_code,
                latency_ms = outcome.latency.as_millis() as u64,
                "Action succeeded"
            );
        } else {
            warn!(
                user_id = self.id,
                action = action.name(),
                url = %request.url,
                status_code = ?outcome.status_code,
                error = outcome.reason(),
                "Action failed"
            );
            self.summary.failures += 1;
        }
        self.summary.requests += 1;

        self.aggregator
            .record(&self.user_type, action.name(), &outcome);
        metrics::observe_outcome(&self.user_type, action.name(), &outcome);
        ActionRun::Completed(outcome)
    }
}
