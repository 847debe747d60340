//! Journeys: ordered, stateful sequences of steps walked by one user.
//!
//! A [`JourneyMachine`] tracks where a user is in its journey. The runtime
//! asks it for the [`current`](JourneyMachine::current) step, runs it, and
//! reports back with [`advance`](JourneyMachine::advance). A terminal state
//! (completed or aborted) resets to the first step on the next `current`
//! call, so a journey repeats for the life of the user.

use std::sync::Arc;
use tracing::{debug, error};

use crate::action::Action;
use crate::errors::ConfigError;

/// What a failed step means for the rest of the journey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepPolicy {
    /// Failure aborts the journey.
    #[default]
    Required,
    /// Failure is recorded and the journey continues.
    Optional,
}

/// How often a failing step is attempted before its policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// One attempt, no retry.
    pub const NONE: RetryPolicy = RetryPolicy { max_attempts: 1 };

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NONE
    }
}

#[derive(Debug, Clone)]
pub struct JourneyStep {
    pub action: Action,
    pub policy: StepPolicy,
    pub retry: RetryPolicy,
}

impl JourneyStep {
    pub fn required(action: Action) -> Self {
        Self {
            action,
            policy: StepPolicy::Required,
            retry: RetryPolicy::NONE,
        }
    }

    pub fn optional(action: Action) -> Self {
        Self {
            action,
            policy: StepPolicy::Optional,
            retry: RetryPolicy::NONE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A named, non-empty sequence of steps.
#[derive(Debug, Clone)]
pub struct Journey {
    name: String,
    steps: Vec<JourneyStep>,
}

impl Journey {
    pub fn new(name: impl Into<String>, steps: Vec<JourneyStep>) -> Result<Self, ConfigError> {
        let name = name.into();
        if steps.is_empty() {
            return Err(ConfigError::EmptyJourney(name));
        }
        Ok(Self { name, steps })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[JourneyStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JourneyState {
    NotStarted,
    /// `attempt` is 1-based.
    Running { step: usize, attempt: u32 },
    Completed,
    Aborted { step: usize },
}

impl JourneyState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JourneyState::Completed | JourneyState::Aborted { .. })
    }
}

/// How a step turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Succeeded,
    Failed,
    /// A precondition was unmet; the step did not run.
    Skipped,
}

/// Position of one user within its journey.
#[derive(Debug, Clone)]
pub struct JourneyMachine {
    journey: Arc<Journey>,
    state: JourneyState,
}

impl JourneyMachine {
    pub fn new(journey: Arc<Journey>) -> Self {
        Self {
            journey,
            state: JourneyState::NotStarted,
        }
    }

    pub fn journey(&self) -> &Journey {
        &self.journey
    }

    pub fn state(&self) -> JourneyState {
        self.state
    }

    /// Step to run next, starting a new cycle if none is in progress.
    pub fn current(&mut self) -> &JourneyStep {
        let step = match self.state {
            JourneyState::Running { step, .. } => step,
            _ => {
                self.state = JourneyState::Running {
                    step: 0,
                    attempt: 1,
                };
                0
            }
        };
        &self.journey.steps[step]
    }

    /// Apply the result of the current step and return the new state.
    pub fn advance(&mut self, result: StepResult) -> JourneyState {
        let JourneyState::Running { step, attempt } = self.state else {
            error!(
                journey = %self.journey.name,
                state = ?self.state,
                "Journey advanced without a running step"
            );
            debug_assert!(false, "advance called outside Running state");
            return self.state;
        };

        let current = &self.journey.steps[step];
        let next = match result {
            StepResult::Succeeded | StepResult::Skipped => self.next_step(step),
            StepResult::Failed if attempt < current.retry.max_attempts => JourneyState::Running {
                step,
                attempt: attempt + 1,
            },
            StepResult::Failed => match current.policy {
                StepPolicy::Optional => self.next_step(step),
                StepPolicy::Required => JourneyState::Aborted { step },
            },
        };

        debug!(
            journey = %self.journey.name,
            step = current.action.name(),
            result = ?result,
            state = ?next,
            "Journey advanced"
        );
        self.state = next;
        next
    }

    fn next_step(&self, step: usize) -> JourneyState {
        if step + 1 < self.journey.steps.len() {
            JourneyState::Running {
                step: step + 1,
                attempt: 1,
            }
        } else {
            JourneyState::Completed
        }
    }
}
