// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Invocation state machine with typed state transitions.
//!
//! Implements the sandbox lifecycle:
//! Created → Provisioning → Running → {Completed | TimedOut | Failed} → TornDown.
//! Invalid transitions result in StateTransitionError.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::types::SandboxId;

/// Invocation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationState {
    /// Request accepted, nothing allocated yet.
    Created,

    /// Artifact fetched or being fetched, backend preparing the sandbox.
    Provisioning,

    /// Handler executing inside the sandbox.
    Running,

    /// Handler returned before the deadline.
    Completed,

    /// Deadline elapsed; the sandbox was terminated.
    TimedOut,

    /// Provisioning or the handler failed.
    Failed,

    /// Sandbox resources released. Terminal.
    TornDown,
}

impl InvocationState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Provisioning => "Provisioning",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::TimedOut => "TimedOut",
            Self::Failed => "Failed",
            Self::TornDown => "TornDown",
        }
    }

    /// Whether this state carries the invocation's outcome.
    pub const fn is_outcome(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: InvocationState) -> bool {
        matches!(
            (self, target),
            (Self::Created, Self::Provisioning) |
            (Self::Provisioning, Self::Running) |
            // Fetch failure, limiter refusal, prepare failure or timeout
            (Self::Provisioning, Self::Failed) |
            (Self::Provisioning, Self::TimedOut) |
            (Self::Running, Self::Completed) |
            (Self::Running, Self::TimedOut) |
            (Self::Running, Self::Failed) |
            (Self::Completed, Self::TornDown) |
            (Self::TimedOut, Self::TornDown) |
            (Self::Failed, Self::TornDown)
        )
    }
}

impl std::fmt::Display for InvocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// State machine for one invocation.
/// Enforces valid transitions and records when each state was entered.
#[derive(Debug)]
pub struct InvocationStateMachine {
    sandbox_id: SandboxId,
    current_state: InvocationState,
    created_at: Instant,
    last_transition: Instant,
    outcome: Option<InvocationState>,
    history: Vec<(InvocationState, Duration)>,
}

impl InvocationStateMachine {
    pub fn new(sandbox_id: SandboxId) -> Self {
        let now = Instant::now();
        Self {
            sandbox_id,
            current_state: InvocationState::Created,
            created_at: now,
            last_transition: now,
            outcome: None,
            history: Vec::with_capacity(4),
        }
    }

    pub fn state(&self) -> InvocationState {
        self.current_state
    }

    pub fn sandbox_id(&self) -> &SandboxId {
        &self.sandbox_id
    }

    /// The terminal outcome, once one was reached. Survives teardown.
    pub fn outcome(&self) -> Option<InvocationState> {
        self.outcome
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> Duration {
        self.last_transition.elapsed()
    }

    /// Time spent in each state left so far, in order.
    pub fn history(&self) -> &[(InvocationState, Duration)] {
        &self.history
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: InvocationState) -> Result<(), StateTransitionError> {
        if self.current_state == InvocationState::TornDown {
            return Err(StateTransitionError::TerminalState {
                sandbox_id: self.sandbox_id.to_string(),
                state: self.current_state.name(),
            });
        }

        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                sandbox_id: self.sandbox_id.to_string(),
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            sandbox_id = %self.sandbox_id,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.history
            .push((self.current_state, self.last_transition.elapsed()));
        self.current_state = target;
        self.last_transition = Instant::now();
        if target.is_outcome() {
            self.outcome = Some(target);
        }

        Ok(())
    }

    /// Total time since the invocation was created.
    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Snapshot of a state machine for logs and metrics.
#[derive(Debug, Clone, Serialize)]
pub struct StateMachineMetrics {
    pub sandbox_id: String,
    pub current_state: String,
    pub outcome: Option<String>,
    pub elapsed_ms: u64,
    pub transition_count: usize,
}

impl From<&InvocationStateMachine> for StateMachineMetrics {
    fn from(sm: &InvocationStateMachine) -> Self {
        Self {
            sandbox_id: sm.sandbox_id.to_string(),
            current_state: sm.current_state.name().to_string(),
            outcome: sm.outcome.map(|o| o.name().to_string()),
            elapsed_ms: sm.elapsed().as_millis() as u64,
            transition_count: sm.history.len(),
        }
    }
}
