// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Connection and acceptor state machines with typed state transitions.
//!
//! Connection lifecycle: Closed → Connecting → Connected → Closed.
//! Acceptor lifecycle: Uninitialized → Listening → Uninitialized.
//! Invalid transitions result in StateTransitionError.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected. Initial and final state.
    Closed,

    /// Handshake in progress.
    Connecting,

    /// Both ring buffers are attached and the side-channel is live.
    Connected,
}

impl ConnectionState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        }
    }

    /// Check if transition to the target state is valid.
    pub fn can_transition_to(&self, target: ConnectionState) -> bool {
        matches!(
            (self, target),
            (Self::Closed, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connecting, Self::Closed)
                | (Self::Connected, Self::Closed)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Acceptor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptorState {
    Uninitialized,
    Listening,
}

impl AcceptorState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Listening => "Listening",
        }
    }

    pub fn can_transition_to(&self, target: AcceptorState) -> bool {
        matches!(
            (self, target),
            (Self::Uninitialized, Self::Listening) | (Self::Listening, Self::Uninitialized)
        )
    }
}

impl std::fmt::Display for AcceptorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Common surface of the two lifecycle enums.
pub trait Lifecycle: Copy + PartialEq + std::fmt::Debug {
    /// Name of the machine in logs and errors.
    const MACHINE: &'static str;

    fn name(&self) -> &'static str;
    fn can_transition_to(&self, target: Self) -> bool;
}

impl Lifecycle for ConnectionState {
    const MACHINE: &'static str = "connection";

    fn name(&self) -> &'static str {
        ConnectionState::name(self)
    }

    fn can_transition_to(&self, target: Self) -> bool {
        ConnectionState::can_transition_to(self, target)
    }
}

impl Lifecycle for AcceptorState {
    const MACHINE: &'static str = "acceptor";

    fn name(&self) -> &'static str {
        AcceptorState::name(self)
    }

    fn can_transition_to(&self, target: Self) -> bool {
        AcceptorState::can_transition_to(self, target)
    }
}

/// State machine enforcing valid transitions and tracking timing metrics.
#[derive(Debug)]
pub struct StateMachine<S: Lifecycle> {
    current_state: S,
    last_transition: Instant,
    transition_count: u64,
}

pub type ConnectionStateMachine = StateMachine<ConnectionState>;
pub type AcceptorStateMachine = StateMachine<AcceptorState>;

impl<S: Lifecycle> StateMachine<S> {
    /// Create a state machine in `initial`.
    pub fn new(initial: S) -> Self {
        Self {
            current_state: initial,
            last_transition: Instant::now(),
            transition_count: 0,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> S {
        self.current_state
    }

    /// Get time since last transition.
    pub fn time_in_current_state(&self) -> std::time::Duration {
        self.last_transition.elapsed()
    }

    /// Get total number of transitions.
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&mut self, target: S) -> Result<(), StateTransitionError> {
        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                machine: S::MACHINE,
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        tracing::debug!(
            machine = S::MACHINE,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.current_state = target;
        self.last_transition = Instant::now();
        self.transition_count += 1;

        Ok(())
    }
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new(ConnectionState::Closed)
    }
}

impl Default for AcceptorStateMachine {
    fn default() -> Self {
        Self::new(AcceptorState::Uninitialized)
    }
}
