//! Reconciliation of simulated method invocations with server outcomes.
//!
//! Every invocation goes through a small state machine:
//!
//! ```text
//! Simulating -> Simulated -> AwaitingServer -> Confirmed
//!                                          \-> Failed
//! ```
//!
//! # Algorithm
//!
//! 1. Record the invocation before running its simulation
//! 2. Attach the committed simulated writes once the simulation returns
//! 3. Wait for exactly one terminal response from the server
//! 4. Retract all of the invocation's overlays from the local store
//! 5. Keep the outcome in a bounded history so late duplicates are recognized
//!
//! The server's data writes never pass through here: they arrive on the
//! publication channel and land in the base layer before the terminal
//! response does.

use crate::{InvocationId, LocalStore, MethodError, SimulatedWrite};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Settled outcomes remembered for duplicate detection.
pub const SETTLED_HISTORY: usize = 128;

/// Where an invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvocationState {
    /// The local simulation is running
    Simulating,
    /// The simulation committed; not yet handed to the channel
    Simulated,
    /// Waiting for the server's terminal response
    AwaitingServer,
    /// The server returned a result
    Confirmed,
    /// The server (or the reconnect policy) returned an error
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, InvocationState::Confirmed | InvocationState::Failed)
    }
}

/// The terminal outcome of an invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Outcome {
    Confirmed { result: serde_json::Value },
    Failed { error: MethodError },
}

impl Outcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, Outcome::Confirmed { .. })
    }

    /// Convert into a plain `Result`.
    pub fn into_result(self) -> std::result::Result<serde_json::Value, MethodError> {
        match self {
            Outcome::Confirmed { result } => Ok(result),
            Outcome::Failed { error } => Err(error),
        }
    }
}

/// Bookkeeping for one method invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRecord {
    pub id: InvocationId,
    pub name: String,
    pub args: serde_json::Value,
    pub random_seed: String,
    pub state: InvocationState,
    /// Writes attributed to this invocation, in issue order
    pub simulated_writes: Vec<SimulatedWrite>,
    /// Whether the method message has been handed to the channel
    pub sent: bool,
    /// Whether the invocation was resent after a reconnect
    pub resent: bool,
}

/// Tracks in-flight invocations and settles each exactly once.
#[derive(Debug, Default)]
pub struct Reconciler {
    /// Unsettled invocations in invocation order
    pending: Vec<InvocationRecord>,
    settled: VecDeque<(InvocationId, Outcome)>,
}

impl Reconciler {
    /// Create an empty reconciler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new invocation in the `Simulating` state.
    pub fn begin(
        &mut self,
        id: impl Into<InvocationId>,
        name: impl Into<String>,
        args: serde_json::Value,
        random_seed: impl Into<String>,
    ) -> &mut InvocationRecord {
        self.pending.push(InvocationRecord {
            id: id.into(),
            name: name.into(),
            args,
            random_seed: random_seed.into(),
            state: InvocationState::Simulating,
            simulated_writes: Vec::new(),
            sent: false,
            resent: false,
        });
        let last = self.pending.len() - 1;
        &mut self.pending[last]
    }

    /// The simulation committed these writes.
    pub fn simulated(&mut self, id: &str, writes: Vec<SimulatedWrite>) {
        if let Some(record) = self.get_mut(id) {
            record.simulated_writes = writes;
            record.state = InvocationState::Simulated;
        }
    }

    /// The simulation raised an error: forget the invocation. No write was
    /// made visible, so nothing is retracted.
    pub fn abandon(&mut self, id: &str) -> Option<InvocationRecord> {
        let index = self.pending.iter().position(|r| r.id == id)?;
        Some(self.pending.remove(index))
    }

    /// The invocation now waits for the server.
    pub fn await_server(&mut self, id: &str) {
        if let Some(record) = self.get_mut(id) {
            record.state = InvocationState::AwaitingServer;
        }
    }

    /// Apply the terminal outcome of an invocation.
    ///
    /// Retracts the invocation's simulated writes from `store` and returns
    /// the outcome. Returns `None`, touching nothing, for a duplicate or
    /// unknown response.
    pub fn settle(&mut self, id: &str, outcome: Outcome, store: &mut LocalStore) -> Option<Outcome> {
        let Some(index) = self.pending.iter().position(|r| r.id == id) else {
            if self.settled.iter().any(|(settled, _)| settled == id) {
                tracing::warn!(invocation_id = %id, "Ignoring duplicate terminal response");
            } else {
                tracing::warn!(invocation_id = %id, "Ignoring response for unknown invocation");
            }
            return None;
        };

        let mut record = self.pending.remove(index);
        store.retract(&record.id);
        record.state = if outcome.is_confirmed() {
            InvocationState::Confirmed
        } else {
            InvocationState::Failed
        };
        tracing::debug!(
            invocation_id = %record.id,
            method = %record.name,
            state = ?record.state,
            writes = record.simulated_writes.len(),
            "Invocation settled"
        );

        if self.settled.len() == SETTLED_HISTORY {
            self.settled.pop_front();
        }
        self.settled.push_back((record.id, outcome.clone()));
        Some(outcome)
    }

    /// Get an unsettled invocation.
    pub fn get(&self, id: &str) -> Option<&InvocationRecord> {
        self.pending.iter().find(|r| r.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut InvocationRecord> {
        self.pending.iter_mut().find(|r| r.id == id)
    }

    /// Current state of an invocation, settled ones included while they
    /// are remembered.
    pub fn state(&self, id: &str) -> Option<InvocationState> {
        if let Some(record) = self.get(id) {
            return Some(record.state);
        }
        self.settled
            .iter()
            .find(|(settled, _)| settled == id)
            .map(|(_, outcome)| {
                if outcome.is_confirmed() {
                    InvocationState::Confirmed
                } else {
                    InvocationState::Failed
                }
            })
    }

    /// The remembered outcome of a settled invocation.
    pub fn outcome(&self, id: &str) -> Option<&Outcome> {
        self.settled
            .iter()
            .find(|(settled, _)| settled == id)
            .map(|(_, outcome)| outcome)
    }

    /// Unsettled invocations in invocation order.
    pub fn pending(&self) -> impl Iterator<Item = &InvocationRecord> {
        self.pending.iter()
    }

    pub fn pending_mut(&mut self) -> impl Iterator<Item = &mut InvocationRecord> {
        self.pending.iter_mut()
    }

    /// Ids of unsettled invocations.
    pub fn pending_ids(&self) -> Vec<InvocationId> {
        self.pending.iter().map(|r| r.id.clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
