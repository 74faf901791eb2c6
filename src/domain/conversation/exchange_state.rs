//! Exchange state machine.
//!
//! Defines the lifecycle of one streamed user turn and its valid transitions.

use serde::{Deserialize, Serialize};

use crate::domain::foundation::StateMachine;

/// The lifecycle state of an exchange.
///
/// - `Idle`: nothing submitted yet
/// - `Sending`: user message and placeholder persisted, connection opening
/// - `Streaming`: connection open, fragments being committed
/// - `Completed`, `Cancelled`, `Failed`: terminal, placeholder finalised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeState {
    #[default]
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

impl ExchangeState {
    /// Returns true while the exchange holds the placeholder open.
    ///
    /// The controller's loading flag mirrors this for the current exchange.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

impl StateMachine for ExchangeState {
    fn can_transition_to(&self, target: &Self) -> bool {
        self.valid_transitions().contains(target)
    }

    fn valid_transitions(&self) -> Vec<Self> {
        use ExchangeState::*;
        match self {
            Idle => vec![Sending],
            // Completed straight from Sending is the single-shot path; Failed
            // and Cancelled cover a refused connection or an early stop.
            Sending => vec![Streaming, Completed, Cancelled, Failed],
            Streaming => vec![Completed, Cancelled, Failed],
            Completed | Cancelled | Failed => vec![],
        }
    }
}
