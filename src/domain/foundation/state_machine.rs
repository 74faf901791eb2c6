//! Legal-edge bookkeeping for lifecycle enums.
//!
//! `ExchangeState` is the implementor that matters: the reconciler asks it
//! for the next state instead of assigning one, so an exchange that already
//! reached `Completed`, `Cancelled` or `Failed` stays there.

use super::ValidationError;

/// A `Copy` status enum whose moves are constrained to a fixed edge set.
///
/// ```ignore
/// let next = ExchangeState::Sending.transition_to(ExchangeState::Streaming)?;
/// assert!(!next.is_terminal());
/// ```
pub trait StateMachine: Sized + Copy + PartialEq + std::fmt::Debug {
    /// Whether `self -> target` is one of the allowed edges.
    fn can_transition_to(&self, target: &Self) -> bool;

    /// Every state reachable from `self` in one step.
    fn valid_transitions(&self) -> Vec<Self>;

    /// Yields `target` when the edge exists, otherwise a `state_transition`
    /// validation error naming both ends.
    fn transition_to(&self, target: Self) -> Result<Self, ValidationError> {
        if !self.can_transition_to(&target) {
            return Err(ValidationError::invalid_format(
                "state_transition",
                format!("illegal edge {:?} -> {:?}", self, target),
            ));
        }
        Ok(target)
    }

    /// A state with no outgoing edges.
    fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }
}
