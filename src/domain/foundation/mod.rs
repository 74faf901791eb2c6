//! Identifiers, instants and errors shared by every other layer.

mod errors;
mod ids;
mod state_machine;
mod timestamp;

pub use errors::{DomainError, ErrorCode, ValidationError};
pub use ids::{ChatId, MessageId};
pub use state_machine::StateMachine;
pub use timestamp::Timestamp;
