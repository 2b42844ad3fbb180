//! Risk escalation state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions:
//! [`transition`] maps an [`Event`] to a list of [`Effect`]s and the runtime
//! executor performs them, feeding resulting events back in.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, NotifyTarget};
pub use event::Event;
pub use state::{project_care_state, CareState, InvalidRiskLevel, RiskLevel};
pub use transition::{transition, EscalationContext, TransitionError, TransitionResult};
