//! Assignment handling: wire event, processing, and outcome.

mod event;
mod outcome;
mod processor;

pub use event::{AssignmentEvent, EventError};
pub use outcome::ProcessOutcome;
pub use processor::AssignmentProcessor;
