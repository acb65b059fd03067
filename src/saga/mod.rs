//! # Saga Module
//!
//! Correlated state machines tracking operations and their steps across
//! asynchronous messages.

pub mod correlation;
pub mod engine;
pub mod state;
pub mod step;

pub use correlation::{correlate, Correlation};
pub use engine::SagaWorkflowEngine;
pub use state::{SagaKey, SagaPhase, SagaState};
pub use step::{StepCommand, StepCursor, StepWorkflow};
