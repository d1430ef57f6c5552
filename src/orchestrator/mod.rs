//! The workflow engine and its event surface.

mod engine;
mod events;

pub use engine::{AbortHandle, Orchestrator};
pub use events::WorkflowEvent;
