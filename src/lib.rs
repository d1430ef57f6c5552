pub mod config;
pub mod errors;
pub mod gateway;
pub mod limiter;
pub mod machine;
pub mod orchestrator;
pub mod prompts;
pub mod retry;
pub mod signals;
pub mod state;
pub mod store;
pub mod transcript;
pub mod ui;

pub use errors::{GatewayError, WorkflowError};
pub use machine::WorkflowPhase;
pub use orchestrator::{AbortHandle, Orchestrator, WorkflowEvent};
