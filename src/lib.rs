pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod errors;
pub mod init;
pub mod logging;
pub mod phase;
pub mod workflow_config;

pub use engine::state::{RunState, RunStatus};
pub use engine::{PhaseOutcome, WorkflowEngine};
pub use errors::{EngineError, InvokeError};
