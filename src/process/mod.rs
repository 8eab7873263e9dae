//! Running stories as isolated worker processes.
//!
//! - [`manager`]: registry of live children and signal delivery
//! - [`orchestrator`]: phase-by-phase scheduling under a concurrency limit
//! - [`ipc`]: the line-delimited JSON messages workers send back
//! - [`result`]: per-story results and execution summaries

pub mod ipc;
pub mod manager;
pub mod orchestrator;
pub mod result;

pub use ipc::{DecodedLine, IpcMessage, IpcMessageType, decode_line};
pub use manager::{ChildGuard, ProcessManager, Signal};
pub use orchestrator::{OrchestratorEvent, OrchestratorOptions, ProcessOrchestrator};
pub use result::{
    ChildProcessResult, ExecutionSummary, ExecutionTimer, OrchestratorState, PhaseSummary,
};
