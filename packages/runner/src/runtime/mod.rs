// packages/runner/src/runtime/mod.rs
//! Worker execution runtime
//!
//! - **Process Manager**: spawning the worker command and delivering signals
//! - **Worker**: launcher/handle seam between the orchestrator and a process
//! - **Orchestrator**: the bootstrap pipeline from cache check to worker exit
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   hooks    ┌──────────────┐
//! │ Orchestrator │ ─────────► │   Provider   │
//! └──────┬───────┘            └──────┬───────┘
//!        │ launch                    │ set_protocol / send
//!        ▼                           ▼
//! ┌──────────────┐  stdin/stdout ┌──────────┐
//! │ Worker (sh)  │ ◄───────────► │ Protocol │
//! └──────────────┘               └──────────┘
//! ```

pub mod orchestrator;
pub mod process_manager;
pub mod worker;

// Re-export commonly used types
pub use orchestrator::{CacheDecision, Orchestrator, RunOutcome};
pub use process_manager::{ProcessManager, SpawnConfig};
pub use worker::{ChildWorker, CommandLauncher, RunningWorker, WorkerExit, WorkerLauncher};
