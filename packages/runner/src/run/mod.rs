// packages/runner/src/run/mod.rs
//! Run state and its cache
//!
//! - **State**: the record a provider fills in and the worker consumes
//! - **Cache**: persistence of that record across runner restarts

pub mod cache;
pub mod state;

pub use cache::{CacheStore, FileCache, MemoryCache, NoCache};
pub use state::{Credentials, RunState, WorkerLocation, ENVIRONMENT_CLASS_KEY};
