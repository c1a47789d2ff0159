//! Pipeline engine (§4.6): DAG validation at submission time, bounded
//! concurrent execution of ready nodes, per-node retry/backoff/circuit
//! breaking, run-level and per-attempt timeouts, cooperative cancellation,
//! and crash recovery of runs left `running` by a dead instance.
//!
//! - [`engine`] — [`PipelineEngine`], the public handle: `submit`, `cancel`,
//!   `status`, `await_run`, `recover`.
//! - [`evaluators`] — per-`NodeKind` single-attempt evaluation.
//! - [`recovery`] — stale-run discovery/classification, used by both
//!   `PipelineEngine::recover` and directly in tests.
//! - [`error`] — [`EngineError`], the engine's failure taxonomy.

pub mod error;
pub mod evaluators;
pub mod recovery;

mod engine;

pub use engine::{EngineConfig, PipelineEngine};
pub use error::{EngineError, EngineResult};
pub use recovery::RecoveryAction;
