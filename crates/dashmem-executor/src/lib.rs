// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # DashMem Executor
//!
//! Long-running task execution for the DashMem memory core: phased stepping
//! with periodic checkpoints, resume-from-checkpoint replay, cooperative
//! cancellation, retry with exponential backoff, worker pools with weighted
//! routing, and provider adapters guarded by circuit breakers.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dashmem::EventBus;
//! use dashmem_executor::{
//!     CheckpointStore, ExecutorConfig, LongRunningExecutor, MemoryCheckpointStore, StepResult,
//!     TaskDefinition, TaskHandler, TaskStatus,
//! };
//!
//! struct Doubler;
//!
//! #[async_trait::async_trait]
//! impl TaskHandler for Doubler {
//!     async fn run_step(&self, _phase: &str, step: usize) -> StepResult {
//!         Ok(serde_json::json!(step * 2))
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> dashmem_executor::ExecutorResult<()> {
//! let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
//! let executor = LongRunningExecutor::new(store, ExecutorConfig::default(), EventBus::new());
//! let task = TaskDefinition::new("double").with_phase("compute", 4);
//! let result = executor.execute(task, Arc::new(Doubler)).await?;
//! assert_eq!(result.status, TaskStatus::Done);
//! assert_eq!(result.partial_results.len(), 4);
//! # Ok(())
//! # }
//! ```

/// Provider router and circuit breakers.
pub mod breaker;
/// Checkpoints and their stores.
pub mod checkpoint;
/// Error taxonomy.
pub mod error;
/// The long-running executor.
pub mod executor;
/// Worker registry, routing, autoscaling.
pub mod pool;
/// Task model: definitions, handlers, status, progress.
pub mod task;

pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Completion, CompletionProvider,
    ProviderRouter, ProviderRouterConfig, RouteRule,
};
pub use checkpoint::{
    CheckpointState, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, TaskCheckpoint,
};
pub use error::{ExecutorError, ExecutorResult, ProviderError, ProviderResult};
pub use executor::{ExecutorConfig, LongRunningExecutor};
pub use pool::{
    PoolConfig, ScoringWeights, TaskSpec, WorkerConfig, WorkerHandle, WorkerPool,
    SPECIALIZATION_DIM,
};
pub use task::{
    ProgressUpdate, StepError, StepResult, TaskDefinition, TaskHandler, TaskPhase, TaskResult,
    TaskStatus,
};
