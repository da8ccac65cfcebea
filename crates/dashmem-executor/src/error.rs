// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for the executor, checkpoint store, and provider router.

use thiserror::Error;

/// Errors from the executor and checkpoint store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// `resume` named a checkpoint that does not exist.
    #[error("Checkpoint not found: {id}")]
    CheckpointNotFound {
        /// The missing checkpoint id.
        id: String,
    },

    /// A checkpoint referenced a phase the task definition lacks.
    #[error("Task '{task_id}' has no phase named '{phase}'")]
    UnknownPhase {
        /// The task being resumed.
        task_id: String,
        /// The phase recorded in the checkpoint.
        phase: String,
    },

    /// A task definition failed validation.
    #[error("Invalid task: {reason}")]
    InvalidTask {
        /// What was wrong.
        reason: String,
    },

    /// Checkpoint file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint payload could not be encoded or decoded.
    #[error("Serialization failed: {reason}")]
    Serialization {
        /// Codec-reported reason.
        reason: String,
    },

    /// A checkpoint file failed its magic/version/CRC verification.
    #[error("Checkpoint integrity check failed for '{checkpoint_id}': {reason}")]
    IntegrityCheckFailed {
        /// The offending checkpoint (or file path).
        checkpoint_id: String,
        /// Which header field mismatched.
        reason: String,
    },
}

/// Result alias for executor operations.
pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;

/// Errors from provider adapters and their router.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The provider's circuit breaker is open; wait or reroute.
    #[error("Circuit open for provider '{provider}', retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// The short-circuited provider.
        provider: String,
        /// Time remaining until a half-open probe is allowed.
        retry_after_ms: u64,
    },

    /// The provider rejected the call for rate.
    #[error("Rate limited by provider '{provider}'")]
    RateLimited {
        /// The limiting provider.
        provider: String,
    },

    /// The rolling hourly spend crossed the configured budget.
    #[error("Budget exceeded: spent ${spent_usd:.4} of ${budget_usd:.4} this hour")]
    BudgetExceeded {
        /// Rolling-hour spend.
        spent_usd: f64,
        /// Configured hourly budget.
        budget_usd: f64,
    },

    /// The provider call timed out.
    #[error("Provider '{provider}' timed out")]
    Timeout {
        /// The timed-out provider.
        provider: String,
    },

    /// The provider returned an error.
    #[error("Provider '{provider}' failed: {reason}")]
    Upstream {
        /// The failing provider.
        provider: String,
        /// Provider-reported reason.
        reason: String,
    },

    /// Every candidate provider was skipped or failed.
    #[error("No provider available for this request")]
    NoProviderAvailable,
}

/// Result alias for provider operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;
