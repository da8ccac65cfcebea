// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Task model: phased definitions, handlers, status, and progress shapes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{ExecutorError, ExecutorResult};

/// One phase of a task: a name and a step count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPhase {
    /// Phase name, unique within the task.
    pub name: String,
    /// Steps in this phase.
    pub steps: usize,
}

/// A phased task definition. Execution drives every phase's steps in order;
/// the handler supplies the per-step work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task id, unique per executor.
    pub id: String,
    /// Ordered phases.
    pub phases: Vec<TaskPhase>,
}

impl TaskDefinition {
    /// Start a definition with no phases.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phases: Vec::new(),
        }
    }

    /// Append a phase.
    #[must_use]
    pub fn with_phase(mut self, name: impl Into<String>, steps: usize) -> Self {
        self.phases.push(TaskPhase {
            name: name.into(),
            steps,
        });
        self
    }

    /// Total steps across all phases.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps).sum()
    }

    /// Index of a phase by name.
    #[must_use]
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    /// Validate the definition: at least one phase, every phase non-empty,
    /// names unique.
    pub fn validate(&self) -> ExecutorResult<()> {
        if self.phases.is_empty() {
            return Err(ExecutorError::InvalidTask {
                reason: format!("task '{}' has no phases", self.id),
            });
        }
        for phase in &self.phases {
            if phase.steps == 0 {
                return Err(ExecutorError::InvalidTask {
                    reason: format!("phase '{}' has zero steps", phase.name),
                });
            }
        }
        let mut names: Vec<&str> = self.phases.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.phases.len() {
            return Err(ExecutorError::InvalidTask {
                reason: format!("task '{}' has duplicate phase names", self.id),
            });
        }
        Ok(())
    }
}

/// Task lifecycle.
///
/// ```text
/// IDLE -> RUNNING -> (SUSPENDED -> RUNNING)* -> { DONE, FAILED, CANCELLED }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Not started (or unknown to this executor).
    Idle,
    /// Actively stepping.
    Running,
    /// Momentarily paused at a step boundary to save a checkpoint.
    Suspended,
    /// All phases completed.
    Done,
    /// Terminal failure (retries exhausted or timeout).
    Failed,
    /// Cooperatively cancelled.
    Cancelled,
}

/// A step-level failure reported by a handler. Retried per the executor's
/// retry policy.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    /// What went wrong.
    pub message: String,
}

impl StepError {
    /// Build from any displayable reason.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result of one step: a JSON value appended to `partial_results`.
pub type StepResult = std::result::Result<serde_json::Value, StepError>;

/// The per-step work of a task. Steps must be idempotent enough to replay
/// from the last completed step after a resume or retry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one step of one phase. `step` is 0-based within the phase.
    async fn run_step(&self, phase: &str, step: usize) -> StepResult;
}

/// Periodic progress report, emitted on the progress interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Reporting task.
    pub task_id: String,
    /// Current phase.
    pub phase: String,
    /// Completed steps within the current phase.
    pub step: usize,
    /// Total steps across all phases.
    pub total_steps: usize,
    /// Completed fraction in [0, 1].
    pub progress: f64,
    /// `elapsed * (1 - p) / p`; absent while progress is 0.
    pub estimated_time_remaining_ms: Option<u64>,
    /// Report timestamp (ms).
    pub timestamp: i64,
}

/// Terminal outcome of an execution or resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// The task that ran.
    pub task_id: String,
    /// Terminal status: `Done`, `Failed`, or `Cancelled`.
    pub status: TaskStatus,
    /// Results of every completed step, in order (including any restored
    /// from the checkpoint a resume started from).
    pub partial_results: Vec<serde_json::Value>,
    /// Failure description for `Failed` results.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_steps() {
        let task = TaskDefinition::new("t")
            .with_phase("a", 3)
            .with_phase("b", 5);
        assert_eq!(task.total_steps(), 8);
        assert_eq!(task.phase_index("b"), Some(1));
        assert_eq!(task.phase_index("missing"), None);
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(TaskDefinition::new("t").validate().is_err());
        assert!(TaskDefinition::new("t")
            .with_phase("a", 0)
            .validate()
            .is_err());
        assert!(TaskDefinition::new("t")
            .with_phase("a", 1)
            .with_phase("a", 2)
            .validate()
            .is_err());
        assert!(TaskDefinition::new("t")
            .with_phase("a", 1)
            .validate()
            .is_ok());
    }
}
