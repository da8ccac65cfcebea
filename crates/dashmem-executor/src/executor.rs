// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The long-running executor: phased stepping with checkpoint replay.
//!
//! Execution is a cooperative state machine. The step loop owns all mutation
//! of run state; timers only latch flags or read snapshots, so a checkpoint
//! is always taken at a step boundary, never mid-step.
//!
//! - A checkpoint timer latches `checkpoint_due` every
//!   `checkpoint_interval_ms`; the loop saves when it crosses a step
//!   boundary with the flag set. Saves also fire on failure, cancellation,
//!   and timeout.
//! - A progress timer broadcasts [`ProgressUpdate`]s every
//!   `progress_interval_ms`; listeners are fan-out subscribers and can
//!   never block the loop.
//! - Cancellation is a watch flag checked between steps; the in-flight step
//!   runs to completion, a final checkpoint is written, and the result is
//!   reported as cancelled. Cancelling an unknown/idle task is a no-op.
//! - Step failures retry with exponential backoff
//!   `base_ms * multiplier^(attempt-1)` up to `max_retries`, then the task
//!   fails terminally.
//! - When `task_timeout_ms > 0` the step loop races a timer; on timeout the
//!   task transitions to `Failed` with a final checkpoint saved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, watch};

use dashmem::{EventBus, MemoryEvent};

use crate::checkpoint::{CheckpointState, CheckpointStore, TaskCheckpoint};
use crate::error::{ExecutorError, ExecutorResult};
use crate::task::{ProgressUpdate, TaskDefinition, TaskHandler, TaskResult, TaskStatus};

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identity recorded in checkpoints.
    pub worker_id: String,
    /// Checkpoint cadence in ms.
    pub checkpoint_interval_ms: u64,
    /// Progress report cadence in ms.
    pub progress_interval_ms: u64,
    /// Checkpoints retained per (task, worker).
    pub max_checkpoints: usize,
    /// Retry failed steps before giving up.
    pub auto_retry: bool,
    /// Attempts per step when `auto_retry` is on.
    pub max_retries: u32,
    /// Backoff base in ms.
    pub retry_base_ms: u64,
    /// Backoff multiplier per attempt.
    pub retry_multiplier: f64,
    /// Whole-task timeout in ms; 0 disables it.
    pub task_timeout_ms: u64,
    /// Remove all checkpoints when a task completes successfully.
    pub auto_cleanup: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-0".to_string(),
            checkpoint_interval_ms: 60_000,
            progress_interval_ms: 5_000,
            max_checkpoints: 10,
            auto_retry: true,
            max_retries: 3,
            retry_base_ms: 100,
            retry_multiplier: 2.0,
            task_timeout_ms: 0,
            auto_cleanup: false,
        }
    }
}

/// Mutable run state shared between the step loop and the progress timer.
struct RunState {
    phase: String,
    phase_index: usize,
    step: usize,
    completed_steps: usize,
    partial_results: Vec<serde_json::Value>,
    context: HashMap<String, dashmem::ScalarValue>,
    artifacts: Vec<String>,
    sequence: u64,
}

enum DriveOutcome {
    Done,
    Cancelled,
    Failed(String),
}

/// Drives tasks through phased execution with periodic checkpoints.
pub struct LongRunningExecutor {
    store: Arc<dyn CheckpointStore>,
    config: ExecutorConfig,
    events: EventBus,
    progress_tx: broadcast::Sender<ProgressUpdate>,
    cancels: Mutex<HashMap<String, watch::Sender<bool>>>,
    statuses: Mutex<HashMap<String, TaskStatus>>,
}

impl LongRunningExecutor {
    /// Create an executor over a checkpoint store.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, config: ExecutorConfig, events: EventBus) -> Self {
        let (progress_tx, _) = broadcast::channel(64);
        Self {
            store,
            config,
            events,
            progress_tx,
            cancels: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to progress updates for all tasks on this executor.
    #[must_use]
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress_tx.subscribe()
    }

    /// The last known status of a task; `Idle` when unknown.
    #[must_use]
    pub fn status(&self, task_id: &str) -> TaskStatus {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .copied()
            .unwrap_or(TaskStatus::Idle)
    }

    /// Request cooperative cancellation. The current step runs to
    /// completion; cancelling an idle or unknown task is a no-op.
    pub fn cancel(&self, task_id: &str) {
        let cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = cancels.get(task_id) {
            let _ = tx.send(true);
        }
    }

    fn set_status(&self, task_id: &str, status: TaskStatus) {
        self.statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string(), status);
    }

    /// Execute a task from the beginning.
    pub async fn execute(
        &self,
        task: TaskDefinition,
        handler: Arc<dyn TaskHandler>,
    ) -> ExecutorResult<TaskResult> {
        task.validate()?;
        // Sequences stay dense per task even across repeated executions.
        let base_sequence = self
            .store
            .load_latest(&task.id, &self.config.worker_id)
            .await?
            .map_or(0, |cp| cp.sequence);
        let state = RunState {
            phase: task.phases[0].name.clone(),
            phase_index: 0,
            step: 0,
            completed_steps: 0,
            partial_results: Vec::new(),
            context: HashMap::new(),
            artifacts: Vec::new(),
            sequence: base_sequence,
        };
        self.run(task, handler, state).await
    }

    /// Resume a task from a specific checkpoint.
    ///
    /// # Errors
    ///
    /// `CheckpointNotFound` when the id is absent; `UnknownPhase` when the
    /// checkpoint references a phase the definition lacks.
    pub async fn resume(
        &self,
        checkpoint_id: &str,
        task: TaskDefinition,
        handler: Arc<dyn TaskHandler>,
    ) -> ExecutorResult<TaskResult> {
        task.validate()?;
        let Some(checkpoint) = self.store.load(checkpoint_id).await? else {
            return Err(ExecutorError::CheckpointNotFound {
                id: checkpoint_id.to_string(),
            });
        };
        let Some(phase_index) = task.phase_index(&checkpoint.state.phase) else {
            return Err(ExecutorError::UnknownPhase {
                task_id: task.id.clone(),
                phase: checkpoint.state.phase.clone(),
            });
        };
        self.events.publish(MemoryEvent::CheckpointResumed {
            task_id: task.id.clone(),
            checkpoint_id: checkpoint.id.clone(),
        });
        tracing::info!(
            task_id = %task.id,
            checkpoint_id = %checkpoint.id,
            phase = %checkpoint.state.phase,
            step = checkpoint.state.step,
            "resuming from checkpoint"
        );
        let completed_before: usize = task.phases[..phase_index]
            .iter()
            .map(|p| p.steps)
            .sum::<usize>()
            + checkpoint.state.step;
        let state = RunState {
            phase: checkpoint.state.phase.clone(),
            phase_index,
            step: checkpoint.state.step,
            completed_steps: completed_before,
            partial_results: checkpoint.state.partial_results.clone(),
            context: checkpoint.state.context.clone(),
            artifacts: checkpoint.state.artifacts.clone(),
            sequence: checkpoint.sequence,
        };
        self.run(task, handler, state).await
    }

    async fn save_checkpoint(
        &self,
        task: &TaskDefinition,
        run: &Arc<Mutex<RunState>>,
    ) -> ExecutorResult<()> {
        let (state, sequence, progress) = {
            let mut guard = run.lock().unwrap_or_else(|e| e.into_inner());
            guard.sequence += 1;
            let total = task.total_steps();
            let progress = if total == 0 {
                0.0
            } else {
                guard.completed_steps as f64 / total as f64
            };
            (
                CheckpointState {
                    phase: guard.phase.clone(),
                    step: guard.step,
                    total_steps: total,
                    partial_results: guard.partial_results.clone(),
                    context: guard.context.clone(),
                    artifacts: guard.artifacts.clone(),
                },
                guard.sequence,
                progress,
            )
        };
        let checkpoint = TaskCheckpoint::new(
            task.id.clone(),
            self.config.worker_id.clone(),
            sequence,
            state,
            progress,
        );
        self.store.save(checkpoint).await?;
        let pruned = self
            .store
            .prune(&task.id, &self.config.worker_id, self.config.max_checkpoints)
            .await?;
        if pruned > 0 {
            self.events.publish(MemoryEvent::CheckpointPruned {
                task_id: task.id.clone(),
                removed: pruned,
            });
        }
        self.events.publish(MemoryEvent::CheckpointSaved {
            task_id: task.id.clone(),
            sequence,
        });
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn run(
        &self,
        task: TaskDefinition,
        handler: Arc<dyn TaskHandler>,
        state: RunState,
    ) -> ExecutorResult<TaskResult> {
        let task_id = task.id.clone();
        let total_steps = task.total_steps();
        let start_phase = state.phase_index;
        let start_step = state.step;
        let run = Arc::new(Mutex::new(state));
        let started = Instant::now();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
            cancels.insert(task_id.clone(), cancel_tx);
        }
        self.set_status(&task_id, TaskStatus::Running);
        self.events.publish(MemoryEvent::TaskStarted {
            task_id: task_id.clone(),
        });

        // Checkpoint cadence: the timer only latches a flag; the step loop
        // saves at the next boundary.
        let checkpoint_due = Arc::new(AtomicBool::new(false));
        let checkpoint_timer = {
            let flag = Arc::clone(&checkpoint_due);
            let interval = Duration::from_millis(self.config.checkpoint_interval_ms.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // immediate first tick
                loop {
                    ticker.tick().await;
                    flag.store(true, Ordering::SeqCst);
                }
            })
        };

        // Progress cadence: read-only over the shared run state.
        let progress_timer = {
            let run = Arc::clone(&run);
            let tx = self.progress_tx.clone();
            let task_id = task_id.clone();
            let interval = Duration::from_millis(self.config.progress_interval_ms.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let (phase, step, completed) = {
                        let guard = run.lock().unwrap_or_else(|e| e.into_inner());
                        (guard.phase.clone(), guard.step, guard.completed_steps)
                    };
                    let progress = if total_steps == 0 {
                        0.0
                    } else {
                        completed as f64 / total_steps as f64
                    };
                    let estimated_time_remaining_ms = if progress > 0.0 {
                        let elapsed = started.elapsed().as_millis() as f64;
                        Some((elapsed * (1.0 - progress) / progress) as u64)
                    } else {
                        None
                    };
                    let _ = tx.send(ProgressUpdate {
                        task_id: task_id.clone(),
                        phase,
                        step,
                        total_steps,
                        progress,
                        estimated_time_remaining_ms,
                        timestamp: dashmem::types::now_ms(),
                    });
                }
            })
        };

        let drive = {
            let run = Arc::clone(&run);
            let checkpoint_due = Arc::clone(&checkpoint_due);
            let cancel_rx = cancel_rx.clone();
            let task = task.clone();
            let handler = Arc::clone(&handler);
            async move {
                for phase_index in start_phase..task.phases.len() {
                    let phase = &task.phases[phase_index];
                    let first_step = if phase_index == start_phase {
                        start_step
                    } else {
                        0
                    };
                    {
                        let mut guard = run.lock().unwrap_or_else(|e| e.into_inner());
                        guard.phase = phase.name.clone();
                        guard.phase_index = phase_index;
                        guard.step = first_step;
                    }
                    for step in first_step..phase.steps {
                        let cancelled = *cancel_rx.borrow();
                        if cancelled {
                            return DriveOutcome::Cancelled;
                        }
                        let mut attempt: u32 = 1;
                        let value = loop {
                            match handler.run_step(&phase.name, step).await {
                                Ok(value) => break value,
                                Err(err) => {
                                    if !self.config.auto_retry
                                        || attempt >= self.config.max_retries
                                    {
                                        return DriveOutcome::Failed(format!(
                                            "step {step} of phase '{}' failed after {attempt} attempt(s): {err}",
                                            phase.name
                                        ));
                                    }
                                    let backoff_ms = (self.config.retry_base_ms as f64
                                        * self.config.retry_multiplier.powi(attempt as i32 - 1))
                                        as u64;
                                    self.events.publish(MemoryEvent::TaskRetry {
                                        task_id: task.id.clone(),
                                        attempt,
                                    });
                                    tracing::warn!(
                                        task_id = %task.id,
                                        phase = %phase.name,
                                        step,
                                        attempt,
                                        backoff_ms,
                                        error = %err,
                                        "step failed, retrying"
                                    );
                                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                                    attempt += 1;
                                }
                            }
                        };
                        {
                            let mut guard = run.lock().unwrap_or_else(|e| e.into_inner());
                            guard.partial_results.push(value);
                            guard.step = step + 1;
                            guard.completed_steps += 1;
                        }
                        if checkpoint_due.swap(false, Ordering::SeqCst) {
                            self.set_status(&task.id, TaskStatus::Suspended);
                            if let Err(err) = self.save_checkpoint(&task, &run).await {
                                tracing::warn!(
                                    task_id = %task.id,
                                    error = %err,
                                    "periodic checkpoint save failed"
                                );
                            }
                            self.set_status(&task.id, TaskStatus::Running);
                        }
                    }
                }
                DriveOutcome::Done
            }
        };

        let outcome = if self.config.task_timeout_ms > 0 {
            tokio::select! {
                outcome = drive => outcome,
                () = tokio::time::sleep(Duration::from_millis(self.config.task_timeout_ms)) => {
                    DriveOutcome::Failed(format!(
                        "task timed out after {}ms",
                        self.config.task_timeout_ms
                    ))
                }
            }
        } else {
            drive.await
        };

        checkpoint_timer.abort();
        progress_timer.abort();
        {
            let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
            cancels.remove(&task_id);
        }

        let (status, error) = match outcome {
            DriveOutcome::Done => {
                if self.config.auto_cleanup {
                    self.store
                        .delete_all(&task_id, &self.config.worker_id)
                        .await?;
                }
                self.events.publish(MemoryEvent::TaskCompleted {
                    task_id: task_id.clone(),
                });
                (TaskStatus::Done, None)
            }
            DriveOutcome::Cancelled => {
                // Final checkpoint captures everything up to the completed
                // step.
                self.save_checkpoint(&task, &run).await?;
                self.events.publish(MemoryEvent::TaskCancelled {
                    task_id: task_id.clone(),
                });
                (TaskStatus::Cancelled, None)
            }
            DriveOutcome::Failed(reason) => {
                self.save_checkpoint(&task, &run).await?;
                self.events.publish(MemoryEvent::TaskFailed {
                    task_id: task_id.clone(),
                    reason: reason.clone(),
                });
                (TaskStatus::Failed, Some(reason))
            }
        };
        self.set_status(&task_id, status);

        let partial_results = {
            let guard = run.lock().unwrap_or_else(|e| e.into_inner());
            guard.partial_results.clone()
        };
        Ok(TaskResult {
            task_id,
            status,
            partial_results,
            error,
        })
    }
}
