// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Worker registry, weighted task routing, autoscaling, and health recovery.
//!
//! Each worker handle carries a type tag, a capability set, a load figure in
//! [0, 1], and a fixed-dimension specialization embedding. Routing scores
//! every healthy worker by a normalized weighted sum of capability overlap,
//! domain match, embedding similarity, health, and inverse load, ties broken
//! by id, and returns the top-K.
//!
//! Autoscaling adds a worker when mean utilization exceeds the scale-up
//! threshold and removes an idle one below the scale-down threshold, always
//! staying within `[min_workers, max_workers]`. Health sweeps tear down
//! unhealthy workers and, when auto-recovery is on, respawn them from their
//! original config.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use dashmem::{EventBus, MemoryEvent};
use dashmem_hnsw::cosine_similarity;

/// Default specialization embedding dimension.
pub const SPECIALIZATION_DIM: usize = 64;

/// Immutable worker spawn configuration, kept for respawns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Worker type tag, matched against a task's domain.
    pub worker_type: String,
    /// Capability set.
    pub capabilities: HashSet<String>,
    /// Concurrent task cap.
    pub max_concurrent: usize,
    /// Specialization embedding (default dimension 64).
    pub specialization: Vec<f32>,
}

impl WorkerConfig {
    /// Config with a zeroed specialization embedding of the default
    /// dimension.
    #[must_use]
    pub fn new(worker_type: impl Into<String>) -> Self {
        Self {
            worker_type: worker_type.into(),
            capabilities: HashSet::new(),
            max_concurrent: 4,
            specialization: vec![0.0; SPECIALIZATION_DIM],
        }
    }

    /// Add a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Set the specialization embedding.
    #[must_use]
    pub fn with_specialization(mut self, specialization: Vec<f32>) -> Self {
        self.specialization = specialization;
        self
    }
}

/// A live worker handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    /// Worker id.
    pub id: String,
    /// Spawn configuration (kept for auto-recovery).
    pub config: WorkerConfig,
    /// Current load in [0, 1].
    pub load: f64,
    /// Active task count.
    pub active_tasks: usize,
    /// Last health verdict.
    pub healthy: bool,
}

/// A routable task description.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// Capabilities the task requires.
    pub required_capabilities: HashSet<String>,
    /// Preferred worker type.
    pub domain: Option<String>,
    /// Task embedding for specialization matching.
    pub embedding: Option<Vec<f32>>,
    /// Caller-assigned priority in [0, 1].
    pub priority: f64,
}

/// Scoring weights. The sum need not be 1; scores normalize by the total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Capability overlap weight.
    pub capability: f64,
    /// Domain (worker type) match weight.
    pub domain: f64,
    /// Specialization embedding similarity weight.
    pub embedding: f64,
    /// Inverse-load weight.
    pub load: f64,
    /// Health weight.
    pub health: f64,
    /// Priority weight.
    pub priority: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            capability: 0.30,
            domain: 0.25,
            embedding: 0.25,
            load: 0.30,
            health: 0.15,
            priority: 0.10,
        }
    }
}

/// Pool bounds and cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Lower worker bound.
    pub min_workers: usize,
    /// Upper worker bound.
    pub max_workers: usize,
    /// Mean utilization above which the pool grows.
    pub scale_up_threshold: f64,
    /// Mean utilization below which an idle worker is removed.
    pub scale_down_threshold: f64,
    /// Health sweep cadence in ms.
    pub health_check_interval_ms: u64,
    /// Respawn unhealthy workers from their original config.
    pub auto_recovery: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 16,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            health_check_interval_ms: 30_000,
            auto_recovery: false,
        }
    }
}

/// The worker pool.
pub struct WorkerPool {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    config: PoolConfig,
    weights: ScoringWeights,
    events: EventBus,
}

impl WorkerPool {
    /// Create an empty pool.
    #[must_use]
    pub fn new(config: PoolConfig, weights: ScoringWeights, events: EventBus) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            config,
            weights,
            events,
        }
    }

    /// Register a worker. Returns its id, or `None` when the pool is at
    /// `max_workers`.
    pub fn register(&self, config: WorkerConfig) -> Option<String> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.len() >= self.config.max_workers {
            return None;
        }
        let id = format!("worker-{}", uuid::Uuid::new_v4());
        workers.insert(
            id.clone(),
            WorkerHandle {
                id: id.clone(),
                config,
                load: 0.0,
                active_tasks: 0,
                healthy: true,
            },
        );
        Some(id)
    }

    /// Remove a worker. Refused (returns `false`) when at `min_workers`.
    pub fn remove(&self, id: &str) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.len() <= self.config.min_workers {
            return false;
        }
        workers.remove(id).is_some()
    }

    /// Current worker count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when no workers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one worker.
    #[must_use]
    pub fn worker(&self, id: &str) -> Option<WorkerHandle> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Report a worker's load (clamped to [0, 1]).
    pub fn set_load(&self, id: &str, load: f64) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(id) {
            worker.load = load.clamp(0.0, 1.0);
        }
    }

    /// Report a worker's health.
    pub fn set_health(&self, id: &str, healthy: bool) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(id) {
            worker.healthy = healthy;
        }
    }

    /// Record a task assignment. Returns `false` when the worker is unknown
    /// or already at its concurrency cap.
    pub fn begin_task(&self, id: &str) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        match workers.get_mut(id) {
            Some(worker) if worker.active_tasks < worker.config.max_concurrent => {
                worker.active_tasks += 1;
                worker.load = worker.active_tasks as f64 / worker.config.max_concurrent as f64;
                true
            }
            _ => false,
        }
    }

    /// Record a task completion.
    pub fn finish_task(&self, id: &str) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get_mut(id) {
            worker.active_tasks = worker.active_tasks.saturating_sub(1);
            worker.load = worker.active_tasks as f64 / worker.config.max_concurrent.max(1) as f64;
        }
    }

    fn score(&self, worker: &WorkerHandle, spec: &TaskSpec) -> f64 {
        let w = &self.weights;
        let capability = if spec.required_capabilities.is_empty() {
            1.0
        } else {
            let overlap = spec
                .required_capabilities
                .intersection(&worker.config.capabilities)
                .count();
            overlap as f64 / spec.required_capabilities.len() as f64
        };
        let domain = match &spec.domain {
            Some(domain) => {
                if worker.config.worker_type == *domain {
                    1.0
                } else {
                    0.0
                }
            }
            None => 0.5,
        };
        let embedding = match &spec.embedding {
            Some(embedding) if embedding.len() == worker.config.specialization.len() => {
                // Map cosine similarity [-1, 1] into [0, 1].
                f64::from((cosine_similarity(embedding, &worker.config.specialization) + 1.0) / 2.0)
            }
            _ => 0.5,
        };
        let load = 1.0 - worker.load;
        let health = if worker.healthy { 1.0 } else { 0.0 };
        let total =
            w.capability + w.domain + w.embedding + w.load + w.health + w.priority;
        let sum = w.capability * capability
            + w.domain * domain
            + w.embedding * embedding
            + w.load * load
            + w.health * health
            + w.priority * spec.priority.clamp(0.0, 1.0);
        if total == 0.0 {
            0.0
        } else {
            sum / total
        }
    }

    /// Score all healthy workers with spare capacity against `spec` and
    /// return the top-K as `(worker_id, score)` pairs, descending by score,
    /// ties broken by id.
    #[must_use]
    pub fn route_task(&self, spec: &TaskSpec, top_k: usize) -> Vec<(String, f64)> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut scored: Vec<(String, f64)> = workers
            .values()
            .filter(|worker| worker.healthy && worker.active_tasks < worker.config.max_concurrent)
            .map(|worker| (worker.id.clone(), self.score(worker, spec)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(top_k);
        scored
    }

    /// Mean load across all workers; 0 when empty.
    #[must_use]
    pub fn mean_utilization(&self) -> f64 {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_empty() {
            return 0.0;
        }
        workers.values().map(|w| w.load).sum::<f64>() / workers.len() as f64
    }

    /// One autoscaling pass. Adds a worker (from `template`) above the
    /// scale-up threshold, removes the idlest worker below the scale-down
    /// threshold, within `[min_workers, max_workers]`.
    pub fn autoscale(&self, template: &WorkerConfig) {
        let utilization = self.mean_utilization();
        if utilization > self.config.scale_up_threshold && self.len() < self.config.max_workers {
            if self.register(template.clone()).is_some() {
                let workers = self.len();
                tracing::info!(utilization, workers, "pool scaled up");
                self.events.publish(MemoryEvent::PoolScaledUp { workers });
            }
            return;
        }
        if utilization < self.config.scale_down_threshold && self.len() > self.config.min_workers {
            let idlest = {
                let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers
                    .values()
                    .filter(|w| w.active_tasks == 0)
                    .min_by(|a, b| {
                        a.load
                            .partial_cmp(&b.load)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then_with(|| a.id.cmp(&b.id))
                    })
                    .map(|w| w.id.clone())
            };
            if let Some(id) = idlest {
                if self.remove(&id) {
                    let workers = self.len();
                    tracing::info!(utilization, workers, removed = %id, "pool scaled down");
                    self.events.publish(MemoryEvent::PoolScaledDown { workers });
                }
            }
        }
    }

    /// One health sweep. Unhealthy workers are torn down; with
    /// `auto_recovery` on, each is respawned from its original config.
    /// Returns ids of recovered workers.
    pub fn health_sweep(&self) -> Vec<String> {
        let unhealthy: Vec<WorkerHandle> = {
            let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.values().filter(|w| !w.healthy).cloned().collect()
        };
        let mut recovered = Vec::new();
        for worker in unhealthy {
            {
                let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers.remove(&worker.id);
            }
            tracing::warn!(worker_id = %worker.id, "tearing down unhealthy worker");
            if self.config.auto_recovery {
                if let Some(new_id) = self.register(worker.config.clone()) {
                    self.events.publish(MemoryEvent::WorkerRecovered {
                        worker_id: new_id.clone(),
                    });
                    recovered.push(new_id);
                }
            }
        }
        recovered
    }

    /// Spawn a background loop running [`WorkerPool::health_sweep`] on the
    /// configured interval.
    pub fn spawn_health_loop(pool: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval =
            std::time::Duration::from_millis(pool.config.health_check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                pool.health_sweep();
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pool(config: PoolConfig) -> WorkerPool {
        WorkerPool::new(config, ScoringWeights::default(), EventBus::new())
    }

    #[test]
    fn test_register_respects_max() {
        let p = pool(PoolConfig {
            max_workers: 2,
            ..Default::default()
        });
        assert!(p.register(WorkerConfig::new("coder")).is_some());
        assert!(p.register(WorkerConfig::new("coder")).is_some());
        assert!(p.register(WorkerConfig::new("coder")).is_none());
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_remove_respects_min() {
        let p = pool(PoolConfig {
            min_workers: 1,
            ..Default::default()
        });
        let a = p.register(WorkerConfig::new("coder")).unwrap();
        let b = p.register(WorkerConfig::new("coder")).unwrap();
        assert!(p.remove(&a));
        assert!(!p.remove(&b), "cannot drop below min_workers");
    }

    #[test]
    fn test_route_prefers_capability_match() {
        let p = pool(PoolConfig::default());
        let matching = p
            .register(WorkerConfig::new("coder").with_capability("rust"))
            .unwrap();
        let _other = p
            .register(WorkerConfig::new("coder").with_capability("python"))
            .unwrap();

        let spec = TaskSpec {
            required_capabilities: HashSet::from(["rust".to_string()]),
            ..Default::default()
        };
        let routed = p.route_task(&spec, 2);
        assert_eq!(routed[0].0, matching);
        assert!(routed[0].1 > routed[1].1);
    }

    #[test]
    fn test_route_prefers_lower_load() {
        let p = pool(PoolConfig::default());
        let busy = p.register(WorkerConfig::new("coder")).unwrap();
        let idle = p.register(WorkerConfig::new("coder")).unwrap();
        p.set_load(&busy, 0.9);
        p.set_load(&idle, 0.1);

        let routed = p.route_task(&TaskSpec::default(), 2);
        assert_eq!(routed[0].0, idle);
    }

    #[test]
    fn test_route_prefers_domain_and_embedding() {
        let p = pool(PoolConfig::default());
        let mut spec_vec = vec![0.0; SPECIALIZATION_DIM];
        spec_vec[0] = 1.0;
        let specialist = p
            .register(
                WorkerConfig::new("researcher").with_specialization(spec_vec.clone()),
            )
            .unwrap();
        let mut off_vec = vec![0.0; SPECIALIZATION_DIM];
        off_vec[1] = 1.0;
        let _generalist = p
            .register(WorkerConfig::new("coder").with_specialization(off_vec))
            .unwrap();

        let spec = TaskSpec {
            domain: Some("researcher".to_string()),
            embedding: Some(spec_vec),
            ..Default::default()
        };
        let routed = p.route_task(&spec, 1);
        assert_eq!(routed[0].0, specialist);
    }

    #[test]
    fn test_route_skips_unhealthy() {
        let p = pool(PoolConfig::default());
        let sick = p.register(WorkerConfig::new("coder")).unwrap();
        let well = p.register(WorkerConfig::new("coder")).unwrap();
        p.set_health(&sick, false);

        let routed = p.route_task(&TaskSpec::default(), 5);
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].0, well);
    }

    #[test]
    fn test_route_top_k_truncates_with_stable_ties() {
        let p = pool(PoolConfig::default());
        for _ in 0..5 {
            p.register(WorkerConfig::new("coder")).unwrap();
        }
        let routed = p.route_task(&TaskSpec::default(), 3);
        assert_eq!(routed.len(), 3);
        // Identical workers tie on score; order must be by id.
        let ids: Vec<String> = routed.iter().map(|(id, _)| id.clone()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_begin_finish_task_tracks_capacity() {
        let p = pool(PoolConfig::default());
        let mut config = WorkerConfig::new("coder");
        config.max_concurrent = 2;
        let id = p.register(config).unwrap();

        assert!(p.begin_task(&id));
        assert!(p.begin_task(&id));
        assert!(!p.begin_task(&id), "at max_concurrent");
        // A saturated worker is not routable.
        assert!(p.route_task(&TaskSpec::default(), 1).is_empty());

        p.finish_task(&id);
        assert!(p.begin_task(&id));
        assert!(!p.begin_task(&id));
        assert!((p.worker(&id).unwrap().load - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_autoscale_up_and_down() {
        let p = pool(PoolConfig {
            min_workers: 1,
            max_workers: 3,
            scale_up_threshold: 0.7,
            scale_down_threshold: 0.3,
            ..Default::default()
        });
        let template = WorkerConfig::new("coder");
        let first = p.register(template.clone()).unwrap();

        // Hot pool grows.
        p.set_load(&first, 0.95);
        p.autoscale(&template);
        assert_eq!(p.len(), 2);

        // Idle pool shrinks back toward min.
        for handle in [first] {
            p.set_load(&handle, 0.0);
        }
        p.autoscale(&template);
        assert_eq!(p.len(), 1);
        // Never below min.
        p.autoscale(&template);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn test_health_sweep_respawns_with_auto_recovery() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let p = WorkerPool::new(
            PoolConfig {
                auto_recovery: true,
                min_workers: 0,
                ..Default::default()
            },
            ScoringWeights::default(),
            bus,
        );
        let config = WorkerConfig::new("coder").with_capability("rust");
        let sick = p.register(config.clone()).unwrap();
        p.set_health(&sick, false);

        let recovered = p.health_sweep();
        assert_eq!(recovered.len(), 1);
        assert_ne!(recovered[0], sick);
        assert_eq!(p.len(), 1);
        // The respawned worker keeps the original config.
        assert_eq!(p.worker(&recovered[0]).unwrap().config, config);
        assert!(matches!(
            rx.try_recv().unwrap(),
            MemoryEvent::WorkerRecovered { .. }
        ));
    }

    #[test]
    fn test_health_sweep_without_recovery_just_removes() {
        let p = pool(PoolConfig {
            auto_recovery: false,
            min_workers: 0,
            ..Default::default()
        });
        let sick = p.register(WorkerConfig::new("coder")).unwrap();
        p.set_health(&sick, false);
        let recovered = p.health_sweep();
        assert!(recovered.is_empty());
        assert!(p.is_empty());
    }
}
