// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Migration pipeline: stream a source backend into a target backend.
//!
//! Reads namespace by namespace in pages, tops up missing embeddings through
//! the configured [`EmbeddingGenerator`], bulk-inserts in batches, and emits
//! `migration:*` progress events. Per-entry failures are counted and logged,
//! not fatal - a migration keeps draining the source. When `embed_missing`
//! is on, an entry that still has no vector after the top-up attempt is
//! skipped (counted, never stored).

use std::sync::Arc;

use crate::backend::MemoryBackend;
use crate::embeddings::EmbeddingGenerator;
use crate::error::Result;
use crate::events::{EventBus, MemoryEvent};
use crate::types::MemoryQuery;

/// Migration tuning.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Entries per read page / insert batch.
    pub batch_size: usize,
    /// Generate embeddings for entries that lack them.
    pub embed_missing: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            embed_missing: true,
        }
    }
}

/// Outcome summary for a migration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Entries written to the target.
    pub migrated: usize,
    /// Entries never attempted: `embed_missing` was on but no embedding
    /// could be generated (no embedder configured, or generation failed).
    pub skipped: usize,
    /// Entries that failed to insert.
    pub failed: usize,
}

/// Streams entries from a source backend into a target backend.
pub struct Migrator {
    source: Arc<dyn MemoryBackend>,
    target: Arc<dyn MemoryBackend>,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
    events: EventBus,
    config: MigrationConfig,
}

impl Migrator {
    /// Create a migrator between two backends.
    #[must_use]
    pub fn new(
        source: Arc<dyn MemoryBackend>,
        target: Arc<dyn MemoryBackend>,
        events: EventBus,
        config: MigrationConfig,
    ) -> Self {
        Self {
            source,
            target,
            embedder: None,
            events,
            config,
        }
    }

    /// Attach an embedding generator for entries missing vectors.
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingGenerator>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Run the migration to completion.
    pub async fn run(&self) -> Result<MigrationReport> {
        let total = self.source.count(None).await?;
        self.events.publish(MemoryEvent::MigrationStarted { total });

        let mut report = MigrationReport::default();
        let namespaces = self.source.list_namespaces().await?;
        for namespace in namespaces {
            if let Err(err) = self.migrate_namespace(&namespace, total, &mut report).await {
                self.events.publish(MemoryEvent::MigrationFailed {
                    reason: err.to_string(),
                });
                return Err(err);
            }
        }

        self.events.publish(MemoryEvent::MigrationCompleted {
            migrated: report.migrated,
        });
        Ok(report)
    }

    async fn migrate_namespace(
        &self,
        namespace: &str,
        total: usize,
        report: &mut MigrationReport,
    ) -> Result<()> {
        let mut offset = 0;
        loop {
            let page = self
                .source
                .query(&MemoryQuery {
                    namespace: Some(namespace.to_string()),
                    include_expired: true,
                    limit: self.config.batch_size,
                    offset,
                    ..Default::default()
                })
                .await?;
            if page.is_empty() {
                return Ok(());
            }
            offset += page.len();

            let mut batch = Vec::with_capacity(page.len());
            for mut entry in page {
                if entry.embedding.is_none() && self.config.embed_missing {
                    match &self.embedder {
                        Some(embedder) => match embedder.embed(&entry.content).await {
                            Ok(embedding) => entry.embedding = Some(embedding),
                            Err(err) => {
                                report.skipped += 1;
                                tracing::warn!(
                                    id = %entry.id,
                                    error = %err,
                                    "embedding failed during migration; skipping entry"
                                );
                                continue;
                            }
                        },
                        None => {
                            report.skipped += 1;
                            tracing::warn!(
                                id = %entry.id,
                                "no embedder configured for vector-less entry; skipping"
                            );
                            continue;
                        }
                    }
                }
                batch.push(entry);
            }

            for entry in batch {
                let id = entry.id.clone();
                match self.target.store(entry).await {
                    Ok(()) => report.migrated += 1,
                    Err(err) => {
                        report.failed += 1;
                        tracing::warn!(id = %id, error = %err, "migration insert failed");
                    }
                }
            }
            self.events.publish(MemoryEvent::MigrationProgress {
                migrated: report.migrated,
                total,
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbeddings;
    use crate::structured::StructuredStore;
    use crate::types::MemoryEntry;

    #[tokio::test]
    async fn test_migrates_all_entries() {
        let source = Arc::new(StructuredStore::default());
        let target = Arc::new(StructuredStore::default());
        for i in 0..25 {
            source
                .store(MemoryEntry::new(
                    format!("k{i}"),
                    format!("content {i}"),
                    if i % 2 == 0 { "even" } else { "odd" },
                ))
                .await
                .unwrap();
        }

        let migrator = Migrator::new(
            Arc::clone(&source) as _,
            Arc::clone(&target) as _,
            EventBus::new(),
            MigrationConfig {
                batch_size: 7,
                embed_missing: false,
            },
        );
        let report = migrator.run().await.unwrap();
        assert_eq!(report.migrated, 25);
        assert_eq!(report.failed, 0);
        assert_eq!(target.count(None).await.unwrap(), 25);
    }

    #[tokio::test]
    async fn test_embeds_missing_vectors() {
        let source = Arc::new(StructuredStore::default());
        let target = Arc::new(StructuredStore::default());
        source
            .store(MemoryEntry::new("k", "needs a vector", "ns"))
            .await
            .unwrap();

        let migrator = Migrator::new(
            Arc::clone(&source) as _,
            Arc::clone(&target) as _,
            EventBus::new(),
            MigrationConfig::default(),
        )
        .with_embedder(Arc::new(HashEmbeddings::new(16)));
        let report = migrator.run().await.unwrap();
        assert_eq!(report.migrated, 1);

        let migrated = target.get_by_key("ns", "k").await.unwrap().unwrap();
        assert_eq!(migrated.embedding.as_ref().map(Vec::len), Some(16));
    }

    #[tokio::test]
    async fn test_vectorless_entries_skipped_without_embedder() {
        let source = Arc::new(StructuredStore::default());
        let target = Arc::new(StructuredStore::default());
        source
            .store(MemoryEntry::new("no-vector", "plain text", "ns"))
            .await
            .unwrap();
        source
            .store(
                MemoryEntry::new("has-vector", "embedded text", "ns")
                    .with_embedding(vec![0.1, 0.2]),
            )
            .await
            .unwrap();

        // embed_missing is on but no embedder is configured: the vector-less
        // entry is counted as skipped and never stored.
        let migrator = Migrator::new(
            Arc::clone(&source) as _,
            Arc::clone(&target) as _,
            EventBus::new(),
            MigrationConfig::default(),
        );
        let report = migrator.run().await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(target.count(None).await.unwrap(), 1);
        assert!(target.get_by_key("ns", "no-vector").await.unwrap().is_none());
        assert!(target.get_by_key("ns", "has-vector").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_progress_events_emitted() {
        let source = Arc::new(StructuredStore::default());
        let target = Arc::new(StructuredStore::default());
        for i in 0..5 {
            source
                .store(MemoryEntry::new(format!("k{i}"), "c", "ns"))
                .await
                .unwrap();
        }
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let migrator = Migrator::new(
            Arc::clone(&source) as _,
            Arc::clone(&target) as _,
            bus,
            MigrationConfig {
                batch_size: 2,
                embed_missing: false,
            },
        );
        migrator.run().await.unwrap();

        let mut saw_started = false;
        let mut saw_progress = false;
        let mut saw_completed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                MemoryEvent::MigrationStarted { total } => {
                    saw_started = true;
                    assert_eq!(total, 5);
                }
                MemoryEvent::MigrationProgress { .. } => saw_progress = true,
                MemoryEvent::MigrationCompleted { migrated } => {
                    saw_completed = true;
                    assert_eq!(migrated, 5);
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_progress && saw_completed);
    }

    #[tokio::test]
    async fn test_empty_source() {
        let source = Arc::new(StructuredStore::default());
        let target = Arc::new(StructuredStore::default());
        let migrator = Migrator::new(
            Arc::clone(&source) as _,
            Arc::clone(&target) as _,
            EventBus::new(),
            MigrationConfig::default(),
        );
        let report = migrator.run().await.unwrap();
        assert_eq!(report, MigrationReport::default());
    }
}
