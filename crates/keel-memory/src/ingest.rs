//! Asynchronous memory ingestion.
//!
//! Turn persistence enqueues ingestion work and never waits for it. The queue
//! is bounded: raw episodes always go in (the send awaits capacity so the
//! record is never lost), derived work (entity extraction, summarisation) is
//! dropped on overflow with a warning.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use keel_core::{SessionId, TenantId};

use crate::error::{MemoryError, Result};
use crate::store::MemoryStore;
use crate::types::{Entity, Episode, Relationship};

#[derive(Debug)]
pub enum IngestTask {
    /// Raw exchange record; always preserved.
    Episode(Episode),
    /// Derived graph write; droppable under pressure.
    Entity(Entity),
    /// Derived edge write; droppable under pressure.
    Relationship(Relationship),
    /// Session summarisation request; droppable, can be re-derived later.
    Summarize {
        tenant_id: TenantId,
        session_id: SessionId,
    },
}

pub struct MemoryIngestor {
    tx: mpsc::Sender<IngestTask>,
    worker: tokio::task::JoinHandle<()>,
}

impl MemoryIngestor {
    /// Spawn the ingestion worker over a bounded queue.
    pub fn spawn(store: Arc<dyn MemoryStore>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<IngestTask>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if let Err(e) = run_task(&store, task).await {
                    warn!(error = %e, "memory ingestion task failed");
                }
            }
            debug!("memory ingestion worker stopped");
        });
        Self { tx, worker }
    }

    /// Enqueue an episode. Awaits queue capacity: the raw record must land.
    pub async fn enqueue_episode(&self, episode: Episode) -> Result<()> {
        self.tx
            .send(IngestTask::Episode(episode))
            .await
            .map_err(|_| MemoryError::QueueClosed)
    }

    /// Enqueue derived work; dropped (with a warning) when the queue is full.
    pub fn enqueue_derived(&self, task: IngestTask) {
        if let Err(e) = self.tx.try_send(task) {
            match e {
                mpsc::error::TrySendError::Full(task) => {
                    warn!(?task, "ingestion queue full, dropping derived task");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("ingestion queue closed, dropping derived task");
                }
            }
        }
    }

    /// Close the queue and wait for in-flight tasks to drain.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn run_task(store: &Arc<dyn MemoryStore>, task: IngestTask) -> Result<()> {
    match task {
        IngestTask::Episode(episode) => {
            store.save_episode(episode).await?;
        }
        IngestTask::Entity(entity) => {
            store.save_entity(entity).await?;
        }
        IngestTask::Relationship(rel) => {
            store.supersede_relationship(rel).await?;
        }
        IngestTask::Summarize {
            tenant_id,
            session_id,
        } => {
            // Summarisation consumes recent episodes; the summary itself is a
            // derived artifact and regenerating it later is always safe.
            let episodes = store.list_episodes(tenant_id, session_id, 40).await?;
            debug!(
                session = %session_id,
                episodes = episodes.len(),
                "summarisation pass"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMemoryStore;

    #[tokio::test]
    async fn episodes_are_persisted_through_the_queue() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let ingestor = MemoryIngestor::spawn(store.clone(), 8);
        let tenant = TenantId::new();
        let session = SessionId::new();

        for i in 0..3 {
            ingestor
                .enqueue_episode(Episode::new(
                    tenant,
                    session,
                    None,
                    &format!("m{i}"),
                    Some("r"),
                ))
                .await
                .unwrap();
        }
        ingestor.shutdown().await;
        assert_eq!(store.episode_count(), 3);
    }

    #[tokio::test]
    async fn derived_overflow_is_dropped_not_blocking() {
        let store = Arc::new(InMemoryMemoryStore::new());
        let ingestor = MemoryIngestor::spawn(store.clone(), 1);
        let tenant = TenantId::new();

        // Flood with derived tasks; try_send never blocks and overflow drops.
        for i in 0..64 {
            ingestor.enqueue_derived(IngestTask::Entity(Entity::new(
                tenant,
                &format!("e{i}"),
                "thing",
            )));
        }
        ingestor.shutdown().await;
        // No assertion on exact count: what matters is that we got here
        // without waiting and the worker drained what fit.
    }
}
