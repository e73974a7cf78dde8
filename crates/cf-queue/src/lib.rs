//! Queue bridge (C6, §4.6): periodically consumes `pending_jobs` rows and
//! pushes them onto the in-process work queue the worker pool (C7) reads
//! from. Mirrors the heartbeat ticker loop pattern (`tokio::time::interval`
//! in a spawned task) generalized to do real work each tick instead of
//! emitting a bus event.

use anyhow::{Context, Result};
use cf_schemas::PendingJob;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The in-process work queue between C6 (producer) and C7 (consumer). A
/// bounded channel applies natural backpressure: if the worker pool falls
/// behind, the bridge's `send` calls block rather than growing memory
/// without limit.
pub fn work_queue(capacity: usize) -> (WorkQueueSender, WorkQueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (WorkQueueSender(tx), WorkQueueReceiver(rx))
}

#[derive(Clone)]
pub struct WorkQueueSender(mpsc::Sender<PendingJob>);

impl WorkQueueSender {
    pub async fn send(&self, job: PendingJob) -> Result<(), mpsc::error::SendError<PendingJob>> {
        self.0.send(job).await
    }
}

pub struct WorkQueueReceiver(mpsc::Receiver<PendingJob>);

impl WorkQueueReceiver {
    pub async fn recv(&mut self) -> Option<PendingJob> {
        self.0.recv().await
    }
}

pub struct QueueBridge {
    pool: PgPool,
    sender: WorkQueueSender,
    batch_size: i64,
    dispatcher_id: String,
    poll_interval: Duration,
}

impl QueueBridge {
    pub fn new(pool: PgPool, sender: WorkQueueSender, batch_size: i64, dispatcher_id: String, poll_interval: Duration) -> Self {
        Self {
            pool,
            sender,
            batch_size,
            dispatcher_id,
            poll_interval,
        }
    }

    /// Run the poll loop until `shutdown` fires. Every tick claims up to
    /// `batch_size` pending rows (atomically marking them `enqueued`,
    /// cf-db's `claim_pending_jobs`) and forwards each to the work queue.
    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        warn!(error = %e, "queue bridge poll failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("queue bridge shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<()> {
        let claimed = cf_db::claim_pending_jobs(&self.pool, self.batch_size, &self.dispatcher_id)
            .await
            .context("claim_pending_jobs failed")?;

        if claimed.is_empty() {
            return Ok(());
        }
        info!(count = claimed.len(), "claimed pending jobs");

        for job in claimed {
            let job_id = job.id;
            if self.sender.send(job).await.is_err() {
                warn!(job_id = %job_id, "work queue receiver dropped; job remains enqueued for next bridge restart");
                return Ok(());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_schemas::PendingJobStatus;
    use serde_json::json;
    use uuid::Uuid;

    fn sample_job() -> PendingJob {
        PendingJob {
            id: Uuid::new_v4(),
            application_id: Uuid::new_v4(),
            task_name: "process_credit_application".to_string(),
            job_args: json!({}),
            job_kwargs: json!({}),
            status: PendingJobStatus::Enqueued,
            queue_handle: None,
            dispatcher_id: Some("dispatcher-1".to_string()),
            created_at: chrono::Utc::now(),
            enqueued_at: Some(chrono::Utc::now()),
            processed_at: None,
            updated_at: chrono::Utc::now(),
            error_message: None,
            retry_count: 0,
        }
    }

    #[tokio::test]
    async fn send_and_recv_round_trips_a_job() {
        let (tx, mut rx) = work_queue(4);
        let job = sample_job();
        let id = job.id;
        tx.send(job).await.unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, id);
    }

    #[tokio::test]
    async fn dropped_receiver_surfaces_send_error() {
        let (tx, rx) = work_queue(1);
        drop(rx);
        let err = tx.send(sample_job()).await;
        assert!(err.is_err());
    }
}
