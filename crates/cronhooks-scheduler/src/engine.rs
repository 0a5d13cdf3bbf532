use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::executor::{ExecutionReport, Executor};
use crate::gateway::Delivery;
use crate::queue::LocalQueue;

/// Drives the local queue: claims due deliveries and runs them on a
/// bounded pool of worker tasks.
pub struct QueueEngine {
    queue: Arc<LocalQueue>,
    executor: Arc<Executor>,
    workers: Arc<Semaphore>,
    worker_count: usize,
    poll_interval: Duration,
}

impl QueueEngine {
    pub fn new(
        queue: Arc<LocalQueue>,
        executor: Arc<Executor>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        let worker_count = workers.max(1);
        Self {
            queue,
            executor,
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
            poll_interval,
        }
    }

    /// Main loop. Polls every `poll_interval` until `shutdown` broadcasts
    /// `true`, then waits for in-flight attempts to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.worker_count,
            poll_ms = self.poll_interval.as_millis() as u64,
            "queue engine started"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        error!("queue tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("queue engine shutting down");
                        break;
                    }
                }
            }
        }

        // Every permit back means every worker has returned.
        match self.workers.acquire_many(self.worker_count as u32).await {
            Ok(_) => info!("in-flight attempts drained"),
            Err(e) => warn!("worker pool closed before drain: {e}"),
        }
    }

    /// Claim as many due deliveries as there are idle workers and spawn them.
    pub fn tick(&self) -> Result<usize, DispatchError> {
        let idle = self.workers.available_permits();
        if idle == 0 {
            debug!("all workers busy, skipping claim");
            return Ok(0);
        }
        let deliveries = self.queue.claim_due(Utc::now(), idle)?;
        let claimed = deliveries.len();
        for delivery in deliveries {
            let Ok(permit) = self.workers.clone().try_acquire_owned() else {
                // Only this loop takes permits, so this cannot happen while
                // `claimed <= idle`.
                error!(job_id = %delivery.job_id, "no idle worker for claimed delivery");
                continue;
            };
            let executor = self.executor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                run_delivery(&executor, delivery).await;
            });
        }
        Ok(claimed)
    }
}

async fn run_delivery(executor: &Executor, delivery: Delivery) {
    let Delivery {
        job_id,
        attempt_number,
    } = delivery;
    match executor.execute(&job_id, attempt_number).await {
        Ok(ExecutionReport::Attempted(report)) => {
            debug!(job_id = %job_id, attempt = attempt_number, status = %report.status, "delivery finished");
        }
        Ok(ExecutionReport::Skipped(reason)) => {
            debug!(job_id = %job_id, attempt = attempt_number, ?reason, "delivery skipped");
        }
        Err(e) => {
            error!(job_id = %job_id, attempt = attempt_number, code = e.code(), "delivery failed: {e}");
        }
    }
}
