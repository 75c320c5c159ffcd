//! Worker pool: owns N execution backend adapters and hands them out one at
//! a time. Acquisition under saturation is backpressure (a bounded wait on a
//! semaphore), not rejection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::backend::{ChannelFactory, CommandChannel};
use crate::config::PoolConfig;
use crate::error::{GafferError, Result};
use crate::verify::CommandVerifier;

/// One isolated execution context. Owned by the pool; callers only ever hold
/// a [`WorkerLease`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub slot: usize,
    pub busy: bool,
    pub current_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

struct WorkerSlot {
    worker: Worker,
    channel: Arc<dyn CommandChannel>,
    /// Bumped on restart so a lease issued before the restart cannot release
    /// or address the recreated session.
    generation: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: String,
    pub slot: usize,
    pub busy: bool,
    /// First 100 chars of the task currently bound to the worker.
    pub current_task: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct WorkerPool {
    config: PoolConfig,
    factory: Arc<dyn ChannelFactory>,
    slots: Mutex<Vec<WorkerSlot>>,
    capacity: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, factory: Arc<dyn ChannelFactory>) -> Self {
        let mut slots = Vec::with_capacity(config.size);
        for slot in 0..config.size {
            slots.push(WorkerSlot {
                worker: Worker {
                    id: format!("worker-{}", slot),
                    slot,
                    busy: false,
                    current_task_id: None,
                    created_at: Utc::now(),
                },
                channel: factory.create(slot),
                generation: 0,
            });
        }
        Self {
            capacity: Arc::new(Semaphore::new(config.size)),
            config,
            factory,
            slots: Mutex::new(slots),
        }
    }

    /// Start every worker's backend session.
    pub async fn initialize(&self) -> Result<()> {
        let channels: Vec<Arc<dyn CommandChannel>> = {
            let slots = self.slots.lock();
            slots.iter().map(|s| Arc::clone(&s.channel)).collect()
        };
        let results = join_all(channels.iter().map(|c| c.start())).await;
        for result in results {
            result?;
        }
        info!(size = self.config.size, "worker pool initialized");
        Ok(())
    }

    /// Wait (bounded) for an idle worker and lease it for `task_id`.
    pub async fn acquire(self: &Arc<Self>, task_id: &str) -> Result<WorkerLease> {
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let permit = match tokio::time::timeout(
            timeout,
            Arc::clone(&self.capacity).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GafferError::Other("worker pool is shut down".to_string()))
            }
            Err(_) => {
                warn!(task_id, "no worker became idle before the deadline");
                return Err(GafferError::PoolSaturated {
                    waited_ms: self.config.acquire_timeout_ms,
                });
            }
        };

        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| !s.worker.busy)
            .ok_or_else(|| GafferError::Other("permit held but no idle slot".to_string()))?;

        slot.worker.busy = true;
        slot.worker.current_task_id = Some(task_id.to_string());
        debug!(worker = %slot.worker.id, task_id, "worker leased");

        Ok(WorkerLease {
            pool: Arc::clone(self),
            worker_id: slot.worker.id.clone(),
            slot: slot.worker.slot,
            generation: slot.generation,
            channel: Arc::clone(&slot.channel),
            _permit: permit,
        })
    }

    fn release(&self, slot: usize, generation: u64) {
        let mut slots = self.slots.lock();
        let entry = &mut slots[slot];
        if entry.generation != generation {
            // The worker was restarted while leased; the restart already
            // reset the slot.
            warn!(worker = %entry.worker.id, "stale lease release ignored");
            return;
        }
        entry.worker.busy = false;
        entry.worker.current_task_id = None;
        debug!(worker = %entry.worker.id, "worker released");
    }

    /// Tear down and recreate the backend session for one slot. The worker
    /// keeps its identity; its session state and checkout are discarded, so
    /// any in-flight work bound to it must be treated as failed by the caller.
    pub async fn restart(&self, worker_id: &str) -> Result<()> {
        let (slot, old_channel) = {
            let slots = self.slots.lock();
            let entry = slots
                .iter()
                .find(|s| s.worker.id == worker_id)
                .ok_or_else(|| GafferError::WorkerNotFound(worker_id.to_string()))?;
            if entry.worker.busy {
                warn!(worker = worker_id, "restarting a busy worker; in-flight work is lost");
            }
            (entry.worker.slot, Arc::clone(&entry.channel))
        };

        old_channel.kill().await?;
        let channel = self.factory.create(slot);
        channel.start().await?;

        let mut slots = self.slots.lock();
        let entry = &mut slots[slot];
        entry.channel = channel;
        entry.generation += 1;
        entry.worker.busy = false;
        entry.worker.current_task_id = None;
        entry.worker.created_at = Utc::now();
        info!(worker = worker_id, "worker restarted");
        Ok(())
    }

    /// Probe one worker's session and restart it if it stopped responding.
    /// Returns true when a restart was performed.
    pub async fn ensure_healthy(
        &self,
        verifier: &CommandVerifier,
        worker_id: &str,
    ) -> Result<bool> {
        let channel = {
            let slots = self.slots.lock();
            let entry = slots
                .iter()
                .find(|s| s.worker.id == worker_id)
                .ok_or_else(|| GafferError::WorkerNotFound(worker_id.to_string()))?;
            Arc::clone(&entry.channel)
        };

        let probe = verifier.monitor_health(channel.as_ref()).await;
        if probe.healthy && probe.responsive {
            return Ok(false);
        }

        warn!(
            worker = worker_id,
            healthy = probe.healthy,
            responsive = probe.responsive,
            "worker unhealthy, restarting"
        );
        self.restart(worker_id).await?;
        Ok(true)
    }

    pub fn status(&self) -> PoolStatus {
        let slots = self.slots.lock();
        let mut status = PoolStatus {
            total: slots.len(),
            busy: 0,
            idle: 0,
            workers: Vec::with_capacity(slots.len()),
        };
        for entry in slots.iter() {
            if entry.worker.busy {
                status.busy += 1;
            } else {
                status.idle += 1;
            }
            status.workers.push(WorkerStatus {
                id: entry.worker.id.clone(),
                slot: entry.worker.slot,
                busy: entry.worker.busy,
                current_task: entry
                    .worker
                    .current_task_id
                    .as_ref()
                    .map(|t| t.chars().take(100).collect()),
                created_at: entry.worker.created_at,
            });
        }
        status
    }

    /// Kill every backend session. Used on shutdown.
    pub async fn shutdown(&self) {
        let channels: Vec<Arc<dyn CommandChannel>> = {
            let slots = self.slots.lock();
            slots.iter().map(|s| Arc::clone(&s.channel)).collect()
        };
        for channel in channels {
            if let Err(e) = channel.kill().await {
                warn!(error = %e, "failed to kill worker session during shutdown");
            }
        }
    }
}

/// Exclusive, scoped access to one worker's channel. Dropping the lease
/// returns the worker to the idle set.
pub struct WorkerLease {
    pool: Arc<WorkerPool>,
    worker_id: String,
    slot: usize,
    generation: u64,
    channel: Arc<dyn CommandChannel>,
    _permit: OwnedSemaphorePermit,
}

impl WorkerLease {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn channel(&self) -> &dyn CommandChannel {
        self.channel.as_ref()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.pool.release(self.slot, self.generation);
    }
}
