//! Per-node work loop: claim, execute, complete.
//!
//! Each worker claims a batch of the oldest awaiting jobs under the
//! cluster-wide job lock, runs them outside the lock and records the outcome.
//! Idle workers sleep until the next poll or until a `work.wake` event
//! arrives. A separate reaper returns claims held by dead nodes and claims
//! that outlived the work timeout.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::hooks::{GlobalEvent, GlobalHookHandler};
use crate::queue::executor::{ExecutorError, ExecutorRegistry};
use crate::queue::job::{Job, JobStatus};
use crate::queue::store::{Completion, JobStore};

const FINISH_ATTEMPTS: u32 = 3;
const FINISH_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each idle poll.
    pub poll_jitter: Duration,
    pub claim_batch: u32,
    pub max_attempts: u32,
    /// Claims whose owner has not heartbeated for this long are reclaimed.
    pub stale_after: Duration,
    /// Claims older than this are reclaimed whatever their owner's state.
    pub work_timeout: Duration,
    pub reap_interval: Duration,
}

impl CoordinatorConfig {
    pub fn from_node(config: &NodeConfig) -> Self {
        let poll_interval = config.poll_interval();
        Self {
            poll_interval,
            poll_jitter: poll_interval / 10,
            claim_batch: config.claim_batch.max(1),
            max_attempts: config.max_attempts.max(1),
            stale_after: config.stale_claim_after(),
            work_timeout: config.work_timeout(),
            reap_interval: config.heartbeat_interval(),
        }
    }
}

pub struct Coordinator {
    node: Uuid,
    jobs: JobStore,
    executors: Arc<ExecutorRegistry>,
    wake: Arc<Notify>,
    config: CoordinatorConfig,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("node", &self.node)
            .field("executors", &self.executors)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        node: Uuid,
        jobs: JobStore,
        executors: Arc<ExecutorRegistry>,
        wake: Arc<Notify>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            node,
            jobs,
            executors,
            wake,
            config,
        }
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    /// Worker loop. Cancellation is only observed between jobs, so a job that
    /// has started executing always runs to completion.
    pub async fn run_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        tracing::debug!(node = %self.node, worker, "Worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Armed before claiming: a wake that lands mid-claim still counts.
            let wake = self.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            let processed = match self.run_once(worker).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(node = %self.node, worker, error = %e, "Claim attempt failed");
                    0
                }
            };
            if processed > 0 {
                continue;
            }

            if !self.idle(wake, &cancel).await {
                break;
            }
        }
        tracing::debug!(node = %self.node, worker, "Worker stopped");
    }

    /// Sleep until woken, the next poll, or cancellation. False when cancelled.
    async fn idle(&self, wake: Pin<&mut Notified<'_>>, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = wake => {
                tracing::trace!(node = %self.node, "Worker woken");
                true
            }
            _ = tokio::time::sleep(self.idle_delay()) => true,
        }
    }

    /// Claim one batch and process it. Returns how many jobs were claimed.
    ///
    /// If recording an outcome fails, the jobs of the batch that have not
    /// started yet go back to the queue before the error is returned.
    pub async fn run_once(&self, worker: usize) -> Result<usize> {
        let claimed = self.jobs.claim_next(self.node, self.config.claim_batch).await?;
        let count = claimed.len();
        let mut batch = claimed.into_iter();
        while let Some(job) = batch.next() {
            tracing::info!(node = %self.node, worker, job_id = job.id, kind = %job.kind, attempt = job.attempts, "Job claimed");
            if let Err(e) = self.process(job).await {
                self.release_unstarted(batch).await;
                return Err(e);
            }
        }
        Ok(count)
    }

    async fn release_unstarted(&self, jobs: impl Iterator<Item = Job>) {
        for job in jobs {
            match self.jobs.release_unstarted(job.id, self.node).await {
                Ok(()) => tracing::info!(node = %self.node, job_id = job.id, "Returned unstarted job to the queue"),
                Err(e) => {
                    tracing::warn!(node = %self.node, job_id = job.id, error = %e, "Could not return unstarted job, leaving it to the work timeout")
                }
            }
        }
    }

    async fn process(&self, job: Job) -> Result<()> {
        let completion = self.mark(&job).await;
        let job_id = job.id;

        for attempt in 1..=FINISH_ATTEMPTS {
            match self.jobs.finish(job_id, self.node, completion.clone()).await {
                Ok(status) => {
                    log_completion(job_id, status, &completion);
                    return Ok(());
                }
                Err(NodeError::ClaimLost { .. }) => {
                    tracing::warn!(node = %self.node, job_id, "Claim was lost before completion, discarding result");
                    return Ok(());
                }
                Err(e) if e.is_recoverable() && attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(job_id, attempt, error = %e, "Recording job outcome failed, retrying");
                    tokio::time::sleep(FINISH_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(NodeError::Internal(format!(
            "gave up recording outcome of job {}",
            job_id
        )))
    }

    async fn mark(&self, job: &Job) -> Completion {
        let Some(executor) = self.executors.get(&job.kind) else {
            return Completion::ManualMarking(format!("no executor for kind '{}'", job.kind));
        };

        let run = match AssertUnwindSafe(executor.execute(job)).catch_unwind().await {
            Ok(run) => run,
            Err(panic) => {
                let reason = format!("executor panicked: {}", panic_message(&*panic));
                tracing::error!(job_id = job.id, attempt = job.attempts, reason = %reason, "Marking aborted");
                return Completion::Failed(reason);
            }
        };

        match run {
            Ok(outcome) => match serde_json::to_value(&outcome) {
                Ok(result) => Completion::Marked(result),
                Err(e) => Completion::Failed(format!("unserializable mark outcome: {}", e)),
            },
            Err(source) => {
                let retry = source.is_transient() && job.attempts < self.config.max_attempts;
                let reason = source.to_string();
                let err = NodeError::ExecutorFailure {
                    job_id: job.id,
                    source: source.clone(),
                };
                tracing::warn!(
                    job_id = job.id,
                    attempt = job.attempts,
                    max_attempts = self.config.max_attempts,
                    retry,
                    error = %err,
                    "Marking failed"
                );
                match source {
                    ExecutorError::Unsupported(_) => Completion::ManualMarking(reason),
                    _ if retry => Completion::Released(reason),
                    _ => Completion::Failed(reason),
                }
            }
        }
    }

    pub async fn run_reaper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.reap_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        tracing::warn!(node = %self.node, error = %e, "Stale claim sweep failed");
                    }
                }
            }
        }
    }

    pub async fn reap_once(&self) -> Result<u64> {
        self.reap_once_at(Utc::now()).await
    }

    /// Reclaim jobs, as seen at `now`, whose claimant's heartbeat is older
    /// than `stale_after` or whose claim is older than `work_timeout`.
    pub async fn reap_once_at(&self, now: DateTime<Utc>) -> Result<u64> {
        let heartbeat_cutoff = before(now, self.config.stale_after);
        let claimed_before = before(now, self.config.work_timeout);
        let reclaimed = self
            .jobs
            .reclaim_stale(heartbeat_cutoff, claimed_before)
            .await?;
        if reclaimed > 0 {
            tracing::info!(node = %self.node, reclaimed, "Reclaimed stale or timed-out claims");
            self.wake.notify_waiters();
        }
        Ok(reclaimed)
    }
}

/// `now - ago`, saturating at the earliest representable instant.
fn before(now: DateTime<Utc>, ago: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ago)
        .ok()
        .and_then(|ago| now.checked_sub_signed(ago))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn log_completion(job_id: i64, status: JobStatus, completion: &Completion) {
    match completion {
        Completion::Marked(_) => tracing::info!(job_id, %status, "Job marked"),
        Completion::Released(reason) => {
            tracing::info!(job_id, %status, reason = %reason, "Job released for retry")
        }
        Completion::Failed(reason) => tracing::warn!(job_id, %status, reason = %reason, "Job failed"),
        Completion::ManualMarking(reason) => {
            tracing::info!(job_id, %status, reason = %reason, "Job needs manual marking")
        }
    }
}

/// Wakes this node's idle workers on `work.wake`.
pub struct WakeHandler {
    notify: Arc<Notify>,
}

impl WakeHandler {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

#[async_trait]
impl GlobalHookHandler for WakeHandler {
    async fn handle(&self, event: &GlobalEvent) -> bool {
        match event {
            GlobalEvent::WorkWake { .. } => {
                self.notify.notify_waiters();
                true
            }
            _ => false,
        }
    }
}
