use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::error::{NodeError, Result};
use crate::queue::job::{Job, JobStatus};
use crate::store::{to_millis, Store};

const JOB_TABLE: &str = "jobs";
const JOB_COLUMNS: &str = "id, kind, payload, status, claimed_by, claimed_at, attempts, result, error, created_at, completed_at";

/// How a claimed job leaves the `Claimed` state.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Marked(serde_json::Value),
    Failed(String),
    /// Transient failure; the job goes back to the queue.
    Released(String),
    ManualMarking(String),
}

impl Completion {
    fn status(&self) -> JobStatus {
        match self {
            Completion::Marked(_) => JobStatus::Marked,
            Completion::Failed(_) => JobStatus::Failed,
            Completion::Released(_) => JobStatus::AwaitingMarking,
            Completion::ManualMarking(_) => JobStatus::AwaitingManualMarking,
        }
    }
}

/// Job table access. Claims and reclaims run under the cluster-wide job lock.
#[derive(Debug, Clone)]
pub struct JobStore {
    store: Arc<Store>,
}

impl JobStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn insert(&self, kind: &str, payload: &serde_json::Value) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO jobs (kind, payload, status, attempts, created_at) VALUES (?, ?, ?, 0, ?)",
        )
        .bind(kind)
        .bind(payload.to_string())
        .bind(JobStatus::AwaitingMarking.code())
        .bind(to_millis(Utc::now()))
        .execute(self.store.pool()?)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(self.store.pool()?)
            .await?;
        row.as_ref().map(Job::from_row).transpose()
    }

    /// Jobs in claim order, optionally restricted to one status.
    pub async fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs WHERE status = ? ORDER BY created_at, id",
                    JOB_COLUMNS
                ))
                .bind(status.code())
                .fetch_all(self.store.pool()?)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM jobs ORDER BY created_at, id",
                    JOB_COLUMNS
                ))
                .fetch_all(self.store.pool()?)
                .await?
            }
        };
        rows.iter().map(Job::from_row).collect()
    }

    pub async fn count_by_status(&self) -> Result<HashMap<JobStatus, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(self.store.pool()?)
            .await?;
        let mut counts = HashMap::new();
        for row in rows {
            let code: i64 = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            if let Some(status) = JobStatus::from_code(code) {
                counts.insert(status, n.max(0) as u64);
            }
        }
        Ok(counts)
    }

    /// Claim up to `limit` of the oldest awaiting jobs for `node`.
    ///
    /// The select and the `AwaitingMarking -> Claimed` update happen inside
    /// one table-lock window; the lock is released before this returns.
    pub async fn claim_next(&self, node: Uuid, limit: u32) -> Result<Vec<Job>> {
        let mut lock = self.store.lock_table(JOB_TABLE).await?;
        match Self::claim_locked(lock.conn()?, node, limit).await {
            Ok(jobs) => {
                lock.release().await?;
                Ok(jobs)
            }
            Err(e) => {
                if let Err(abort_err) = lock.abort().await {
                    tracing::warn!(error = %abort_err, "Failed to roll back claim");
                }
                Err(e)
            }
        }
    }

    async fn claim_locked(
        conn: &mut sqlx::SqliteConnection,
        node: Uuid,
        limit: u32,
    ) -> Result<Vec<Job>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE status = ? ORDER BY created_at, id LIMIT ?",
        )
        .bind(JobStatus::AwaitingMarking.code())
        .bind(i64::from(limit))
        .fetch_all(&mut *conn)
        .await?;

        let now = to_millis(Utc::now());
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            let updated = sqlx::query(
                "UPDATE jobs SET status = ?, claimed_by = ?, claimed_at = ?, attempts = attempts + 1
                 WHERE id = ? AND status = ?",
            )
            .bind(JobStatus::Claimed.code())
            .bind(node)
            .bind(now)
            .bind(id)
            .bind(JobStatus::AwaitingMarking.code())
            .execute(&mut *conn)
            .await?;
            if updated.rows_affected() != 1 {
                return Err(NodeError::Internal(format!(
                    "job {} changed state inside the claim window",
                    id
                )));
            }

            let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
                .bind(id)
                .fetch_one(&mut *conn)
                .await?;
            claimed.push(Job::from_row(&row)?);
        }
        Ok(claimed)
    }

    /// Move a job claimed by `node` out of `Claimed`.
    ///
    /// Fails with `ClaimLost` if the job is no longer claimed by `node`, e.g.
    /// after it was reclaimed from a node presumed dead.
    pub async fn finish(&self, id: i64, node: Uuid, completion: Completion) -> Result<JobStatus> {
        let status = completion.status();
        let now = to_millis(Utc::now());
        let (result, error, completed_at) = match &completion {
            Completion::Marked(result) => (Some(result.to_string()), None, Some(now)),
            Completion::Failed(error) | Completion::ManualMarking(error) => {
                (None, Some(error.clone()), Some(now))
            }
            Completion::Released(error) => (None, Some(error.clone()), None),
        };
        let released = status == JobStatus::AwaitingMarking;

        let updated = sqlx::query(
            "UPDATE jobs SET status = ?, result = ?, error = ?, completed_at = ?,
                claimed_by = CASE WHEN ? THEN NULL ELSE claimed_by END,
                claimed_at = CASE WHEN ? THEN NULL ELSE claimed_at END
             WHERE id = ? AND status = ? AND claimed_by = ?",
        )
        .bind(status.code())
        .bind(result)
        .bind(error)
        .bind(completed_at)
        .bind(released)
        .bind(released)
        .bind(id)
        .bind(JobStatus::Claimed.code())
        .bind(node)
        .execute(self.store.pool()?)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(NodeError::ClaimLost { job_id: id, node });
        }
        Ok(status)
    }

    /// Give back a claimed job that was never handed to an executor.
    ///
    /// The claim's attempt is not counted.
    pub async fn release_unstarted(&self, id: i64, node: Uuid) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE jobs SET status = ?, claimed_by = NULL, claimed_at = NULL,
                attempts = MAX(attempts - 1, 0)
             WHERE id = ? AND status = ? AND claimed_by = ?",
        )
        .bind(JobStatus::AwaitingMarking.code())
        .bind(id)
        .bind(JobStatus::Claimed.code())
        .bind(node)
        .execute(self.store.pool()?)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(NodeError::ClaimLost { job_id: id, node });
        }
        Ok(())
    }

    /// Return claims to `AwaitingMarking` when the claimant's heartbeat
    /// predates `heartbeat_cutoff`, the claimant is missing from the
    /// registry, or the claim was taken before `claimed_before`.
    pub async fn reclaim_stale(
        &self,
        heartbeat_cutoff: DateTime<Utc>,
        claimed_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut lock = self.store.lock_table(JOB_TABLE).await?;
        let outcome = sqlx::query(
            "UPDATE jobs SET status = ?, claimed_by = NULL, claimed_at = NULL
             WHERE status = ?
               AND (claimed_by IS NULL
                    OR claimed_at IS NULL
                    OR claimed_at < ?
                    OR claimed_by NOT IN (SELECT uuid FROM nodes WHERE last_heartbeat >= ?))",
        )
        .bind(JobStatus::AwaitingMarking.code())
        .bind(JobStatus::Claimed.code())
        .bind(to_millis(claimed_before))
        .bind(to_millis(heartbeat_cutoff))
        .execute(lock.conn()?)
        .await;

        match outcome {
            Ok(result) => {
                lock.release().await?;
                Ok(result.rows_affected())
            }
            Err(e) => {
                if let Err(abort_err) = lock.abort().await {
                    tracing::warn!(error = %abort_err, "Failed to roll back reclaim");
                }
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeRegistration, NodeRegistry};
    use crate::store::StoreOptions;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn job_store(dir: &TempDir) -> JobStore {
        let path = dir.path().join("jobs.db");
        let store = Store::open(
            StoreOptions::new(format!("sqlite:{}", path.display()))
                .with_lock_timeout(Duration::from_secs(2)),
        )
        .await
        .unwrap();
        JobStore::new(Arc::new(store))
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let dir = TempDir::new().unwrap();
        let jobs = job_store(&dir).await;
        let first = jobs.insert("java", &json!({"n": 1})).await.unwrap();
        let second = jobs.insert("java", &json!({"n": 2})).await.unwrap();
        let node = Uuid::new_v4();

        let claimed = jobs.claim_next(node, 1).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first);
        assert_eq!(claimed[0].status, JobStatus::Claimed);
        assert_eq!(claimed[0].claimed_by, Some(node));
        assert_eq!(claimed[0].attempts, 1);

        let claimed = jobs.claim_next(node, 5).await.unwrap();
        assert_eq!(claimed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![second]);
        assert!(jobs.claim_next(node, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_requires_current_claim() {
        let dir = TempDir::new().unwrap();
        let jobs = job_store(&dir).await;
        let id = jobs.insert("java", &json!({})).await.unwrap();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        jobs.claim_next(owner, 1).await.unwrap();

        let err = jobs
            .finish(id, other, Completion::Marked(json!({"mark": 100})))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::ClaimLost { job_id, .. } if job_id == id));

        let status = jobs
            .finish(id, owner, Completion::Marked(json!({"mark": 100})))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Marked);

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.result, Some(json!({"mark": 100})));
        assert!(job.completed_at.is_some());
        assert_eq!(job.claimed_by, Some(owner));

        // Already settled: a second completion is a lost claim.
        assert!(jobs
            .finish(id, owner, Completion::Failed("late".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn released_job_is_claimable_again() {
        let dir = TempDir::new().unwrap();
        let jobs = job_store(&dir).await;
        let id = jobs.insert("java", &json!({})).await.unwrap();
        let node = Uuid::new_v4();
        jobs.claim_next(node, 1).await.unwrap();

        let status = jobs
            .finish(id, node, Completion::Released("sandbox busy".into()))
            .await
            .unwrap();
        assert_eq!(status, JobStatus::AwaitingMarking);

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.claimed_by, None);
        assert_eq!(job.error.as_deref(), Some("sandbox busy"));

        let again = jobs.claim_next(node, 1).await.unwrap();
        assert_eq!(again[0].attempts, 2);
    }

    #[tokio::test]
    async fn reclaims_claims_of_unknown_nodes() {
        let dir = TempDir::new().unwrap();
        let jobs = job_store(&dir).await;
        let id = jobs.insert("java", &json!({})).await.unwrap();
        jobs.claim_next(Uuid::new_v4(), 1).await.unwrap();

        let hour_ago = Utc::now() - chrono::Duration::hours(1);
        let reclaimed = jobs.reclaim_stale(Utc::now(), hour_ago).await.unwrap();
        assert_eq!(reclaimed, 1);
        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::AwaitingMarking);
        assert_eq!(job.claimed_by, None);
    }

    #[tokio::test]
    async fn claim_past_work_timeout_is_reclaimed_from_live_node() {
        let dir = TempDir::new().unwrap();
        let jobs = job_store(&dir).await;
        let registry = NodeRegistry::new(jobs.store.clone(), Duration::from_secs(60));
        let node = Uuid::new_v4();
        registry
            .register(&NodeRegistration {
                uuid: node,
                title: "busy".into(),
                rpc_endpoint: None,
            })
            .await
            .unwrap();
        let id = jobs.insert("java", &json!({})).await.unwrap();
        jobs.claim_next(node, 1).await.unwrap();
        let heartbeat_cutoff = Utc::now() - chrono::Duration::seconds(65);

        // Claim younger than the timeout: the heartbeating owner keeps it.
        let two_minutes_ago = Utc::now() - chrono::Duration::minutes(2);
        assert_eq!(jobs.reclaim_stale(heartbeat_cutoff, two_minutes_ago).await.unwrap(), 0);

        // Cutoff after the claim was taken.
        let timed_out = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(jobs.reclaim_stale(heartbeat_cutoff, timed_out).await.unwrap(), 1);
        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::AwaitingMarking);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn release_unstarted_does_not_spend_an_attempt() {
        let dir = TempDir::new().unwrap();
        let jobs = job_store(&dir).await;
        let id = jobs.insert("java", &json!({})).await.unwrap();
        let node = Uuid::new_v4();
        jobs.claim_next(node, 1).await.unwrap();

        assert!(matches!(
            jobs.release_unstarted(id, Uuid::new_v4()).await,
            Err(NodeError::ClaimLost { .. })
        ));
        jobs.release_unstarted(id, node).await.unwrap();

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::AwaitingMarking);
        assert_eq!(job.claimed_by, None);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn counts_by_status() {
        let dir = TempDir::new().unwrap();
        let jobs = job_store(&dir).await;
        for _ in 0..3 {
            jobs.insert("java", &json!({})).await.unwrap();
        }
        jobs.claim_next(Uuid::new_v4(), 1).await.unwrap();

        let counts = jobs.count_by_status().await.unwrap();
        assert_eq!(counts.get(&JobStatus::AwaitingMarking), Some(&2));
        assert_eq!(counts.get(&JobStatus::Claimed), Some(&1));
    }
}
