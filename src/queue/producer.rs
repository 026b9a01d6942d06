use std::sync::Arc;

use crate::broadcast::Broadcaster;
use crate::error::Result;
use crate::queue::store::JobStore;

/// Entry point for upstream code that creates marking work.
#[derive(Debug, Clone)]
pub struct JobProducer {
    jobs: JobStore,
    broadcaster: Arc<Broadcaster>,
}

impl JobProducer {
    pub fn new(jobs: JobStore, broadcaster: Arc<Broadcaster>) -> Self {
        Self { jobs, broadcaster }
    }

    /// Insert a job and wake the cluster. The wake fan-out runs in the
    /// background; its failures never affect the insert.
    pub async fn submit(&self, kind: &str, payload: &serde_json::Value) -> Result<i64> {
        let id = self.jobs.insert(kind, payload).await?;
        tracing::info!(job_id = id, kind, "Job submitted");

        let broadcaster = self.broadcaster.clone();
        tokio::spawn(async move {
            broadcaster.wake_all(Some(id)).await;
        });
        Ok(id)
    }
}
