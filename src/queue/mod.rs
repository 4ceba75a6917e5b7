//! Durable job queue: a `JobBroker` abstraction over the external broker
//! (Redis), plus the sync job types the worker and HTTP surface share.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_collections: u64,
    pub synced_collections: u64,
    pub current_collection_tag: Option<String>,
    pub current_collection_name: Option<String>,
    pub current_rarity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub status: JobStatus,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub error: Option<String>,
    pub progress: JobProgress,
    pub resume_after_ms: Option<u64>,
}

impl SyncJob {
    pub fn new_pending(id: String) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            progress: JobProgress::default(),
            resume_after_ms: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running | JobStatus::Paused)
    }
}

/// Storage abstraction for sync jobs. `Store`/`Redis` is treated as an
/// opaque durable collaborator; this trait is the only seam this service
/// needs from it.
#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Returns the current in-flight job, if any, without creating one.
    async fn find_in_flight(&self) -> AppResult<Option<SyncJob>>;

    /// Enqueues a brand new pending job and returns it.
    async fn enqueue(&self) -> AppResult<SyncJob>;

    async fn get(&self, job_id: &str) -> AppResult<Option<SyncJob>>;

    async fn list_recent(&self, limit: usize) -> AppResult<Vec<SyncJob>>;

    async fn save(&self, job: &SyncJob) -> AppResult<()>;
}

const JOB_INDEX_KEY: &str = "tradeup:sync:jobs";

pub struct RedisJobBroker {
    client: redis::Client,
    queue_name: String,
}

impl RedisJobBroker {
    pub fn new(redis_url: &str, queue_name: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| AppError::Fatal(format!("invalid REDIS_URL: {e}")))?;
        Ok(Self {
            client,
            queue_name: queue_name.to_string(),
        })
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.queue_name, job_id)
    }

    async fn connection(&self) -> AppResult<redis::aio::ConnectionManager> {
        self.client
            .get_connection_manager()
            .await
            .map_err(|e| AppError::Transport(e.to_string()))
    }
}

#[async_trait]
impl JobBroker for RedisJobBroker {
    async fn find_in_flight(&self) -> AppResult<Option<SyncJob>> {
        let recent = self.list_recent(20).await?;
        Ok(recent.into_iter().find(|j| j.is_in_flight()))
    }

    async fn enqueue(&self) -> AppResult<SyncJob> {
        let job = SyncJob::new_pending(Uuid::new_v4().to_string());
        self.save(&job).await?;

        let mut conn = self.connection().await?;
        let _: () = conn
            .zadd(JOB_INDEX_KEY, &job.id, now_unix_ms())
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        Ok(job)
    }

    async fn get(&self, job_id: &str) -> AppResult<Option<SyncJob>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.job_key(job_id))
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        raw.map(|s| serde_json::from_str(&s).map_err(|e| AppError::Parse(e.to_string())))
            .transpose()
    }

    async fn list_recent(&self, limit: usize) -> AppResult<Vec<SyncJob>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = conn
            .zrevrange(JOB_INDEX_KEY, 0, limit as isize - 1)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn save(&self, job: &SyncJob) -> AppResult<()> {
        let mut conn = self.connection().await?;
        let serialized = serde_json::to_string(job).map_err(|e| AppError::Parse(e.to_string()))?;
        let _: () = conn
            .set_ex(self.job_key(&job.id), serialized, 7 * 24 * 3600)
            .await
            .map_err(|e| AppError::Transport(e.to_string()))?;
        Ok(())
    }
}

fn now_unix_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// In-memory broker used by tests and by the worker's own unit tests —
/// same seam, no Redis round-trip.
#[derive(Default)]
pub struct InMemoryJobBroker {
    jobs: parking_lot::Mutex<HashMap<String, SyncJob>>,
}

#[async_trait]
impl JobBroker for InMemoryJobBroker {
    async fn find_in_flight(&self) -> AppResult<Option<SyncJob>> {
        Ok(self.jobs.lock().values().find(|j| j.is_in_flight()).cloned())
    }

    async fn enqueue(&self) -> AppResult<SyncJob> {
        let job = SyncJob::new_pending(Uuid::new_v4().to_string());
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: &str) -> AppResult<Option<SyncJob>> {
        Ok(self.jobs.lock().get(job_id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> AppResult<Vec<SyncJob>> {
        let mut jobs: Vec<_> = self.jobs.lock().values().cloned().collect();
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn save(&self, job: &SyncJob) -> AppResult<()> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_trigger_returns_existing_in_flight_job() {
        let broker = InMemoryJobBroker::default();
        let first = broker.enqueue().await.unwrap();
        assert_eq!(broker.find_in_flight().await.unwrap().unwrap().id, first.id);
    }

    #[tokio::test]
    async fn completed_job_is_not_in_flight() {
        let broker = InMemoryJobBroker::default();
        let mut job = broker.enqueue().await.unwrap();
        job.status = JobStatus::Completed;
        broker.save(&job).await.unwrap();
        assert!(broker.find_in_flight().await.unwrap().is_none());
    }
}
