//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use pulse_core::{ExpectedVersion, JobId, UserId};

use super::types::{Job, JobKind, JobStatus};

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 100;

/// Job store abstraction.
///
/// Writes are compare-and-swap on [`Job::version`]: `update` succeeds only when
/// the stored version matches `expected`, and returns the stored record with
/// its version bumped.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Insert a new job.
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Get a job by ID, including soft-deleted ones.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Replace a job if its stored version matches `expected`.
    async fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError>;

    /// A user's jobs, newest first.
    async fn list(&self, user_id: UserId, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("concurrent job update: {0}")]
    Concurrency(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Listing filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub include_deleted: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            kind: None,
            status: None,
            include_deleted: false,
            limit: DEFAULT_LIST_LIMIT,
            offset: 0,
        }
    }
}

impl JobFilter {
    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Clamped to `1..=MAX_LIST_LIMIT`.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, MAX_LIST_LIMIT);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        (self.include_deleted || !job.is_deleted())
            && self.kind.is_none_or(|k| k == job.kind)
            && self.status.is_none_or(|s| s == job.status)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn update(&self, job: &Job, expected: ExpectedVersion) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let stored = jobs
            .get_mut(&job.id)
            .ok_or(JobStoreError::NotFound(job.id))?;
        if !expected.matches(stored.version) {
            return Err(JobStoreError::Concurrency(format!(
                "job {} expected {:?}, found version {}",
                job.id, expected, stored.version
            )));
        }
        let mut next = job.clone();
        next.version = stored.version + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn list(&self, user_id: UserId, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| j.user_id == user_id && filter.matches(j))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out.into_iter().skip(filter.offset).take(filter.limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn test_job(user_id: UserId, kind: JobKind, minutes_ago: i64) -> Job {
        Job::pending(
            JobId::new(),
            user_id,
            kind,
            json!({}),
            1,
            Utc::now() - Duration::minutes(minutes_ago),
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = InMemoryJobStore::new();
        let job = test_job(UserId::new(), JobKind::Image, 0);
        store.insert(&job).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(matches!(
            store.insert(&job).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let store = InMemoryJobStore::new();
        let mut job = test_job(UserId::new(), JobKind::Video, 0);
        store.insert(&job).await.unwrap();

        job.begin(Utc::now());
        let stored = store.update(&job, ExpectedVersion::Exact(0)).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = store.update(&job, ExpectedVersion::Exact(0)).await;
        assert!(matches!(err, Err(JobStoreError::Concurrency(_))));
    }

    #[tokio::test]
    async fn list_is_scoped_filtered_and_newest_first() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let oldest = test_job(user, JobKind::Image, 30);
        let newest = test_job(user, JobKind::Image, 1);
        let video = test_job(user, JobKind::Video, 10);
        let stranger = test_job(UserId::new(), JobKind::Image, 5);
        for job in [&oldest, &newest, &video, &stranger] {
            store.insert(job).await.unwrap();
        }

        let all = store.list(user, &JobFilter::default()).await.unwrap();
        let ids: Vec<JobId> = all.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![newest.id, video.id, oldest.id]);

        let images = store
            .list(user, &JobFilter::default().with_kind(JobKind::Image).with_limit(1))
            .await
            .unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, newest.id);

        let second_page = store
            .list(user, &JobFilter::default().with_limit(2).with_offset(2))
            .await
            .unwrap();
        assert_eq!(second_page.len(), 1);
        assert_eq!(second_page[0].id, oldest.id);
    }

    #[tokio::test]
    async fn deleted_jobs_are_hidden_by_default() {
        let store = InMemoryJobStore::new();
        let user = UserId::new();
        let mut job = test_job(user, JobKind::Cv, 0);
        job.cancel(None, Utc::now()).unwrap();
        job.soft_delete(Utc::now()).unwrap();
        store.insert(&job).await.unwrap();

        assert!(store.list(user, &JobFilter::default()).await.unwrap().is_empty());
        let filter = JobFilter {
            include_deleted: true,
            ..JobFilter::default()
        };
        assert_eq!(store.list(user, &filter).await.unwrap().len(), 1);
    }
}
