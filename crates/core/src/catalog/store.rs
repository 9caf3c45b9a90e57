//! Job catalog trait, filter and shared update rules.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{GenerationState, GenerationUpdate, Job, JobPatch, JobState, NewJob};

/// Errors from a job catalog backend.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    #[error("job not found: {0}")]
    NotFound(i64),

    #[error("job {job_id} has no generation for task table {task_table}")]
    GenerationNotFound { job_id: i64, task_table: String },

    /// Compare-and-set rejected: another writer updated the generation first.
    #[error("version conflict on job {job_id} ({task_table}): expected {expected}, found {actual}")]
    VersionConflict {
        job_id: i64,
        task_table: String,
        expected: u64,
        actual: u64,
    },

    #[error("database error: {0}")]
    Database(String),

    /// Transport failure or unexpected status after retries.
    #[error("catalog API error: {0}")]
    Api(String),

    #[error("invalid catalog response: {0}")]
    InvalidResponse(String),
}

impl CatalogError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CatalogError::Api(_))
    }
}

/// Filter for searching jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFilter {
    pub pod: Option<String>,
    /// Only jobs holding a generation for this task table.
    pub task_table: Option<String>,
    /// Skip jobs whose generation for `task_table` is in this state.
    pub exclude_state: Option<GenerationState>,
    /// Only jobs that already contain this upstream message.
    pub message_id: Option<u64>,
    pub association_key: Option<String>,
    pub product_name: Option<String>,
    pub limit: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            pod: None,
            task_table: None,
            exclude_state: None,
            message_id: None,
            association_key: None,
            product_name: None,
            limit: 100,
        }
    }

    /// Jobs of `pod` with a generation for `task_table` not yet sent.
    pub fn pending(pod: impl Into<String>, task_table: impl Into<String>) -> Self {
        Self::new()
            .with_pod(pod)
            .with_task_table(task_table)
            .excluding_state(GenerationState::Sent)
    }

    pub fn with_pod(mut self, pod: impl Into<String>) -> Self {
        self.pod = Some(pod.into());
        self
    }

    pub fn with_task_table(mut self, task_table: impl Into<String>) -> Self {
        self.task_table = Some(task_table.into());
        self
    }

    pub fn excluding_state(mut self, state: GenerationState) -> Self {
        self.exclude_state = Some(state);
        self
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_association_key(mut self, key: impl Into<String>) -> Self {
        self.association_key = Some(key.into());
        self
    }

    pub fn with_product_name(mut self, product_name: impl Into<String>) -> Self {
        self.product_name = Some(product_name.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// In-memory evaluation, used by backends that cannot push the filter down.
    pub fn matches(&self, job: &Job) -> bool {
        if self.pod.as_ref().is_some_and(|p| *p != job.pod) {
            return false;
        }
        if self
            .association_key
            .as_ref()
            .is_some_and(|k| *k != job.association_key)
        {
            return false;
        }
        if self
            .product_name
            .as_ref()
            .is_some_and(|n| *n != job.product.product_name)
        {
            return false;
        }
        if self.message_id.is_some_and(|id| !job.has_message(id)) {
            return false;
        }
        if let Some(ref task_table) = self.task_table {
            match job.generation(task_table) {
                Some(generation) => {
                    if self.exclude_state == Some(generation.state) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// Persistence of jobs and their generations.
#[async_trait]
pub trait JobCatalog: Send + Sync {
    /// Jobs matching the filter. With a task table, ordered by that generation's
    /// last update ascending, otherwise by job last update.
    async fn search(&self, filter: &JobFilter) -> Result<Vec<Job>, CatalogError>;

    async fn get(&self, id: i64) -> Result<Option<Job>, CatalogError>;

    async fn create(&self, job: NewJob) -> Result<Job, CatalogError>;

    /// Apply the fields set on `patch`, see [`JobPatch`] for the merge rules.
    /// Existing generations are only changed through
    /// [`JobCatalog::patch_generation_state`].
    async fn patch(&self, id: i64, patch: &JobPatch) -> Result<Job, CatalogError>;

    /// Compare-and-set update of one generation. Returns the authoritative job.
    async fn patch_generation_state(
        &self,
        id: i64,
        task_table: &str,
        update: &GenerationUpdate,
    ) -> Result<Job, CatalogError>;
}

/// Apply a generation update to `job` in place.
///
/// `state_since` moves only when the state value changes, `version` always increments
/// and the job terminates once every generation is sent.
pub fn apply_generation_update(
    job: &mut Job,
    task_table: &str,
    update: &GenerationUpdate,
    now: DateTime<Utc>,
) -> Result<(), CatalogError> {
    let job_id = job.id;
    let generation = job
        .generations
        .iter_mut()
        .find(|g| g.task_table == task_table)
        .ok_or_else(|| CatalogError::GenerationNotFound {
            job_id,
            task_table: task_table.to_string(),
        })?;

    if generation.version != update.expected_version {
        return Err(CatalogError::VersionConflict {
            job_id,
            task_table: task_table.to_string(),
            expected: update.expected_version,
            actual: generation.version,
        });
    }

    if generation.state != update.state {
        generation.state = update.state;
        generation.state_since = now;
    }
    if update.failed {
        generation.nb_errors += 1;
    }
    if update.correlation_id.is_some() {
        generation.correlation_id = update.correlation_id;
    }
    generation.last_update = now;
    generation.version += 1;

    job.last_update = now;
    if job.all_sent() {
        job.state = JobState::Terminated;
    }
    Ok(())
}

/// Merge a field-scoped patch into the stored job following [`JobPatch`] rules.
pub fn apply_job_patch(stored: &mut Job, patch: &JobPatch, now: DateTime<Utc>) {
    if let Some(ref product) = patch.product {
        let (start, stop) = (stored.product.start_time, stored.product.stop_time);
        stored.product = product.clone();
        stored.product.widen(start, stop);
    }
    for message in &patch.messages {
        if !stored.has_message(message.id) {
            stored.messages.push(message.clone());
        }
    }
    for set in &patch.inputs {
        match stored.inputs.iter_mut().find(|s| s.task_table == set.task_table) {
            Some(existing) => existing.absorb(set.clone()),
            None => stored.inputs.push(set.clone()),
        }
    }
    for generation in &patch.generations {
        if stored.generation(&generation.task_table).is_none() {
            stored.generations.push(generation.clone());
        }
    }
    if stored.state == JobState::Terminated && !stored.all_sent() {
        stored.state = JobState::Generating;
    }
    stored.last_update = now;
}
