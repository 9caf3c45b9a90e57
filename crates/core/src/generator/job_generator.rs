use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::catalog::{CatalogError, JobCatalog, JobFilter};
use crate::config::GeneratorConfig;
use crate::job::{Generation, GenerationState, GenerationUpdate, Job, JobPatch, JobState};
use crate::metrics::{GENERATOR_TICKS, STAGE_DURATION, STAGE_ROLLBACKS, STAGE_TRANSITIONS};
use crate::product::{PrimaryCheckError, ProductTypeAdapter};
use crate::publish::{PublishError, Publisher};
use crate::resolver::{InputResolver, Resolution, ResolveError};
use crate::tasktable::{ProductMode, TaskTableAdapter};

use super::types::{GeneratorError, TickOutcome};

/// Collaborators shared by every generator of a worker.
#[derive(Clone)]
pub struct GeneratorContext {
    /// Only jobs tagged with this pod are generated.
    pub pod: String,
    pub mode: ProductMode,
    pub config: GeneratorConfig,
    pub catalog: Arc<dyn JobCatalog>,
    pub product_adapter: Arc<dyn ProductTypeAdapter>,
    pub resolver: Arc<InputResolver>,
    pub publisher: Arc<Publisher>,
}

/// Why a stage action did not succeed.
#[derive(Debug, Error)]
enum StageError {
    #[error("primary check failed: {0}")]
    PrimaryCheck(#[from] PrimaryCheckError),

    #[error("inputs missing: {}", .0.join(", "))]
    Incomplete(Vec<String>),

    #[error("input resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),
}

/// Advances the generations of one task table, one job per tick.
pub struct JobGenerator {
    task_table: Arc<TaskTableAdapter>,
    ctx: GeneratorContext,
}

impl JobGenerator {
    pub fn new(task_table: Arc<TaskTableAdapter>, ctx: GeneratorContext) -> Self {
        Self { task_table, ctx }
    }

    pub fn task_table(&self) -> &str {
        self.task_table.name()
    }

    pub async fn tick(&self) -> Result<TickOutcome, GeneratorError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as if the clock read `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickOutcome, GeneratorError> {
        let result = self.run_tick(now).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        GENERATOR_TICKS
            .with_label_values(&[self.task_table(), label])
            .inc();
        result
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, GeneratorError> {
        let filter = JobFilter::pending(&self.ctx.pod, self.task_table())
            .with_limit(self.ctx.config.max_jobs_per_tick);
        let jobs = self.ctx.catalog.search(&filter).await?;

        let due = jobs.into_iter().find_map(|job| {
            let generation = job.generation(self.task_table())?.clone();
            self.is_due(&generation, now).then_some((job, generation))
        });
        let Some((job, generation)) = due else {
            trace!(task_table = self.task_table(), "No generation due");
            return Ok(TickOutcome::Idle);
        };

        let correlation_id = generation.correlation_id.unwrap_or_else(Uuid::new_v4);
        let span = info_span!(
            "generation",
            job_id = job.id,
            task_table = self.task_table(),
            state = %generation.state,
            correlation_id = %correlation_id,
        );
        self.advance(job, generation, correlation_id, now)
            .instrument(span)
            .await
    }

    /// Dwell time per state since the generation's last update.
    fn is_due(&self, generation: &Generation, now: DateTime<Utc>) -> bool {
        let wait_ms = match generation.state {
            GenerationState::Initial => self.ctx.config.wait_primary_check_ms,
            GenerationState::PrimaryCheck => self.ctx.config.wait_metadata_input_ms,
            GenerationState::Ready => 0,
            GenerationState::Sent => return false,
        };
        now - generation.last_update >= Duration::milliseconds(wait_ms as i64)
    }

    async fn advance(
        &self,
        mut job: Job,
        generation: Generation,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome, GeneratorError> {
        let from = generation.state;
        let Some(to) = from.next() else {
            return Ok(TickOutcome::Idle);
        };
        debug!("Running stage action of {}", from);

        let timer = STAGE_DURATION
            .with_label_values(&[from.as_str()])
            .start_timer();
        let result = match from {
            GenerationState::Initial => self.primary_check(&mut job, &generation, now).await,
            GenerationState::PrimaryCheck => {
                self.search_inputs(&mut job, &generation, now).await
            }
            _ => self.prepare_and_send(&mut job, &generation, now).await,
        };
        timer.observe_duration();

        let (state, failure) = match result {
            Ok(()) => (to, None),
            Err(e) => {
                warn!(
                    job_id = job.id,
                    task_table = self.task_table(),
                    state = %from,
                    "Stage action failed: {}",
                    e
                );
                STAGE_ROLLBACKS
                    .with_label_values(&[self.task_table(), from.as_str()])
                    .inc();
                (from, Some(e.to_string()))
            }
        };

        let update = GenerationUpdate {
            expected_version: generation.version,
            state,
            correlation_id: Some(correlation_id),
            failed: failure.is_some(),
        };
        let updated = match self
            .ctx
            .catalog
            .patch_generation_state(job.id, self.task_table(), &update)
            .await
        {
            Ok(updated) => updated,
            Err(CatalogError::VersionConflict { actual, .. }) => {
                warn!(
                    job_id = job.id,
                    task_table = self.task_table(),
                    "Generation changed concurrently (version {} -> {}), skipping",
                    generation.version,
                    actual
                );
                return Ok(TickOutcome::Conflict { job_id: job.id });
            }
            Err(e) => return Err(e.into()),
        };

        match failure {
            None => {
                STAGE_TRANSITIONS
                    .with_label_values(&[from.as_str(), to.as_str()])
                    .inc();
                info!(
                    job_id = job.id,
                    task_table = self.task_table(),
                    "Generation {} -> {}",
                    from,
                    to
                );
                if updated.state == JobState::Terminated {
                    info!(job_id = job.id, "Every generation sent, job terminated");
                }
                Ok(TickOutcome::Advanced {
                    job_id: job.id,
                    from,
                    to,
                })
            }
            Some(reason) => Ok(TickOutcome::RolledBack {
                job_id: job.id,
                state: from,
                reason,
            }),
        }
    }

    /// INITIAL -> PRIMARY_CHECK
    async fn primary_check(
        &self,
        job: &mut Job,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Result<(), StageError> {
        info!(
            "Checking pre-requirements of {} with {}",
            job.product.product_name,
            self.ctx.product_adapter.name()
        );
        self.ctx
            .product_adapter
            .main_input_search(job, generation, now)
            .await?;
        let patch = JobPatch::new().with_product(job.product.clone());
        self.ctx.catalog.patch(job.id, &patch).await?;
        Ok(())
    }

    /// PRIMARY_CHECK -> READY
    async fn search_inputs(
        &self,
        job: &mut Job,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Result<(), StageError> {
        info!("Searching inputs of {}", job.product.product_name);
        self.resolve(job, generation, now).await
    }

    /// READY -> SENT
    async fn prepare_and_send(
        &self,
        job: &mut Job,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Result<(), StageError> {
        self.resolve(job, generation, now).await?;
        info!("Sending job of {}", job.product.product_name);
        let execution = self
            .ctx
            .publisher
            .send(job, generation, &self.task_table)
            .await?;
        debug!("Published as {}", execution.job_order);
        Ok(())
    }

    /// Resolve inputs and persist what was found, complete or not.
    async fn resolve(
        &self,
        job: &mut Job,
        generation: &Generation,
        now: DateTime<Utc>,
    ) -> Result<(), StageError> {
        let resolution = self
            .ctx
            .resolver
            .resolve(job, &self.task_table, self.ctx.mode, generation, now)
            .await;
        // Only this task table's set, other generations own theirs.
        if let Some(set) = job.inputs_for(self.task_table()).cloned() {
            self.ctx
                .catalog
                .patch(job.id, &JobPatch::new().with_inputs(set))
                .await?;
        }

        match resolution {
            Resolution::Complete => Ok(()),
            Resolution::Incomplete { missing } => Err(StageError::Incomplete(missing)),
            Resolution::Failed { cause } => Err(cause.into()),
        }
    }
}
