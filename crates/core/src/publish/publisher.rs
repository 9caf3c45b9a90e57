use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::bus::MessageBus;
use crate::config::WorkerConfig;
use crate::job::{format_job_order_date, Generation, Job, ResolvedInputSet};
use crate::metrics::JOBS_PUBLISHED;
use crate::product::{primary_files_as_inputs, ProductTypeAdapter};
use crate::tasktable::{Destination, FileNameType, Output, TaskTableAdapter};

use super::types::{
    ExecutionInput, ExecutionJob, ExecutionOutput, ExecutionPool, ExecutionTask, JobOrder,
    JobOrderInput, JobOrderOutput, JobOrderProc, PublishError, JOB_ORDER_FAMILY,
};

/// Builds execution jobs from ready generations and publishes them on the bus.
pub struct Publisher {
    worker: WorkerConfig,
    bus: Arc<dyn MessageBus>,
    category: String,
    /// Seeded from the clock so a restart never reuses a work directory.
    counter: AtomicU64,
    /// Lays out primary inputs. Primary files under the product family when unset.
    product_adapter: Option<Arc<dyn ProductTypeAdapter>>,
}

impl Publisher {
    pub fn new(worker: WorkerConfig, bus: Arc<dyn MessageBus>, category: impl Into<String>) -> Self {
        let seed = Utc::now().timestamp_millis().max(0) as u64;
        Self {
            worker,
            bus,
            category: category.into(),
            counter: AtomicU64::new(seed),
            product_adapter: None,
        }
    }

    pub fn with_product_adapter(mut self, adapter: Arc<dyn ProductTypeAdapter>) -> Self {
        self.product_adapter = Some(adapter);
        self
    }

    /// Publish exactly one execution job for the generation.
    ///
    /// State advancement is left to the caller.
    pub async fn send(
        &self,
        job: &Job,
        generation: &Generation,
        task_table: &TaskTableAdapter,
    ) -> Result<ExecutionJob, PublishError> {
        let execution = self.build(job, generation, task_table)?;
        let body =
            serde_json::to_value(&execution).map_err(|e| PublishError::Encode(e.to_string()))?;

        self.bus.publish(&self.category, &body).await?;

        JOBS_PUBLISHED
            .with_label_values(&[execution.product_family.as_str()])
            .inc();
        info!(
            job_id = job.id,
            task_table = task_table.name(),
            "Published execution job {} with {} input(s) to {}",
            execution.job_order,
            execution.inputs.len(),
            self.category
        );
        Ok(execution)
    }

    /// Assemble the execution job without publishing it.
    pub fn build(
        &self,
        job: &Job,
        generation: &Generation,
        task_table: &TaskTableAdapter,
    ) -> Result<ExecutionJob, PublishError> {
        let inc = self.counter.fetch_add(1, Ordering::SeqCst);
        let work_directory = format!(
            "{}/{}/",
            self.worker.work_dir_root.trim_end_matches('/'),
            inc
        );
        let job_order_path = format!("{}JobOrder.{}.xml", work_directory, inc);
        let set = job.inputs_for(task_table.name());

        let job_order = self.job_order(job, task_table, set, &work_directory);
        let document = serde_json::to_string_pretty(&job_order)
            .map_err(|e| PublishError::Encode(e.to_string()))?;

        let mut inputs = Vec::new();
        let mut seen = HashSet::new();
        let mut add = |family: &str, relative_path: &str, content_ref: &str| {
            let local_path = format!("{}{}", work_directory, relative_path);
            if seen.insert(local_path.clone()) {
                inputs.push(ExecutionInput {
                    family: family.to_string(),
                    local_path,
                    content_ref: content_ref.to_string(),
                });
            }
        };

        let primaries = match &self.product_adapter {
            Some(adapter) => adapter.primary_inputs(&job.product),
            None => primary_files_as_inputs(&job.product),
        };
        for primary in &primaries {
            add(&primary.family, &primary.relative_path, &primary.key_object_storage);
        }
        for input in set.iter().flat_map(|s| s.inputs.iter()) {
            if !input.has_result || input.timed_out {
                continue;
            }
            for file in &input.files {
                add(&input.family, &file.name, &file.key_object_storage);
            }
        }
        inputs.push(ExecutionInput {
            family: JOB_ORDER_FAMILY.to_string(),
            local_path: job_order_path.clone(),
            content_ref: document,
        });
        debug!(job_id = job.id, "Execution job {} has {} input(s)", inc, inputs.len());

        let pools = task_table
            .table()
            .pools
            .iter()
            .map(|pool| ExecutionPool {
                tasks: pool
                    .tasks
                    .iter()
                    .map(|task| ExecutionTask {
                        name: task.name.clone(),
                        binary_path: task.binary_path.clone(),
                    })
                    .collect(),
            })
            .collect();

        Ok(ExecutionJob {
            id: inc,
            job_id: job.id,
            task_table: task_table.name().to_string(),
            product_family: self.worker.level.job_family().to_string(),
            product_name: job.product.product_name.clone(),
            key_object_storage: job.product.key_object_storage.clone(),
            process_mode: self
                .worker
                .process_mode
                .clone()
                .or_else(|| job.product.process_mode.clone()),
            timeliness: self
                .worker
                .timeliness
                .clone()
                .or_else(|| job.product.timeliness.clone()),
            work_directory,
            job_order: job_order_path,
            correlation_id: generation.correlation_id,
            inputs,
            outputs: self.outputs(task_table),
            pools,
        })
    }

    fn job_order(
        &self,
        job: &Job,
        task_table: &TaskTableAdapter,
        set: Option<&ResolvedInputSet>,
        work_directory: &str,
    ) -> JobOrder {
        let procs = task_table
            .tasks()
            .map(|task| {
                let inputs = task_table
                    .references_of_task(&task.name)
                    .filter_map(|reference| set.and_then(|s| s.input(reference)))
                    .filter(|input| input.has_result && !input.files.is_empty())
                    .map(|input| JobOrderInput {
                        file_type: input.file_type.clone(),
                        file_name_type: input.file_name_type,
                        file_names: input
                            .files
                            .iter()
                            .map(|f| format!("{}{}", work_directory, f.name))
                            .collect(),
                        intervals: input
                            .files
                            .iter()
                            .map(|f| (f.start.clone(), f.stop.clone()))
                            .collect(),
                    })
                    .collect();

                JobOrderProc {
                    task_name: task.name.clone(),
                    task_version: task.version.clone(),
                    inputs,
                    outputs: task
                        .outputs
                        .iter()
                        .map(|o| JobOrderOutput {
                            file_type: o.file_type.clone(),
                            file_name_type: o.file_name_type,
                            destination: o.destination,
                            mandatory: o.mandatory,
                        })
                        .collect(),
                }
            })
            .collect();

        JobOrder {
            processor_name: task_table.processor_name().to_string(),
            version: task_table.version().to_string(),
            sensing_start: format_job_order_date(&job.product.start_time),
            sensing_stop: format_job_order_date(&job.product.stop_time),
            processing_params: self.worker.processing_params.clone(),
            procs,
        }
    }

    fn outputs(&self, task_table: &TaskTableAdapter) -> Vec<ExecutionOutput> {
        let mut outputs: Vec<ExecutionOutput> = Vec::new();
        for output in task_table.tasks().flat_map(|t| t.outputs.iter()) {
            if output.destination != Destination::Db {
                continue;
            }
            let family = self.worker.output_family(&output.file_type).to_string();
            let regexp = self.output_regexp(output);
            if outputs.iter().any(|o| o.family == family && o.regexp == regexp) {
                continue;
            }
            outputs.push(ExecutionOutput {
                oqc_check: self.worker.oqc_families.contains(&family),
                family,
                regexp,
            });
        }
        outputs
    }

    fn output_regexp(&self, output: &Output) -> String {
        let file_type = &output.file_type;
        match output.file_name_type {
            FileNameType::Regexp => file_type.clone(),
            FileNameType::Directory => format!("{0}^.*{0}.*$", file_type),
            _ => self
                .worker
                .output_regexps
                .get(file_type)
                .cloned()
                .unwrap_or_else(|| format!("^.*{}.*$", file_type)),
        }
    }
}
