use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::bus::BusError;
use crate::tasktable::{Destination, FileNameType};

/// Family of the job order input.
pub const JOB_ORDER_FAMILY: &str = "JOB_ORDER";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode execution job: {0}")]
    Encode(String),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}

/// Input file of an execution job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInput {
    pub family: String,
    pub local_path: String,
    /// Object storage key, or the serialized document for the job order.
    pub content_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub family: String,
    pub regexp: String,
    pub oqc_check: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPool {
    pub tasks: Vec<ExecutionTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub name: String,
    pub binary_path: String,
}

/// Message published on the bus once a generation is ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionJob {
    /// Per-process counter, also naming the work directory.
    pub id: u64,
    pub job_id: i64,
    pub task_table: String,
    pub product_family: String,
    pub product_name: String,
    pub key_object_storage: String,
    #[serde(default)]
    pub process_mode: Option<String>,
    #[serde(default)]
    pub timeliness: Option<String>,
    pub work_directory: String,
    pub job_order: String,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    pub inputs: Vec<ExecutionInput>,
    pub outputs: Vec<ExecutionOutput>,
    pub pools: Vec<ExecutionPool>,
}

impl ExecutionJob {
    pub fn inputs_of_family<'a>(
        &'a self,
        family: &'a str,
    ) -> impl Iterator<Item = &'a ExecutionInput> + 'a {
        self.inputs.iter().filter(move |i| i.family == family)
    }
}

/// Processor instructions written into the work directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOrder {
    pub processor_name: String,
    pub version: String,
    pub sensing_start: String,
    pub sensing_stop: String,
    #[serde(default)]
    pub processing_params: BTreeMap<String, String>,
    pub procs: Vec<JobOrderProc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOrderProc {
    pub task_name: String,
    pub task_version: String,
    pub inputs: Vec<JobOrderInput>,
    pub outputs: Vec<JobOrderOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOrderInput {
    pub file_type: String,
    pub file_name_type: FileNameType,
    pub file_names: Vec<String>,
    /// Validity intervals, parallel to `file_names`.
    pub intervals: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOrderOutput {
    pub file_type: String,
    pub file_name_type: FileNameType,
    pub destination: Destination,
    pub mandatory: bool,
}
