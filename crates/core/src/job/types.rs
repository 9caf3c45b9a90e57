//! Job aggregate and its per-task-table generation records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::SearchMetadata;
use crate::tasktable::FileNameType;

/// Generation state for one (job, task table) pair.
///
/// State transitions:
/// ```text
/// Initial ──▶ PrimaryCheck ──▶ Ready ──▶ Sent
///    ▲             │    ▲          │
///    └─(failed)────┘    └─(failed)─┘   (failed actions re-persist the source state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationState {
    Initial,
    PrimaryCheck,
    Ready,
    Sent,
}

impl GenerationState {
    /// Wire name as stored in the catalog.
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Initial => "INITIAL",
            GenerationState::PrimaryCheck => "PRIMARY_CHECK",
            GenerationState::Ready => "READY",
            GenerationState::Sent => "SENT",
        }
    }

    /// The state reached when the stage action for this state succeeds.
    pub fn next(&self) -> Option<GenerationState> {
        match self {
            GenerationState::Initial => Some(GenerationState::PrimaryCheck),
            GenerationState::PrimaryCheck => Some(GenerationState::Ready),
            GenerationState::Ready => Some(GenerationState::Sent),
            GenerationState::Sent => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationState::Sent)
    }
}

impl std::fmt::Display for GenerationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for GenerationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIAL" => Ok(GenerationState::Initial),
            "PRIMARY_CHECK" => Ok(GenerationState::PrimaryCheck),
            "READY" => Ok(GenerationState::Ready),
            "SENT" => Ok(GenerationState::Sent),
            other => Err(format!("unknown generation state: {}", other)),
        }
    }
}

/// One state machine instance scoped to a job and a task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub task_table: String,
    pub state: GenerationState,
    pub creation_date: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// When `state` last changed value. Re-persisting the same state keeps it.
    pub state_since: DateTime<Utc>,
    #[serde(default)]
    pub nb_errors: u32,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Compare-and-set token, bumped by the catalog on every state update.
    #[serde(default)]
    pub version: u64,
}

impl Generation {
    /// Fresh generation in `INITIAL`.
    pub fn initial(task_table: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_table: task_table.into(),
            state: GenerationState::Initial,
            creation_date: now,
            last_update: now,
            state_since: now,
            nb_errors: 0,
            correlation_id: None,
            version: 0,
        }
    }
}

/// Overall job lifecycle as tracked by the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    #[default]
    Generating,
    Terminated,
}

/// Timestamp format used in resolved file intervals and job orders.
pub const JOB_ORDER_DATE_FORMAT: &str = "%Y%m%d_%H%M%S%6f";

pub fn format_job_order_date(date: &DateTime<Utc>) -> String {
    date.format(JOB_ORDER_DATE_FORMAT).to_string()
}

/// A file chosen to satisfy an input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFile {
    pub name: String,
    pub key_object_storage: String,
    pub start: String,
    pub stop: String,
}

/// Materialized answer for one task table input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedInput {
    /// Logical reference name of the task table input.
    pub reference: String,
    pub file_type: String,
    pub file_name_type: FileNameType,
    pub family: String,
    pub mandatory: bool,
    pub has_result: bool,
    /// Optional input dropped after its waiting time elapsed.
    #[serde(default)]
    pub timed_out: bool,
    /// Produced by an earlier task over the job window, nothing to download.
    #[serde(default)]
    pub time_derived: bool,
    #[serde(default)]
    pub files: Vec<ResolvedFile>,
}

impl ResolvedInput {
    /// Placeholder for an input that has not been found yet.
    pub fn pending(reference: impl Into<String>, mandatory: bool) -> Self {
        Self {
            reference: reference.into(),
            file_type: String::new(),
            file_name_type: FileNameType::Blank,
            family: String::new(),
            mandatory,
            has_result: false,
            timed_out: false,
            time_derived: false,
            files: Vec::new(),
        }
    }

    /// Copy of `self` filed under another logical name.
    pub fn referenced_as(&self, reference: impl Into<String>, mandatory: bool) -> Self {
        Self {
            reference: reference.into(),
            mandatory,
            ..self.clone()
        }
    }
}

/// Inputs and the memoized query results of one task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResolvedInputSet {
    pub task_table: String,
    #[serde(default)]
    pub inputs: Vec<ResolvedInput>,
    /// Non-empty metadata results keyed by query deduplication key.
    #[serde(default)]
    pub queries: BTreeMap<String, Vec<SearchMetadata>>,
}

impl ResolvedInputSet {
    pub fn new(task_table: impl Into<String>, inputs: Vec<ResolvedInput>) -> Self {
        Self {
            task_table: task_table.into(),
            inputs,
            queries: BTreeMap::new(),
        }
    }

    pub fn input(&self, reference: &str) -> Option<&ResolvedInput> {
        self.inputs.iter().find(|i| i.reference == reference)
    }

    /// Inputs still waiting for a result.
    pub fn missing(&self) -> impl Iterator<Item = &ResolvedInput> {
        self.inputs.iter().filter(|i| !i.has_result)
    }

    /// Overwrite inputs by reference name, keeping the others in place.
    pub fn merge(&mut self, resolved: Vec<ResolvedInput>) {
        let mut by_reference: BTreeMap<String, ResolvedInput> = resolved
            .into_iter()
            .map(|input| (input.reference.clone(), input))
            .collect();

        for input in self.inputs.iter_mut() {
            if let Some(update) = by_reference.remove(&input.reference) {
                *input = update;
            }
        }
    }

    /// Fold a newer copy of the same set in: inputs overwrite by reference name,
    /// unknown ones are appended, memoized queries are added.
    pub fn absorb(&mut self, newer: ResolvedInputSet) {
        for input in newer.inputs {
            match self.inputs.iter_mut().find(|i| i.reference == input.reference) {
                Some(existing) => *existing = input,
                None => self.inputs.push(input),
            }
        }
        self.queries.extend(newer.queries);
    }
}

/// Product descriptor of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProduct {
    pub product_name: String,
    pub product_type: String,
    pub family: String,
    pub key_object_storage: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub satellite_id: String,
    pub mission_id: String,
    #[serde(default)]
    pub acquisition: Option<String>,
    #[serde(default)]
    pub process_mode: Option<String>,
    #[serde(default)]
    pub instrument_config_id: Option<i32>,
    #[serde(default)]
    pub polarisation: Option<String>,
    #[serde(default)]
    pub timeliness: Option<String>,
    /// Files found by the product type pre-check.
    #[serde(default)]
    pub primary_files: Vec<ResolvedFile>,
    #[serde(default)]
    pub station_code: Option<String>,
    /// Raw files of a session, by channel number.
    #[serde(default)]
    pub channel_raws: BTreeMap<u8, Vec<ResolvedFile>>,
}

impl JobProduct {
    /// Extend the time window so it includes `[start, stop]`.
    pub fn widen(&mut self, start: DateTime<Utc>, stop: DateTime<Utc>) {
        self.start_time = self.start_time.min(start);
        self.stop_time = self.stop_time.max(stop);
    }
}

/// Upstream catalog event carried by the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEvent {
    pub product_name: String,
    pub product_type: String,
    pub product_family: String,
    pub key_object_storage: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CatalogEvent {
    /// String metadata value, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// A triggering upstream message stored on the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEventMessage {
    pub id: u64,
    pub input_key: String,
    pub body: CatalogEvent,
}

/// The production unit tracked by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub pod: String,
    pub level: String,
    pub association_key: String,
    #[serde(default)]
    pub state: JobState,
    pub product: JobProduct,
    #[serde(default)]
    pub messages: Vec<CatalogEventMessage>,
    #[serde(default)]
    pub generations: Vec<Generation>,
    #[serde(default)]
    pub inputs: Vec<ResolvedInputSet>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}

impl Job {
    /// True once every generation reached `SENT`.
    pub fn all_sent(&self) -> bool {
        !self.generations.is_empty() && self.generations.iter().all(|g| g.state.is_terminal())
    }

    pub fn generation(&self, task_table: &str) -> Option<&Generation> {
        self.generations.iter().find(|g| g.task_table == task_table)
    }

    pub fn inputs_for(&self, task_table: &str) -> Option<&ResolvedInputSet> {
        self.inputs.iter().find(|s| s.task_table == task_table)
    }

    /// Input set for the task table, created empty when absent.
    pub fn inputs_for_mut(&mut self, task_table: &str) -> &mut ResolvedInputSet {
        let pos = match self.inputs.iter().position(|s| s.task_table == task_table) {
            Some(pos) => pos,
            None => {
                self.inputs.push(ResolvedInputSet::new(task_table, Vec::new()));
                self.inputs.len() - 1
            }
        };
        &mut self.inputs[pos]
    }

    pub fn has_message(&self, message_id: u64) -> bool {
        self.messages.iter().any(|m| m.id == message_id)
    }
}

/// Everything needed to create a job in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub pod: String,
    pub level: String,
    pub association_key: String,
    pub product: JobProduct,
    pub messages: Vec<CatalogEventMessage>,
    pub generations: Vec<Generation>,
    pub inputs: Vec<ResolvedInputSet>,
}

/// Field-scoped change to a stored job.
///
/// Only the fields set on the patch are touched, so writers working on different
/// parts of a job never undo each other:
/// - `product` replaces the descriptor, but the stored time window only widens
/// - `messages` are appended unless one with the same id is stored
/// - `inputs` are absorbed into the stored set of the same task table
/// - `generations` are added when the job has none for their task table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<JobProduct>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<CatalogEventMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ResolvedInputSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generations: Vec<Generation>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(mut self, product: JobProduct) -> Self {
        self.product = Some(product);
        self
    }

    pub fn append_message(mut self, message: CatalogEventMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_inputs(mut self, set: ResolvedInputSet) -> Self {
        self.inputs.push(set);
        self
    }

    pub fn add_generation(mut self, generation: Generation) -> Self {
        self.generations.push(generation);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.product.is_none()
            && self.messages.is_empty()
            && self.inputs.is_empty()
            && self.generations.is_empty()
    }
}

/// Compare-and-set request for a generation's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationUpdate {
    pub expected_version: u64,
    pub state: GenerationState,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Count this update as a failed attempt.
    #[serde(default)]
    pub failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(reference: &str, has_result: bool) -> ResolvedInput {
        ResolvedInput {
            has_result,
            ..ResolvedInput::pending(reference, true)
        }
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(GenerationState::PrimaryCheck.as_str(), "PRIMARY_CHECK");
        let json = serde_json::to_string(&GenerationState::PrimaryCheck).unwrap();
        assert_eq!(json, "\"PRIMARY_CHECK\"");
        assert_eq!(
            "READY".parse::<GenerationState>().unwrap(),
            GenerationState::Ready
        );
        assert!("DONE".parse::<GenerationState>().is_err());
    }

    #[test]
    fn test_job_order_date_format() {
        use chrono::TimeZone;
        let date = Utc.with_ymd_and_hms(2024, 5, 2, 7, 8, 9).unwrap()
            + chrono::Duration::microseconds(1234);
        assert_eq!(format_job_order_date(&date), "20240502_070809001234");
    }

    #[test]
    fn test_state_next() {
        assert_eq!(
            GenerationState::Initial.next(),
            Some(GenerationState::PrimaryCheck)
        );
        assert_eq!(GenerationState::Ready.next(), Some(GenerationState::Sent));
        assert_eq!(GenerationState::Sent.next(), None);
        assert!(GenerationState::Sent.is_terminal());
    }

    #[test]
    fn test_merge_overwrites_by_reference_and_keeps_others() {
        let mut set = ResolvedInputSet::new(
            "TaskTable.L0ASP.xml",
            vec![input("a", false), input("b", false), input("c", true)],
        );
        set.merge(vec![input("b", true), input("unknown", true)]);

        assert_eq!(set.inputs.len(), 3);
        assert!(!set.input("a").unwrap().has_result);
        assert!(set.input("b").unwrap().has_result);
        assert!(set.input("c").unwrap().has_result);
        assert!(set.input("unknown").is_none());
        assert_eq!(set.missing().count(), 1);
    }

    #[test]
    fn test_absorb_keeps_stored_only_entries() {
        let mut stored = ResolvedInputSet::new("A.xml", vec![input("a", true), input("b", false)]);
        stored.queries.insert("q1".to_string(), vec![]);

        let mut newer = ResolvedInputSet::new("A.xml", vec![input("b", true), input("c", true)]);
        newer.queries.insert("q2".to_string(), vec![]);
        stored.absorb(newer);

        assert_eq!(stored.inputs.len(), 3);
        assert!(stored.input("a").unwrap().has_result);
        assert!(stored.input("b").unwrap().has_result);
        assert!(stored.input("c").is_some());
        assert_eq!(stored.queries.len(), 2);
    }

    #[test]
    fn test_empty_patch_serializes_to_empty_object() {
        let patch = JobPatch::new();
        assert!(patch.is_empty());
        assert_eq!(serde_json::to_string(&patch).unwrap(), "{}");
    }

    #[test]
    fn test_referenced_as_keeps_files() {
        let mut source = input("x", true);
        source.files.push(ResolvedFile {
            name: "S1A_AUX_CAL".to_string(),
            key_object_storage: "S1A_AUX_CAL".to_string(),
            start: "20240101_000000000000".to_string(),
            stop: "20240102_000000000000".to_string(),
        });
        let copy = source.referenced_as("y", false);
        assert_eq!(copy.reference, "y");
        assert!(!copy.mandatory);
        assert_eq!(copy.files, source.files);
    }
}
