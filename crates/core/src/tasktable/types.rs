//! Task table document types.

use serde::{Deserialize, Serialize};

/// Where an input alternative comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    /// Searched in the metadata catalog.
    Db,
    /// Derived from the job time window, produced by an earlier task.
    Proc,
}

/// Applicability of an input for a product mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputMode {
    #[default]
    Always,
    Slicing,
    NonSlicing,
    Blank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileNameType {
    Physical,
    Directory,
    Regexp,
    #[default]
    Blank,
}

impl FileNameType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileNameType::Physical => "Physical",
            FileNameType::Directory => "Directory",
            FileNameType::Regexp => "Regexp",
            FileNameType::Blank => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Destination {
    #[default]
    Db,
    Proc,
}

/// Product mode of the worker, matched against each input's mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductMode {
    Slicing,
    #[default]
    NonSlicing,
}

impl ProductMode {
    pub fn is_compatible_with(&self, mode: InputMode) -> bool {
        match mode {
            InputMode::Always | InputMode::Blank => true,
            InputMode::Slicing => *self == ProductMode::Slicing,
            InputMode::NonSlicing => *self == ProductMode::NonSlicing,
        }
    }
}

/// Order used for alternatives that do not declare one.
pub const DEFAULT_ALTERNATIVE_ORDER: u32 = 99;

/// One candidate way to satisfy an input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub order: Option<u32>,
    pub origin: Origin,
    #[serde(default = "default_retrieval_mode")]
    pub retrieval_mode: String,
    /// Seconds before the job start.
    #[serde(default)]
    pub delta_time0: f64,
    /// Seconds after the job stop.
    #[serde(default)]
    pub delta_time1: f64,
    pub file_type: String,
    #[serde(default)]
    pub file_name_type: FileNameType,
}

fn default_retrieval_mode() -> String {
    "ValCover".to_string()
}

impl Alternative {
    /// Declared order, or the lowest priority sentinel.
    pub fn effective_order(&self) -> u32 {
        self.order.unwrap_or(DEFAULT_ALTERNATIVE_ORDER)
    }

    /// Key shared by alternatives that request identical search parameters.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.retrieval_mode,
            self.delta_time0,
            self.delta_time1,
            self.file_type,
            self.file_name_type.as_str()
        )
    }
}

/// A declared input requirement of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(default)]
    pub id: Option<String>,
    /// Id of another input this one is satisfied by.
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub mode: InputMode,
    #[serde(default = "default_mandatory")]
    pub mandatory: bool,
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

fn default_mandatory() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub file_type: String,
    #[serde(default)]
    pub file_name_type: FileNameType,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub binary_path: String,
    #[serde(default)]
    pub inputs: Vec<Input>,
    #[serde(default)]
    pub outputs: Vec<Output>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// A processor's declarative definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTable {
    pub processor_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub pools: Vec<Pool>,
}

impl TaskTable {
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.pools.iter().flat_map(|p| p.tasks.iter())
    }
}
