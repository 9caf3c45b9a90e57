use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::bus::HttpBusConfig;
use crate::catalog::HttpCatalogConfig;
use crate::metadata::MetadataConfig;
use crate::retry::RetryPolicy;
use crate::tasktable::ProductMode;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    /// Waiting times for optional inputs, first match wins.
    #[serde(default)]
    pub input_waiting: Vec<InputWaitingConfig>,
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub metadata: MetadataConfig,
    pub bus: BusConfig,
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,
    /// Product type to task tables routing, first match wins.
    #[serde(default)]
    pub routing: Vec<RoutingRule>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Processing level handled by this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Level {
    L0,
    L0Segment,
    L1,
    L2,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::L0 => "L0",
            Level::L0Segment => "L0_SEGMENT",
            Level::L1 => "L1",
            Level::L2 => "L2",
        }
    }

    /// Family of the execution jobs published for this level.
    pub fn job_family(&self) -> &'static str {
        match self {
            Level::L0 => "L0_JOB",
            Level::L0Segment => "L0_SEGMENT_JOB",
            Level::L1 => "L1_JOB",
            Level::L2 => "L2_JOB",
        }
    }
}

/// Product type pre-check used by the generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProductAdapterKind {
    #[default]
    LevelProduct,
    L0Segment,
    EdrsSession,
}

/// Worker identity and job building settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Pod tag written on created jobs.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    pub level: Level,
    #[serde(default)]
    pub product_mode: ProductMode,
    pub tasktable_dir: PathBuf,
    #[serde(default)]
    pub product_type_adapter: ProductAdapterKind,
    #[serde(default = "default_work_dir_root")]
    pub work_dir_root: String,
    #[serde(default = "default_family")]
    pub default_family: String,
    /// File type to family for resolved inputs.
    #[serde(default)]
    pub input_families: BTreeMap<String, String>,
    /// Task table file type to catalog product type. Also names time-derived inputs.
    #[serde(default)]
    pub type_meta: BTreeMap<String, String>,
    /// File type to family for declared outputs.
    #[serde(default)]
    pub output_families: BTreeMap<String, String>,
    /// File type to file name regexp for declared outputs.
    #[serde(default)]
    pub output_regexps: BTreeMap<String, String>,
    /// Output families requiring a quality check.
    #[serde(default)]
    pub oqc_families: Vec<String>,
    #[serde(default)]
    pub process_mode: Option<String>,
    #[serde(default)]
    pub timeliness: Option<String>,
    /// Extra processing parameters copied into every job order.
    #[serde(default)]
    pub processing_params: BTreeMap<String, String>,
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_work_dir_root() -> String {
    "/data/localWD".to_string()
}

fn default_family() -> String {
    "BLANK".to_string()
}

impl WorkerConfig {
    /// Family of a file type, falling back to the default family.
    pub fn input_family(&self, file_type: &str) -> &str {
        self.input_families
            .get(file_type)
            .map(String::as_str)
            .unwrap_or(&self.default_family)
    }

    pub fn output_family(&self, file_type: &str) -> &str {
        self.output_families
            .get(file_type)
            .map(String::as_str)
            .unwrap_or(&self.default_family)
    }
}

/// Generator scheduling settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GeneratorConfig {
    /// Delay between two ticks of a generator.
    #[serde(default = "default_fixed_delay")]
    pub fixed_delay_ms: u64,
    /// Dwell time in INITIAL before the primary check is retried.
    #[serde(default = "default_wait")]
    pub wait_primary_check_ms: u64,
    /// Dwell time in PRIMARY_CHECK before inputs are searched again.
    #[serde(default = "default_wait")]
    pub wait_metadata_input_ms: u64,
    /// Jobs scanned per tick.
    #[serde(default = "default_max_jobs")]
    pub max_jobs_per_tick: i64,
    /// Primary search waiting time, 0 waits forever.
    #[serde(default)]
    pub primary_search_timeout_secs: u64,
}

fn default_fixed_delay() -> u64 {
    500
}

fn default_wait() -> u64 {
    60_000
}

fn default_max_jobs() -> i64 {
    100
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            fixed_delay_ms: default_fixed_delay(),
            wait_primary_check_ms: default_wait(),
            wait_metadata_input_ms: default_wait(),
            max_jobs_per_tick: default_max_jobs(),
            primary_search_timeout_secs: 0,
        }
    }
}

/// How long an optional input is waited for.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct InputWaitingConfig {
    pub processor_name_regexp: String,
    pub processor_version_regexp: String,
    pub input_id_regexp: String,
    pub waiting_time_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CatalogBackend {
    Http,
    #[default]
    Sqlite,
}

/// Job catalog configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub backend: CatalogBackend,
    /// Required for the http backend.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backend: CatalogBackend::default(),
            url: None,
            path: default_db_path(),
            timeout_secs: default_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("jobgen.db")
}

fn default_timeout() -> u64 {
    30
}

impl CatalogConfig {
    pub fn http(&self) -> Option<HttpCatalogConfig> {
        self.url.as_ref().map(|url| HttpCatalogConfig {
            url: url.clone(),
            timeout_secs: self.timeout_secs,
            retry: self.retry.clone(),
        })
    }
}

/// Message bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Category execution jobs are published to.
    #[serde(default = "default_output_category")]
    pub output_category: String,
    #[serde(default = "default_error_category")]
    pub error_category: String,
}

fn default_output_category() -> String {
    "level_jobs".to_string()
}

fn default_error_category() -> String {
    "errors".to_string()
}

impl BusConfig {
    pub fn http(&self) -> HttpBusConfig {
        HttpBusConfig {
            url: self.url.clone(),
            timeout_secs: self.timeout_secs,
            retry: self.retry.clone(),
        }
    }
}

/// One upstream poll loop
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConsumerConfig {
    pub category: String,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default)]
    pub filter: ConsumerFilterConfig,
}

fn default_polling_interval() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Default)]
pub struct ConsumerFilterConfig {
    #[serde(default)]
    pub product_family: Option<String>,
    /// Regex matched against the event's object storage key.
    #[serde(default)]
    pub match_regex: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RoutingRule {
    /// Regex matched against the product type.
    pub product_type: String,
    pub task_tables: Vec<String>,
}

/// Sanitized config for API responses (credentials stripped from URLs)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub worker: SanitizedWorkerConfig,
    pub generator: GeneratorConfig,
    pub input_waiting: Vec<InputWaitingConfig>,
    pub catalog: SanitizedCatalogConfig,
    pub metadata_url: String,
    pub bus_url: String,
    pub output_category: String,
    pub error_category: String,
    pub consumers: Vec<ConsumerConfig>,
    pub routing: Vec<RoutingRule>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedWorkerConfig {
    pub hostname: String,
    pub level: Level,
    pub product_mode: ProductMode,
    pub tasktable_dir: PathBuf,
    pub product_type_adapter: ProductAdapterKind,
    pub work_dir_root: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SanitizedCatalogConfig {
    pub backend: CatalogBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Drop `user:password@` from a URL.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            worker: SanitizedWorkerConfig {
                hostname: config.worker.hostname.clone(),
                level: config.worker.level,
                product_mode: config.worker.product_mode,
                tasktable_dir: config.worker.tasktable_dir.clone(),
                product_type_adapter: config.worker.product_type_adapter,
                work_dir_root: config.worker.work_dir_root.clone(),
            },
            generator: config.generator.clone(),
            input_waiting: config.input_waiting.clone(),
            catalog: SanitizedCatalogConfig {
                backend: config.catalog.backend,
                url: config.catalog.url.as_deref().map(redact_url),
            },
            metadata_url: redact_url(&config.metadata.url),
            bus_url: redact_url(&config.bus.url),
            output_category: config.bus.output_category.clone(),
            error_category: config.bus.error_category.clone(),
            consumers: config.consumers.clone(),
            routing: config.routing.clone(),
        }
    }
}
