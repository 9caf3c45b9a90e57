pub mod bus;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod generator;
pub mod job;
pub mod metadata;
pub mod metrics;
pub mod product;
pub mod publish;
pub mod resolver;
pub mod retry;
pub mod tasktable;
pub mod testing;

pub use bus::{Ack, AckOutcome, BusError, BusMessage, HttpBusClient, HttpBusConfig, MessageBus};
pub use catalog::{
    CatalogError, HttpCatalogClient, HttpCatalogConfig, JobCatalog, JobFilter, SqliteJobCatalog,
};
pub use config::{
    load_config, load_config_from_str, validate_config, validate_task_tables, CatalogBackend,
    Config, ConfigError, Level, ProductAdapterKind, SanitizedConfig,
};
pub use dispatch::{
    create_error_repository, DispatchError, DispatcherSettings, ErrorReportHandle, EventConsumer,
    JobDispatcher,
};
pub use generator::{
    GeneratorContext, GeneratorError, GeneratorPool, GeneratorStatus, JobGenerator, PoolStatus,
    TickOutcome,
};
pub use job::{Generation, GenerationState, Job, JobState, NewJob};
pub use metadata::{HttpMetadataClient, MetadataClient, MetadataConfig, MetadataError};
pub use product::{
    EdrsSessionAdapter, L0SegmentAdapter, LevelProductAdapter, PrimaryCheckError, PrimaryInput,
    ProductTypeAdapter,
};
pub use publish::{ExecutionJob, PublishError, Publisher};
pub use resolver::{Families, InputResolver, InputTimeoutChecker, Resolution, ResolveError};
pub use retry::RetryPolicy;
pub use tasktable::{load_task_tables, ProductMode, TaskTableAdapter, TaskTableError};
