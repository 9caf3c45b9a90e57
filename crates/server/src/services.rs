//! Construction of the long-running engine services from configuration.
//!
//! Clients are built by the `connect_*` functions; [`build_services`] takes them as
//! trait objects so tests can hand in mocks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};

use jobgen_core::{
    config::CatalogConfig, create_error_repository, generator::GeneratorContext,
    load_task_tables, validate_task_tables, CatalogBackend, Config, DispatcherSettings,
    EdrsSessionAdapter, ErrorReportHandle, EventConsumer, Families, GeneratorPool, HttpBusClient,
    HttpCatalogClient, HttpMetadataClient, InputResolver, InputTimeoutChecker, JobCatalog,
    JobDispatcher, JobGenerator, L0SegmentAdapter, LevelProductAdapter, MessageBus,
    MetadataClient, ProductAdapterKind, ProductTypeAdapter, Publisher, SqliteJobCatalog,
    TaskTableAdapter,
};
use jobgen_core::dispatch::ErrorReportWriter;

/// Buffer size for the error report channel
pub const ERROR_BUFFER_SIZE: usize = 1000;

pub fn connect_catalog(config: &CatalogConfig) -> Result<Arc<dyn JobCatalog>> {
    match config.backend {
        CatalogBackend::Sqlite => {
            info!("Using sqlite job catalog at {:?}", config.path);
            let catalog = SqliteJobCatalog::new(&config.path)
                .with_context(|| format!("Failed to open job catalog {:?}", config.path))?;
            Ok(Arc::new(catalog))
        }
        CatalogBackend::Http => {
            let http = config
                .http()
                .context("catalog.url is required for the http backend")?;
            info!("Using job catalog service at {}", http.url);
            let client = HttpCatalogClient::new(http).context("Failed to create catalog client")?;
            Ok(Arc::new(client))
        }
    }
}

pub fn connect_metadata(config: &Config) -> Result<Arc<dyn MetadataClient>> {
    let client = HttpMetadataClient::new(config.metadata.clone())
        .context("Failed to create metadata client")?;
    Ok(Arc::new(client))
}

pub fn connect_bus(config: &Config) -> Result<Arc<dyn MessageBus>> {
    let client = HttpBusClient::new(config.bus.http()).context("Failed to create bus client")?;
    Ok(Arc::new(client))
}

/// Load the task tables of the worker and check the routing against them.
pub fn load_tables(config: &Config) -> Result<Vec<Arc<TaskTableAdapter>>> {
    let dir = &config.worker.tasktable_dir;
    let tables = load_task_tables(dir)
        .with_context(|| format!("Failed to load task tables from {:?}", dir))?;
    validate_task_tables(config, tables.keys().map(String::as_str))
        .context("Task table validation failed")?;

    for name in tables.keys() {
        info!("Loaded task table {}", name);
    }
    Ok(tables.into_values().map(Arc::new).collect())
}

fn product_adapter(
    config: &Config,
    metadata: Arc<dyn MetadataClient>,
    families: Families,
) -> Arc<dyn ProductTypeAdapter> {
    match config.worker.product_type_adapter {
        ProductAdapterKind::LevelProduct => Arc::new(LevelProductAdapter::new()),
        ProductAdapterKind::L0Segment => Arc::new(L0SegmentAdapter::new(
            metadata,
            families,
            config.generator.primary_search_timeout_secs,
        )),
        ProductAdapterKind::EdrsSession => Arc::new(EdrsSessionAdapter::new(
            metadata,
            config.generator.primary_search_timeout_secs,
        )),
    }
}

/// Generator pool, upstream consumers and the error repository of one worker.
pub struct Services {
    pub catalog: Arc<dyn JobCatalog>,
    pub pool: Arc<GeneratorPool>,
    pub consumers: Vec<Arc<EventConsumer>>,
    errors: ErrorReportHandle,
    error_writer: Option<ErrorReportWriter>,
    handles: Vec<JoinHandle<()>>,
}

/// Wire generators, dispatcher and consumers around the given clients.
pub fn build_services(
    config: &Config,
    catalog: Arc<dyn JobCatalog>,
    metadata: Arc<dyn MetadataClient>,
    bus: Arc<dyn MessageBus>,
    task_tables: Vec<Arc<TaskTableAdapter>>,
) -> Result<Services> {
    let worker = &config.worker;
    let families = Families::new(worker.default_family.clone(), worker.input_families.clone())
        .with_type_meta(worker.type_meta.clone());
    let adapter = product_adapter(config, Arc::clone(&metadata), families.clone());

    let timeouts = InputTimeoutChecker::new(&config.input_waiting)
        .context("Invalid input waiting rules")?;
    let resolver = Arc::new(InputResolver::new(metadata, families, timeouts));
    let publisher = Arc::new(
        Publisher::new(
            worker.clone(),
            Arc::clone(&bus),
            config.bus.output_category.clone(),
        )
        .with_product_adapter(Arc::clone(&adapter)),
    );

    let context = GeneratorContext {
        pod: worker.hostname.clone(),
        mode: worker.product_mode,
        config: config.generator.clone(),
        catalog: Arc::clone(&catalog),
        product_adapter: Arc::clone(&adapter),
        resolver,
        publisher,
    };
    let generators = task_tables
        .iter()
        .map(|tt| JobGenerator::new(Arc::clone(tt), context.clone()))
        .collect();
    let pool = Arc::new(GeneratorPool::new(
        generators,
        Duration::from_millis(config.generator.fixed_delay_ms),
    ));

    let dispatcher = Arc::new(
        JobDispatcher::new(
            DispatcherSettings {
                pod: worker.hostname.clone(),
                level: worker.level,
                mode: worker.product_mode,
            },
            &config.routing,
            task_tables,
            Arc::clone(&catalog),
            adapter,
        )
        .context("Failed to create job dispatcher")?,
    );

    let (errors, error_writer) = create_error_repository(
        Arc::clone(&bus),
        config.bus.error_category.clone(),
        worker.hostname.clone(),
        ERROR_BUFFER_SIZE,
    );

    let consumers = config
        .consumers
        .iter()
        .map(|consumer| {
            EventConsumer::new(
                consumer.clone(),
                Arc::clone(&bus),
                dispatcher.clone(),
                errors.clone(),
            )
            .map(Arc::new)
            .with_context(|| format!("Invalid consumer for {}", consumer.category))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Services {
        catalog,
        pool,
        consumers,
        errors,
        error_writer: Some(error_writer),
        handles: Vec::new(),
    })
}

impl Services {
    /// Spawn the error writer, the generator loops and one task per consumer.
    pub async fn start(&mut self) {
        if let Some(writer) = self.error_writer.take() {
            self.handles.push(tokio::spawn(writer.run()));
        }

        self.pool.start().await;

        for consumer in &self.consumers {
            let consumer = Arc::clone(consumer);
            self.handles.push(tokio::spawn(async move { consumer.run().await }));
        }
        info!("Started {} consumer(s)", self.consumers.len());
    }

    /// Stop consumers first, then generators, then flush pending error reports.
    pub async fn shutdown(self) {
        let Services {
            pool,
            consumers,
            errors,
            handles,
            ..
        } = self;

        for consumer in &consumers {
            consumer.stop();
        }
        if pool.is_running() {
            pool.stop().await;
        }

        // The writer exits once every report handle is gone.
        drop(consumers);
        drop(errors);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        info!("Services stopped");
    }
}
