use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::job_generator::JobGenerator;
use super::types::{GeneratorError, GeneratorStatus, PoolStatus, TickOutcome};

/// Runs one fixed-delay loop per task table generator.
pub struct GeneratorPool {
    generators: Vec<Arc<JobGenerator>>,
    fixed_delay: Duration,

    // Runtime state
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<BTreeMap<String, GeneratorStatus>>>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl GeneratorPool {
    pub fn new(generators: Vec<JobGenerator>, fixed_delay: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let stats = generators
            .iter()
            .map(|g| (g.task_table().to_string(), GeneratorStatus::new(g.task_table())))
            .collect();

        Self {
            generators: generators.into_iter().map(Arc::new).collect(),
            fixed_delay,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(RwLock::new(stats)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn task_tables(&self) -> impl Iterator<Item = &str> {
        self.generators.iter().map(|g| g.task_table())
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Start one loop per generator.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Generator pool already running");
            return;
        }

        info!("Starting {} generator(s)", self.generators.len());
        let mut handles = self.handles.lock().await;
        for generator in &self.generators {
            handles.push(self.spawn_loop(Arc::clone(generator)));
        }
    }

    /// Stop the loops, letting in-flight ticks finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Generator pool not running");
            return;
        }

        info!("Stopping generator pool");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Generator loop ended abnormally: {}", e);
            }
        }
        info!("Generator pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> PoolStatus {
        PoolStatus {
            running: self.is_running(),
            generators: self.stats.read().await.values().cloned().collect(),
        }
    }

    /// Run a single tick of one generator outside of the loops.
    pub async fn tick_once(&self, task_table: &str) -> Result<TickOutcome, GeneratorError> {
        let generator = self
            .generators
            .iter()
            .find(|g| g.task_table() == task_table)
            .ok_or_else(|| GeneratorError::UnknownTaskTable(task_table.to_string()))?;
        let result = generator.tick().await;
        record(&self.stats, task_table, &result).await;
        result
    }

    fn spawn_loop(&self, generator: Arc<JobGenerator>) -> JoinHandle<()> {
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let delay = self.fixed_delay;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let task_table = generator.task_table().to_string();
            info!(task_table = %task_table, "Generator loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(task_table = %task_table, "Generator loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        let result = generator.tick().await;
                        if let Err(ref e) = result {
                            error!(task_table = %task_table, "Generator tick failed: {}", e);
                        }
                        record(&stats, &task_table, &result).await;
                    }
                }
            }
            info!(task_table = %task_table, "Generator loop stopped");
        })
    }
}

async fn record(
    stats: &RwLock<BTreeMap<String, GeneratorStatus>>,
    task_table: &str,
    result: &Result<TickOutcome, GeneratorError>,
) {
    let mut stats = stats.write().await;
    stats
        .entry(task_table.to_string())
        .or_insert_with(|| GeneratorStatus::new(task_table))
        .record(result, Utc::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{JobCatalog, SqliteJobCatalog};
    use crate::config::{GeneratorConfig, WorkerConfig};
    use crate::generator::GeneratorContext;
    use crate::job::GenerationState;
    use crate::product::LevelProductAdapter;
    use crate::publish::Publisher;
    use crate::resolver::{Families, InputResolver, InputTimeoutChecker};
    use crate::tasktable::ProductMode;
    use crate::testing::{fixtures, MockMessageBus, MockMetadataClient};

    fn pool(catalog: Arc<SqliteJobCatalog>, metadata: &MockMetadataClient) -> GeneratorPool {
        let worker: WorkerConfig = toml::from_str(
            r#"
            level = "L0"
            tasktable_dir = "/app/tasktables"
            "#,
        )
        .unwrap();
        let ctx = GeneratorContext {
            pod: "pod-1".to_string(),
            mode: ProductMode::NonSlicing,
            config: GeneratorConfig {
                fixed_delay_ms: 5,
                wait_primary_check_ms: 0,
                wait_metadata_input_ms: 0,
                ..GeneratorConfig::default()
            },
            catalog,
            product_adapter: Arc::new(LevelProductAdapter::new()),
            resolver: Arc::new(InputResolver::new(
                Arc::new(metadata.clone()),
                Families::new("AUXILIARY_FILE", Default::default()),
                InputTimeoutChecker::immediate(),
            )),
            publisher: Arc::new(Publisher::new(
                worker,
                Arc::new(MockMessageBus::new()),
                "level_jobs",
            )),
        };
        let generator = JobGenerator::new(Arc::new(fixtures::l0asp_adapter()), ctx);
        GeneratorPool::new(vec![generator], Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let metadata = MockMetadataClient::new();
        metadata
            .add_file("AUX_CAL", "S1A_AUX_CAL_V20190228T092500.SAFE")
            .await;
        let job = catalog
            .create(fixtures::new_job("pod-1", &[fixtures::L0ASP]))
            .await
            .unwrap();
        let pool = pool(catalog.clone(), &metadata);

        pool.start().await;
        assert!(pool.is_running());

        let mut sent = false;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let stored = catalog.get(job.id).await.unwrap().unwrap();
            if stored.generations[0].state == GenerationState::Sent {
                sent = true;
                break;
            }
        }
        pool.stop().await;

        assert!(sent);
        let status = pool.status().await;
        assert!(!status.running);
        assert_eq!(status.generators.len(), 1);
        assert_eq!(status.generators[0].advanced, 3);
    }

    #[tokio::test]
    async fn test_tick_once_unknown_task_table() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let pool = pool(catalog, &MockMetadataClient::new());
        assert!(matches!(
            pool.tick_once("TaskTable.Unknown.xml").await,
            Err(GeneratorError::UnknownTaskTable(_))
        ));
    }

    #[tokio::test]
    async fn test_tick_once_records_status() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let pool = pool(catalog, &MockMetadataClient::new());

        assert_eq!(
            pool.tick_once(fixtures::L0ASP).await.unwrap(),
            TickOutcome::Idle
        );
        let status = pool.status().await;
        assert_eq!(status.generators[0].ticks, 1);
        assert_eq!(status.generators[0].task_table, fixtures::L0ASP);
    }
}
