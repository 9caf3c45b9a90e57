use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use regex_lite::Regex;
use tracing::{debug, info};

use crate::catalog::{JobCatalog, JobFilter};
use crate::config::{Level, RoutingRule};
use crate::job::{CatalogEventMessage, Generation, Job, JobPatch, NewJob, ResolvedInputSet};
use crate::product::ProductTypeAdapter;
use crate::tasktable::{ProductMode, TaskTableAdapter};

use super::consumer::EventHandler;
use super::DispatchError;

/// Worker identity written on created jobs.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub pod: String,
    pub level: Level,
    pub mode: ProductMode,
}

/// What the dispatcher did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The message is already held by a job.
    Ignored { job_id: i64 },
    Appended { job_id: i64 },
    Created { job_id: i64 },
}

struct Route {
    pattern: Regex,
    task_tables: Vec<String>,
}

/// Turns catalog events into jobs.
pub struct JobDispatcher {
    settings: DispatcherSettings,
    catalog: Arc<dyn JobCatalog>,
    product_adapter: Arc<dyn ProductTypeAdapter>,
    task_tables: BTreeMap<String, Arc<TaskTableAdapter>>,
    routes: Vec<Route>,
}

impl JobDispatcher {
    /// Every routed task table must be one of `task_tables`. Without routing rules,
    /// events go to all task tables.
    pub fn new(
        settings: DispatcherSettings,
        routing: &[RoutingRule],
        task_tables: impl IntoIterator<Item = Arc<TaskTableAdapter>>,
        catalog: Arc<dyn JobCatalog>,
        product_adapter: Arc<dyn ProductTypeAdapter>,
    ) -> Result<Self, DispatchError> {
        let task_tables: BTreeMap<String, Arc<TaskTableAdapter>> = task_tables
            .into_iter()
            .map(|tt| (tt.name().to_string(), tt))
            .collect();

        let mut routes = Vec::with_capacity(routing.len());
        for rule in routing {
            let pattern = Regex::new(&format!("^(?:{})$", rule.product_type)).map_err(|e| {
                DispatchError::InvalidPattern {
                    pattern: rule.product_type.clone(),
                    reason: e.to_string(),
                }
            })?;
            if let Some(unknown) = rule
                .task_tables
                .iter()
                .find(|tt| !task_tables.contains_key(tt.as_str()))
            {
                return Err(DispatchError::UnknownTaskTable(unknown.clone()));
            }
            routes.push(Route {
                pattern,
                task_tables: rule.task_tables.clone(),
            });
        }

        Ok(Self {
            settings,
            catalog,
            product_adapter,
            task_tables,
            routes,
        })
    }

    /// Task tables generating jobs for a product type.
    pub fn route(&self, product_type: &str) -> Result<Vec<&TaskTableAdapter>, DispatchError> {
        let names: Vec<&str> = if self.routes.is_empty() {
            self.task_tables.keys().map(String::as_str).collect()
        } else {
            self.routes
                .iter()
                .find(|r| r.pattern.is_match(product_type))
                .map(|r| r.task_tables.iter().map(String::as_str).collect())
                .unwrap_or_default()
        };

        if names.is_empty() {
            return Err(DispatchError::NoRoute(product_type.to_string()));
        }
        names
            .into_iter()
            .map(|name| {
                self.task_tables
                    .get(name)
                    .map(Arc::as_ref)
                    .ok_or_else(|| DispatchError::UnknownTaskTable(name.to_string()))
            })
            .collect()
    }

    pub async fn dispatch(
        &self,
        message: &CatalogEventMessage,
    ) -> Result<DispatchOutcome, DispatchError> {
        let event = &message.body;
        let task_tables = self.route(&event.product_type)?;

        let holding = self
            .catalog
            .search(
                &JobFilter::new()
                    .with_pod(&self.settings.pod)
                    .with_message_id(message.id)
                    .with_limit(1),
            )
            .await?;
        if let Some(job) = holding.first() {
            debug!(job_id = job.id, "Message {} already handled", message.id);
            return Ok(DispatchOutcome::Ignored { job_id: job.id });
        }

        let association_key = self.product_adapter.association_key(event)?;
        let existing = self
            .catalog
            .search(
                &JobFilter::new()
                    .with_pod(&self.settings.pod)
                    .with_association_key(&association_key)
                    .with_limit(1),
            )
            .await?;

        match existing.into_iter().next() {
            Some(job) => self.append(job, message, &task_tables).await,
            None => self.create(association_key, message, &task_tables).await,
        }
    }

    async fn append(
        &self,
        mut job: Job,
        message: &CatalogEventMessage,
        task_tables: &[&TaskTableAdapter],
    ) -> Result<DispatchOutcome, DispatchError> {
        let now = Utc::now();
        self.product_adapter
            .merge_event(&mut job.product, &message.body)?;

        let mut patch = JobPatch::new()
            .with_product(job.product.clone())
            .append_message(message.clone());
        for task_table in task_tables {
            if job.generation(task_table.name()).is_none() {
                patch = patch
                    .add_generation(Generation::initial(task_table.name(), now))
                    .with_inputs(self.initial_inputs(task_table));
            }
        }

        let job = self.catalog.patch(job.id, &patch).await?;
        info!(
            job_id = job.id,
            "Appended message {} ({}) to job {}",
            message.id,
            message.body.product_name,
            job.association_key
        );
        Ok(DispatchOutcome::Appended { job_id: job.id })
    }

    async fn create(
        &self,
        association_key: String,
        message: &CatalogEventMessage,
        task_tables: &[&TaskTableAdapter],
    ) -> Result<DispatchOutcome, DispatchError> {
        let now = Utc::now();
        let product = self.product_adapter.build_product(&message.body)?;
        let new_job = NewJob {
            pod: self.settings.pod.clone(),
            level: self.settings.level.as_str().to_string(),
            association_key,
            product,
            messages: vec![message.clone()],
            generations: task_tables
                .iter()
                .map(|tt| Generation::initial(tt.name(), now))
                .collect(),
            inputs: task_tables.iter().map(|tt| self.initial_inputs(tt)).collect(),
        };

        let job = self.catalog.create(new_job).await?;
        info!(
            job_id = job.id,
            "Created job {} for {} with {} generation(s)",
            job.association_key,
            message.body.product_name,
            job.generations.len()
        );
        Ok(DispatchOutcome::Created { job_id: job.id })
    }

    fn initial_inputs(&self, task_table: &TaskTableAdapter) -> ResolvedInputSet {
        ResolvedInputSet::new(
            task_table.name(),
            task_table.initial_inputs(self.settings.mode),
        )
    }
}

#[async_trait]
impl EventHandler for JobDispatcher {
    async fn handle(&self, message: &CatalogEventMessage) -> Result<(), DispatchError> {
        self.dispatch(message).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SqliteJobCatalog;
    use crate::job::GenerationState;
    use crate::product::{L0SegmentAdapter, LevelProductAdapter};
    use crate::resolver::Families;
    use crate::testing::{fixtures, MockMetadataClient};

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            pod: "pod-1".to_string(),
            level: Level::L0Segment,
            mode: ProductMode::NonSlicing,
        }
    }

    fn routing(product_type: &str) -> Vec<RoutingRule> {
        vec![RoutingRule {
            product_type: product_type.to_string(),
            task_tables: vec![fixtures::L0ASP.to_string()],
        }]
    }

    fn segment_dispatcher(catalog: Arc<SqliteJobCatalog>) -> JobDispatcher {
        let adapter = L0SegmentAdapter::new(
            Arc::new(MockMetadataClient::new()),
            Families::new("L0_SEGMENT", Default::default()),
            0,
        );
        JobDispatcher::new(
            settings(),
            &routing("(EN|IW|SM|WV)_RAW__0S"),
            vec![Arc::new(fixtures::l0asp_adapter())],
            catalog,
            Arc::new(adapter),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_event_creates_job() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let dispatcher = segment_dispatcher(catalog.clone());
        let message = fixtures::message(11, fixtures::segment_event("S1A_IW_RAW__0S_0001", "dt-1"));

        let outcome = dispatcher.dispatch(&message).await.unwrap();
        let DispatchOutcome::Created { job_id } = outcome else {
            panic!("expected a created job, got {:?}", outcome);
        };

        let job = catalog.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.pod, "pod-1");
        assert_eq!(job.level, "L0_SEGMENT");
        assert_eq!(job.association_key, "dt-1");
        assert_eq!(job.generations.len(), 1);
        assert_eq!(job.generations[0].state, GenerationState::Initial);
        let inputs = job.inputs_for(fixtures::L0ASP).unwrap();
        assert_eq!(inputs.inputs.len(), 2);
        assert!(inputs.inputs.iter().all(|i| !i.has_result));
    }

    #[tokio::test]
    async fn test_same_datatake_is_appended() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let dispatcher = segment_dispatcher(catalog.clone());
        let first = fixtures::message(11, fixtures::segment_event("S1A_IW_RAW__0S_0001", "dt-1"));
        let mut event = fixtures::segment_event("S1A_IW_RAW__0S_0002", "dt-1");
        event.metadata.insert(
            crate::product::STOP_TIME.to_string(),
            serde_json::json!("2024-03-01T10:20:00Z"),
        );
        let second = fixtures::message(12, event);

        let DispatchOutcome::Created { job_id } = dispatcher.dispatch(&first).await.unwrap() else {
            panic!("expected a created job");
        };
        assert_eq!(
            dispatcher.dispatch(&second).await.unwrap(),
            DispatchOutcome::Appended { job_id }
        );

        let job = catalog.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.messages.len(), 2);
        assert_eq!(
            job.product.stop_time.to_rfc3339(),
            "2024-03-01T10:20:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_redelivered_message_is_ignored() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let dispatcher = segment_dispatcher(catalog.clone());
        let message = fixtures::message(11, fixtures::segment_event("S1A_IW_RAW__0S_0001", "dt-1"));

        let DispatchOutcome::Created { job_id } = dispatcher.dispatch(&message).await.unwrap() else {
            panic!("expected a created job");
        };
        assert_eq!(
            dispatcher.dispatch(&message).await.unwrap(),
            DispatchOutcome::Ignored { job_id }
        );
        let job = catalog.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_unrouted_product_type() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let dispatcher = segment_dispatcher(catalog);
        let mut event = fixtures::segment_event("S1A_AUX_CAL", "dt-1");
        event.product_type = "AUX_CAL".to_string();

        let result = dispatcher.dispatch(&fixtures::message(1, event)).await;
        assert!(matches!(result, Err(DispatchError::NoRoute(_))));
    }

    #[tokio::test]
    async fn test_route_is_anchored() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let dispatcher = segment_dispatcher(catalog);
        assert!(dispatcher.route("IW_RAW__0S").is_ok());
        assert!(dispatcher.route("XIW_RAW__0S").is_err());
    }

    #[test]
    fn test_routing_to_unknown_task_table_rejected() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let mut rules = routing("IW_RAW__0S");
        rules[0].task_tables.push("TaskTable.Unknown.xml".to_string());

        let result = JobDispatcher::new(
            settings(),
            &rules,
            vec![Arc::new(fixtures::l0asp_adapter())],
            catalog,
            Arc::new(LevelProductAdapter::new()),
        );
        assert!(matches!(result, Err(DispatchError::UnknownTaskTable(_))));
    }

    #[tokio::test]
    async fn test_without_routing_all_task_tables_apply() {
        let catalog = Arc::new(SqliteJobCatalog::in_memory().unwrap());
        let dispatcher = JobDispatcher::new(
            settings(),
            &[],
            vec![Arc::new(fixtures::l0asp_adapter())],
            catalog,
            Arc::new(LevelProductAdapter::new()),
        )
        .unwrap();

        let names: Vec<_> = dispatcher
            .route("ANY_TYPE")
            .unwrap()
            .iter()
            .map(|tt| tt.name().to_string())
            .collect();
        assert_eq!(names, vec![fixtures::L0ASP]);
    }
}
