//! REST client for a remote job catalog service.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::job::{GenerationUpdate, Job, JobPatch, NewJob};
use crate::metrics::observe_external_call;
use crate::retry::RetryPolicy;

use super::{CatalogError, JobCatalog, JobFilter};

/// Remote catalog connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCatalogConfig {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout() -> u64 {
    30
}

pub struct HttpCatalogClient {
    client: Client,
    config: HttpCatalogConfig,
}

impl HttpCatalogClient {
    pub fn new(config: HttpCatalogConfig) -> Result<Self, CatalogError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CatalogError::Api(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    fn filter_params(filter: &JobFilter) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("limit", filter.limit.to_string())];
        if let Some(ref pod) = filter.pod {
            pairs.push(("pod", pod.clone()));
        }
        if let Some(ref task_table) = filter.task_table {
            pairs.push(("taskTable", task_table.clone()));
        }
        if let Some(state) = filter.exclude_state {
            pairs.push(("excludeState", state.as_str().to_string()));
        }
        if let Some(message_id) = filter.message_id {
            pairs.push(("messageId", message_id.to_string()));
        }
        if let Some(ref key) = filter.association_key {
            pairs.push(("associationKey", key.clone()));
        }
        if let Some(ref product_name) = filter.product_name {
            pairs.push(("productName", product_name.clone()));
        }
        pairs
    }

    /// Send once and decode, mapping statuses to typed errors.
    async fn execute<T: DeserializeOwned>(
        request: RequestBuilder,
        job_id: Option<i64>,
    ) -> Result<Option<T>, CatalogError> {
        let response = request
            .send()
            .await
            .map_err(|e| CatalogError::Api(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND && job_id.is_some() {
            return Ok(None);
        }
        if status == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(conflict_from_body(job_id.unwrap_or_default(), &body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CatalogError::Api(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| CatalogError::InvalidResponse(e.to_string()))
    }

    /// Run `build` under the retry policy and record the call.
    async fn call<T, F>(
        &self,
        operation: &str,
        job_id: Option<i64>,
        build: F,
    ) -> Result<Option<T>, CatalogError>
    where
        T: DeserializeOwned,
        F: Fn() -> RequestBuilder,
    {
        let start = Instant::now();
        let build = &build;
        let result = self
            .config
            .retry
            .run(
                operation,
                CatalogError::is_retryable,
                move || async move { Self::execute::<T>(build(), job_id).await },
            )
            .await;
        observe_external_call("catalog", operation, result.is_ok(), start.elapsed().as_secs_f64());
        result
    }
}

#[derive(Debug, Deserialize)]
struct ConflictBody {
    task_table: String,
    expected: u64,
    actual: u64,
}

fn conflict_from_body(job_id: i64, body: &str) -> CatalogError {
    match serde_json::from_str::<ConflictBody>(body) {
        Ok(conflict) => CatalogError::VersionConflict {
            job_id,
            task_table: conflict.task_table,
            expected: conflict.expected,
            actual: conflict.actual,
        },
        Err(_) => CatalogError::VersionConflict {
            job_id,
            task_table: String::new(),
            expected: 0,
            actual: 0,
        },
    }
}

#[async_trait]
impl JobCatalog for HttpCatalogClient {
    async fn search(&self, filter: &JobFilter) -> Result<Vec<Job>, CatalogError> {
        let url = self.url("/jobs");
        let pairs = Self::filter_params(filter);
        let jobs = self
            .call("search", None, || self.client.get(&url).query(&pairs))
            .await?;
        Ok(jobs.unwrap_or_default())
    }

    async fn get(&self, id: i64) -> Result<Option<Job>, CatalogError> {
        let url = self.url(&format!("/jobs/{}", id));
        self.call("get", Some(id), || self.client.get(&url)).await
    }

    async fn create(&self, job: NewJob) -> Result<Job, CatalogError> {
        let url = self.url("/jobs");
        self.call("create", None, || self.client.post(&url).json(&job))
            .await?
            .ok_or_else(|| CatalogError::InvalidResponse("empty create response".to_string()))
    }

    async fn patch(&self, id: i64, patch: &JobPatch) -> Result<Job, CatalogError> {
        let url = self.url(&format!("/jobs/{}", id));
        self.call("patch", Some(id), || self.client.patch(&url).json(patch))
            .await?
            .ok_or(CatalogError::NotFound(id))
    }

    async fn patch_generation_state(
        &self,
        id: i64,
        task_table: &str,
        update: &GenerationUpdate,
    ) -> Result<Job, CatalogError> {
        let url = self.url(&format!("/jobs/{}/generations/{}", id, task_table));
        self.call("patch_generation_state", Some(id), || {
            self.client.patch(&url).json(update)
        })
        .await?
        .ok_or(CatalogError::NotFound(id))
    }
}
