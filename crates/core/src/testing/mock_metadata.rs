//! Mock metadata client for testing.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::metadata::{
    MetadataClient, MetadataError, SearchMetadata, SearchMetadataQuery, SearchParams,
    SessionFile, SessionFileType,
};

/// A recorded search for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedMetadataSearch {
    pub query: SearchMetadataQuery,
    pub params: SearchParams,
}

/// Mock implementation of the MetadataClient trait.
///
/// Results are keyed by product type; every search is recorded. Clones share state,
/// so a test can keep a handle while the code under test owns another.
///
/// # Example
///
/// ```rust,ignore
/// let metadata = MockMetadataClient::new();
/// metadata.add_file("AUX_CAL", "S1A_AUX_CAL_V20190228T092500.SAFE").await;
///
/// let resolver = InputResolver::new(Arc::new(metadata.clone()), families, timeouts);
/// // ... resolve ...
/// assert_eq!(metadata.search_count().await, 1);
/// ```
#[derive(Clone, Default)]
pub struct MockMetadataClient {
    results: Arc<RwLock<HashMap<String, Vec<SearchMetadata>>>>,
    searches: Arc<RwLock<Vec<RecordedMetadataSearch>>>,
    sessions: Arc<RwLock<HashMap<String, Vec<SessionFile>>>>,
    session_requests: Arc<RwLock<Vec<String>>>,
    /// Number of upcoming searches or session listings that fail.
    fail_next: Arc<RwLock<u32>>,
}

impl std::fmt::Debug for MockMetadataClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMetadataClient")
            .field("results", &"<results>")
            .field("searches", &"<searches>")
            .finish()
    }
}

impl MockMetadataClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_result(&self, product_type: &str, result: SearchMetadata) {
        self.results
            .write()
            .await
            .entry(product_type.to_string())
            .or_default()
            .push(result);
    }

    /// Add a file valid for the next day.
    pub async fn add_file(&self, product_type: &str, product_name: &str) {
        let now = Utc::now();
        self.add_result(
            product_type,
            SearchMetadata {
                product_name: product_name.to_string(),
                product_type: product_type.to_string(),
                key_object_storage: product_name.to_string(),
                validity_start: now - Duration::days(1),
                validity_stop: now + Duration::days(1),
                mission_id: Some("S1".to_string()),
                satellite_id: Some("A".to_string()),
            },
        )
        .await;
    }

    pub async fn clear_results(&self, product_type: &str) {
        self.results.write().await.remove(product_type);
    }

    pub async fn set_fail_next(&self, count: u32) {
        *self.fail_next.write().await = count;
    }

    pub async fn search_count(&self) -> usize {
        self.searches.read().await.len()
    }

    /// Number of searches issued for a product type.
    pub async fn searches_for(&self, product_type: &str) -> usize {
        self.searches
            .read()
            .await
            .iter()
            .filter(|s| s.query.product_type == product_type)
            .count()
    }

    pub async fn recorded_searches(&self) -> Vec<RecordedMetadataSearch> {
        self.searches.read().await.clone()
    }

    pub async fn add_session_file(&self, file: SessionFile) {
        self.sessions
            .write()
            .await
            .entry(file.session_id.clone())
            .or_default()
            .push(file);
    }

    /// Add a raw file of a session channel, keyed under `{session}/ch0{channel}/`.
    pub async fn add_session_raw(&self, session_id: &str, channel_id: u8, name: &str) {
        self.add_session_file(SessionFile {
            product_name: name.to_string(),
            key_object_storage: format!("{}/ch0{}/{}", session_id, channel_id, name),
            session_id: session_id.to_string(),
            channel_id,
            product_type: SessionFileType::Raw,
            raw_names: Vec::new(),
        })
        .await;
    }

    /// Add the descriptor of a session channel announcing `raws`.
    pub async fn add_session_dsib(&self, session_id: &str, channel_id: u8, raws: &[&str]) {
        let name = format!("DCS_{}_ch{}_DSIB.xml", session_id, channel_id);
        self.add_session_file(SessionFile {
            key_object_storage: format!("{}/ch0{}/{}", session_id, channel_id, name),
            product_name: name,
            session_id: session_id.to_string(),
            channel_id,
            product_type: SessionFileType::Session,
            raw_names: raws.iter().map(|r| r.to_string()).collect(),
        })
        .await;
    }

    /// Sessions listed so far, in call order.
    pub async fn session_requests(&self) -> Vec<String> {
        self.session_requests.read().await.clone()
    }

    async fn take_failure(&self) -> Result<(), MetadataError> {
        let mut fail_next = self.fail_next.write().await;
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(MetadataError::Query("mock failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataClient for MockMetadataClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search(
        &self,
        query: &SearchMetadataQuery,
        params: &SearchParams,
    ) -> Result<Vec<SearchMetadata>, MetadataError> {
        self.searches.write().await.push(RecordedMetadataSearch {
            query: query.clone(),
            params: params.clone(),
        });

        self.take_failure().await?;

        Ok(self
            .results
            .read()
            .await
            .get(&query.product_type)
            .cloned()
            .unwrap_or_default())
    }

    async fn session_files(&self, session_id: &str) -> Result<Vec<SessionFile>, MetadataError> {
        self.session_requests
            .write()
            .await
            .push(session_id.to_string());
        self.take_failure().await?;

        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
