//! HTTP metadata search client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metrics::observe_external_call;
use crate::retry::RetryPolicy;

use super::{
    format_metadata_date, MetadataClient, MetadataError, SearchMetadata, SearchMetadataQuery,
    SearchParams, SessionFile,
};

/// Metadata service connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Base URL, e.g. "http://metadata-search:8080".
    pub url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout() -> u64 {
    30
}

/// reqwest based [`MetadataClient`].
pub struct HttpMetadataClient {
    client: Client,
    config: MetadataConfig,
}

impl HttpMetadataClient {
    pub fn new(config: MetadataConfig) -> Result<Self, MetadataError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MetadataError::Query(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn search_url(&self, query: &SearchMetadataQuery) -> String {
        format!(
            "{}/metadata/{}/search",
            self.config.url.trim_end_matches('/'),
            query.product_family
        )
    }

    fn query_params(query: &SearchMetadataQuery, params: &SearchParams) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("productType", query.product_type.clone()),
            ("mode", query.retrieval_mode.clone()),
            ("t0", format_metadata_date(&params.start)),
            ("t1", format_metadata_date(&params.stop)),
            ("dt0", query.delta_time0.to_string()),
            ("dt1", query.delta_time1.to_string()),
            ("satellite", params.satellite_id.clone()),
        ];
        if let Some(ins_conf) = params.instrument_config_id {
            pairs.push(("insConfId", ins_conf.to_string()));
        }
        if let Some(ref process_mode) = params.process_mode {
            pairs.push(("processMode", process_mode.clone()));
        }
        if let Some(ref polarisation) = params.polarisation {
            pairs.push(("polarisation", polarisation.clone()));
        }
        pairs
    }

    fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/edrsSession/{}",
            self.config.url.trim_end_matches('/'),
            session_id
        )
    }

    async fn get_once<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        pairs: &[(&'static str, String)],
    ) -> Result<Vec<T>, MetadataError> {
        let response = self
            .client
            .get(url)
            .query(pairs)
            .send()
            .await
            .map_err(|e| MetadataError::Query(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(MetadataError::Query(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<Vec<T>>()
            .await
            .map_err(|e| MetadataError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn search(
        &self,
        query: &SearchMetadataQuery,
        params: &SearchParams,
    ) -> Result<Vec<SearchMetadata>, MetadataError> {
        let start = Instant::now();
        let url = self.search_url(query);
        let pairs = Self::query_params(query, params);
        let (url, pairs) = (&url, &pairs);

        debug!("Searching metadata: {}", query.to_log_message());
        let result = self
            .config
            .retry
            .run(
                "metadata search",
                |e| matches!(e, MetadataError::Query(_)),
                move || async move { self.get_once::<SearchMetadata>(url, pairs).await },
            )
            .await;

        observe_external_call(
            "metadata",
            "search",
            result.is_ok(),
            start.elapsed().as_secs_f64(),
        );

        result
    }

    async fn session_files(&self, session_id: &str) -> Result<Vec<SessionFile>, MetadataError> {
        let start = Instant::now();
        let url = self.session_url(session_id);
        let url = &url;

        debug!("Listing files of session {}", session_id);
        let result = self
            .config
            .retry
            .run(
                "session files",
                |e| matches!(e, MetadataError::Query(_)),
                move || async move { self.get_once::<SessionFile>(url, &[]).await },
            )
            .await;

        observe_external_call(
            "metadata",
            "session_files",
            result.is_ok(),
            start.elapsed().as_secs_f64(),
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn query() -> SearchMetadataQuery {
        SearchMetadataQuery {
            key: "k".to_string(),
            retrieval_mode: "LatestValCover".to_string(),
            delta_time0: 0.0,
            delta_time1: 0.0,
            product_type: "AUX_ECE".to_string(),
            product_family: "AUXILIARY_FILE".to_string(),
        }
    }

    #[test]
    fn test_search_url() {
        let client = HttpMetadataClient::new(MetadataConfig {
            url: "http://localhost:8080/".to_string(),
            timeout_secs: 5,
            retry: RetryPolicy::none(),
        })
        .unwrap();
        assert_eq!(
            client.search_url(&query()),
            "http://localhost:8080/metadata/AUXILIARY_FILE/search"
        );
    }

    #[test]
    fn test_session_url() {
        let client = HttpMetadataClient::new(MetadataConfig {
            url: "http://localhost:8080".to_string(),
            timeout_secs: 5,
            retry: RetryPolicy::none(),
        })
        .unwrap();
        assert_eq!(
            client.session_url("L20191022"),
            "http://localhost:8080/edrsSession/L20191022"
        );
    }

    #[test]
    fn test_query_params_include_optional_values() {
        let params = SearchParams {
            start: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            stop: Utc.with_ymd_and_hms(2024, 1, 1, 0, 10, 0).unwrap(),
            satellite_id: "A".to_string(),
            instrument_config_id: Some(6),
            process_mode: None,
            polarisation: Some("V".to_string()),
        };
        let pairs = HttpMetadataClient::query_params(&query(), &params);
        assert!(pairs.contains(&("insConfId", "6".to_string())));
        assert!(pairs.contains(&("polarisation", "V".to_string())));
        assert!(!pairs.iter().any(|(k, _)| *k == "processMode"));
        assert!(pairs.contains(&("t0", "2024-01-01T00:00:00.000000Z".to_string())));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_query_error() {
        let client = HttpMetadataClient::new(MetadataConfig {
            url: "http://127.0.0.1:1".to_string(),
            timeout_secs: 1,
            retry: RetryPolicy::none(),
        })
        .unwrap();
        let params = SearchParams {
            start: Utc::now(),
            stop: Utc::now(),
            satellite_id: "A".to_string(),
            instrument_config_id: None,
            process_mode: None,
            polarisation: None,
        };
        let result = client.search(&query(), &params).await;
        assert!(matches!(result, Err(MetadataError::Query(_))));
    }
}
