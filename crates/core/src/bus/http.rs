//! HTTP message bus client.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::metrics::observe_external_call;
use crate::retry::RetryPolicy;

use super::{Ack, BusError, BusMessage, MessageBus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBusConfig {
    pub url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout() -> u64 {
    30
}

pub struct HttpBusClient {
    client: Client,
    config: HttpBusConfig,
}

impl HttpBusClient {
    pub fn new(config: HttpBusConfig) -> Result<Self, BusError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BusError::Api(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, BusError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(BusError::Api(format!(
            "HTTP {}: {}",
            status,
            body.chars().take(200).collect::<String>()
        )))
    }

    async fn post_json<T: Serialize + Sync>(
        &self,
        operation: &str,
        url: &str,
        body: &T,
    ) -> Result<(), BusError> {
        let start = Instant::now();
        let result = self
            .config
            .retry
            .run(
                operation,
                |e| matches!(e, BusError::Api(_)),
                move || async move {
                    let response = self
                        .client
                        .post(url)
                        .json(body)
                        .send()
                        .await
                        .map_err(|e| BusError::Api(e.to_string()))?;
                    Self::check(response).await.map(|_| ())
                },
            )
            .await;
        observe_external_call("bus", operation, result.is_ok(), start.elapsed().as_secs_f64());
        result
    }
}

#[async_trait]
impl MessageBus for HttpBusClient {
    async fn publish(&self, category: &str, body: &serde_json::Value) -> Result<(), BusError> {
        let url = self.url(&format!("/messages/{}", category));
        self.post_json("publish", &url, body).await
    }

    async fn poll(&self, category: &str) -> Result<Option<BusMessage>, BusError> {
        let start = Instant::now();
        let url = self.url(&format!("/messages/{}/next", category));
        let url = &url;
        let result = self
            .config
            .retry
            .run(
                "poll",
                |e| matches!(e, BusError::Api(_)),
                move || async move {
                    let response = self
                        .client
                        .get(url)
                        .send()
                        .await
                        .map_err(|e| BusError::Api(e.to_string()))?;
                    if response.status() == StatusCode::NO_CONTENT {
                        return Ok(None);
                    }
                    Self::check(response)
                        .await?
                        .json::<BusMessage>()
                        .await
                        .map(Some)
                        .map_err(|e| BusError::InvalidResponse(e.to_string()))
                },
            )
            .await;
        observe_external_call("bus", "poll", result.is_ok(), start.elapsed().as_secs_f64());
        result
    }

    async fn ack(&self, category: &str, ack: &Ack) -> Result<(), BusError> {
        let url = self.url(&format!("/messages/{}/{}/ack", category, ack.message_id));
        self.post_json("ack", &url, ack).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpBusClient {
        HttpBusClient::new(HttpBusConfig {
            url: "http://127.0.0.1:1/".to_string(),
            timeout_secs: 1,
            retry: RetryPolicy::none(),
        })
        .unwrap()
    }

    #[test]
    fn test_url() {
        assert_eq!(
            client().url("/messages/level_jobs"),
            "http://127.0.0.1:1/messages/level_jobs"
        );
    }

    #[tokio::test]
    async fn test_unreachable_bus() {
        let bus = client();
        assert!(matches!(bus.poll("catalog-event").await, Err(BusError::Api(_))));
        assert!(matches!(
            bus.publish("level_jobs", &serde_json::json!({})).await,
            Err(BusError::Api(_))
        ));
    }
}
