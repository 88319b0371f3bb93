//! API client for the agent HTTP API

use anyhow::{Context, Result};
use qos_core::ingest::CycleStatus;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for one agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    /// Make a POST request without a body
    pub async fn post<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .query(query)
            .send()
            .await
            .context("Failed to send request")?;

        Self::parse(response).await
    }

    async fn parse<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn status(&self) -> Result<CycleStatus> {
        self.get("status").await
    }

    pub async fn valve(&self, pipeline: &str) -> Result<ValveState> {
        self.get(&format!("valve/{}", pipeline)).await
    }

    pub async fn set_valve(&self, pipeline: &str, enabled: bool) -> Result<ValveState> {
        self.post(
            &format!("valve/{}", pipeline),
            &[("enabled", enabled.to_string())],
        )
        .await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveState {
    pub pipeline: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_status_parses_cycle_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/status")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "cycles": 12,
                    "last_snapshot_timestamp": 120.0,
                    "workloads": 4,
                    "last_corrections": [],
                    "total_corrections": 2,
                    "last_slack": {"cpus": 1.5, "timestamp": 120.0},
                    "qos_valve_open": true,
                    "estimator_valve_open": false
                }"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let status = client.status().await.unwrap();

        mock.assert_async().await;
        assert_eq!(status.cycles, 12);
        assert_eq!(status.total_corrections, 2);
        assert_eq!(status.last_slack.map(|s| s.cpus), Some(1.5));
        assert!(!status.estimator_valve_open);
        assert!(status.observers.is_empty());
    }

    #[tokio::test]
    async fn test_set_valve_sends_enabled_query() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/valve/estimator")
            .match_query(Matcher::UrlEncoded("enabled".into(), "false".into()))
            .with_status(200)
            .with_body(r#"{"pipeline": "estimator", "enabled": false}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let valve = client.set_valve("estimator", false).await.unwrap();

        mock.assert_async().await;
        assert_eq!(valve.pipeline, "estimator");
        assert!(!valve.enabled);
    }

    #[tokio::test]
    async fn test_api_error_carries_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/valve/qos")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_body(r#"{"error": "Too many valve requests"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.set_valve("qos", true).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("429"));
        assert!(message.contains("Too many valve requests"));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
