//! HTTP client for a running load generator

use anyhow::{Context, Result};
use eksapi_lib::health::{HealthResponse, ReadinessResponse};
use eksapi_lib::loadgen::RunSummary;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

pub struct LoadgenClient {
    client: Client,
    base_url: Url,
}

impl LoadgenClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid load generator URL")?;

        Ok(Self { client, base_url })
    }

    /// GET `path` and decode the body for any of `accepted` statuses
    async fn get<T: DeserializeOwned>(&self, path: &str, accepted: &[StatusCode]) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;
        debug!(url = %url, "Querying load generator");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        if !status.is_success() && !accepted.contains(&status) {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("load generator error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Health is reported with 503 when unhealthy, so that body is decoded too
    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("healthz", &[StatusCode::SERVICE_UNAVAILABLE]).await
    }

    pub async fn readiness(&self) -> Result<ReadinessResponse> {
        self.get("readyz", &[StatusCode::SERVICE_UNAVAILABLE]).await
    }

    pub async fn summary(&self) -> Result<RunSummary> {
        self.get("summary", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eksapi_lib::health::ComponentStatus;

    #[tokio::test]
    async fn test_unhealthy_body_is_decoded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/healthz")
            .with_status(503)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"status":"unhealthy","components":{"target":{"status":"unhealthy","message":"connection refused","last_check_timestamp":1700000000}}}"#,
            )
            .create_async()
            .await;

        let client = LoadgenClient::new(&server.url()).unwrap();
        let health = client.health().await.unwrap();
        mock.assert_async().await;
        assert_eq!(health.status, ComponentStatus::Unhealthy);
        assert_eq!(
            health.components["target"].message.as_deref(),
            Some("connection refused")
        );
    }

    #[tokio::test]
    async fn test_readiness_and_summary() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/readyz")
            .with_status(200)
            .with_body(r#"{"ready":true}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/summary")
            .with_status(200)
            .with_body(serde_json::to_string(&RunSummary::default()).unwrap())
            .create_async()
            .await;

        let client = LoadgenClient::new(&server.url()).unwrap();
        assert!(client.readiness().await.unwrap().ready);
        assert_eq!(client.summary().await.unwrap(), RunSummary::default());
    }

    #[tokio::test]
    async fn test_server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/summary")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = LoadgenClient::new(&server.url()).unwrap();
        let err = client.summary().await.unwrap_err();
        assert!(err.to_string().contains("500"));
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(LoadgenClient::new("not a url").is_err());
    }
}
