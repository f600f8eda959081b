use std::time::Duration;

use async_trait::async_trait;
use data_feed::{LatestSource, LatestStream};
use reqwest::Url;
use table_core::{RunNumber, TableData, TableMetadata, Timestamp};
use tracing::{debug, warn};

use crate::query::{
    extracted_request, metadata_from_refresh, metadata_request, refresh_request,
    rows_from_runs, GraphqlRequest, GraphqlResponse, EXTRACTED_DATA_FIELD_NAME,
};
use crate::{
    ws, ClientConfig, ClientError, DashboardApi, ExtractedValue, PageRequest, Priority,
    PriorityGate,
};

/// HTTP GraphQL client. Every request goes through the priority gate; the
/// permit is held only while an attempt is on the wire.
#[derive(Debug, Clone)]
pub struct GraphqlClient {
    config: ClientConfig,
    http: reqwest::Client,
    gate: PriorityGate,
}

impl GraphqlClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        Url::parse(&config.graphql_url())
            .map_err(|e| ClientError::Config(format!("{}: {e}", config.base_url)))?;
        let http = build_http(&config)?;
        Ok(Self {
            gate: PriorityGate::new(config.background_concurrency),
            config,
            http,
        })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::default())
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn gate(&self) -> &PriorityGate {
        &self.gate
    }

    /// Send a request, retrying transient failures with a fixed delay.
    pub async fn execute(
        &self,
        request: &GraphqlRequest,
        priority: Priority,
    ) -> Result<GraphqlResponse, ClientError> {
        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            let result = {
                let _permit = self.gate.admit(priority).await?;
                self.send(request).await
            };
            match result {
                Err(err) if err.is_transient() && attempt < retry.attempts() => {
                    warn!(
                        operation = %request.operation_name,
                        attempt,
                        error = %err,
                        "request failed, retrying"
                    );
                    sleep(retry.delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn send(&self, request: &GraphqlRequest) -> Result<GraphqlResponse, ClientError> {
        debug!(operation = %request.operation_name, "graphql request");
        let resp = self
            .http
            .post(self.config.graphql_url())
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json::<GraphqlResponse>().await?)
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn build_http(config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .build()?)
}

#[cfg(target_arch = "wasm32")]
fn build_http(_config: &ClientConfig) -> Result<reqwest::Client, ClientError> {
    Ok(reqwest::Client::builder().build()?)
}

/// Timer for retry and reconnect delays on either target.
#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep(delay: Duration) {
    tokio::time::sleep(delay).await;
}

#[cfg(target_arch = "wasm32")]
pub async fn sleep(delay: Duration) {
    gloo_timers::future::sleep(delay).await;
}

#[async_trait(?Send)]
impl DashboardApi for GraphqlClient {
    async fn fetch_metadata(&self, proposal: &str) -> Result<TableMetadata, ClientError> {
        let value = self
            .execute(&metadata_request(proposal), Priority::Interactive)
            .await?
            .into_field("metadata")?;
        Ok(serde_json::from_value(value)?)
    }

    async fn fetch_table_page(&self, request: PageRequest) -> Result<TableData, ClientError> {
        let runs = self
            .execute(&request.to_graphql(), request.priority)
            .await?
            .into_field("runs")?;
        rows_from_runs(runs)
    }

    async fn refresh(&self, proposal: &str) -> Result<TableMetadata, ClientError> {
        let value = self
            .execute(&refresh_request(proposal), Priority::Interactive)
            .await?
            .into_field("refresh")?;
        metadata_from_refresh(value)
    }

    async fn fetch_extracted(
        &self,
        proposal: &str,
        run: RunNumber,
        variable: &str,
    ) -> Result<ExtractedValue, ClientError> {
        let value = self
            .execute(
                &extracted_request(proposal, run, variable),
                Priority::Interactive,
            )
            .await?
            .into_field(EXTRACTED_DATA_FIELD_NAME)?;
        Ok(serde_json::from_value(value)?)
    }
}

impl LatestSource for GraphqlClient {
    type Error = ClientError;

    fn subscribe_latest(&self, proposal: &str, since: Timestamp) -> LatestStream<ClientError> {
        debug!(proposal, cursor = since, "opening live subscription");
        ws::subscribe(self.config.subscription_url(), proposal, since)
    }
}
