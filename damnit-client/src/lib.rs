//! Transport for the dashboard backend: GraphQL over HTTP for queries and
//! mutations, graphql-transport-ws for the live feed.

use std::collections::BTreeMap;

use async_trait::async_trait;
use data_feed::LatestSource;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use table_core::{DType, RunNumber, TableData, TableMetadata};

mod client;
mod config;
mod error;
pub mod query;
mod scheduler;
pub mod ws;

pub use client::{sleep, GraphqlClient};
pub use config::{ClientConfig, RetryPolicy, DEFAULT_PAGE_SIZE, FULL_TABLE_PAGE_SIZE};
pub use error::ClientError;
pub use query::PageRequest;
pub use scheduler::{GatePermit, Priority, PriorityGate};

/// Attributes returned alongside an extracted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default = "unknown_dtype")]
    pub dtype: DType,
    #[serde(default)]
    pub dims: Vec<String>,
    #[serde(default)]
    pub coords: BTreeMap<String, Value>,
    #[serde(default)]
    pub attrs: Option<BTreeMap<String, Value>>,
}

fn unknown_dtype() -> DType {
    DType::Unknown
}

/// Full value of one variable for one run, as stored in the extracted files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedValue {
    #[serde(default)]
    pub data: Value,
    #[serde(flatten)]
    pub metadata: ExtractedMetadata,
}

/// Collaborator contract of the sync engine.
///
/// Futures are not `Send`: the engine runs on a single-threaded executor in
/// the browser.
#[async_trait(?Send)]
pub trait DashboardApi: LatestSource<Error = ClientError> {
    async fn fetch_metadata(&self, proposal: &str) -> Result<TableMetadata, ClientError>;

    async fn fetch_table_page(&self, request: PageRequest) -> Result<TableData, ClientError>;

    /// One-shot resynchronisation for a newly selected proposal.
    async fn refresh(&self, proposal: &str) -> Result<TableMetadata, ClientError>;

    async fn fetch_extracted(
        &self,
        proposal: &str,
        run: RunNumber,
        variable: &str,
    ) -> Result<ExtractedValue, ClientError>;
}
