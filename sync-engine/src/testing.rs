//! Scripted in-memory backend for the engine tests.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};

use async_trait::async_trait;
use damnit_client::{ClientError, DashboardApi, ExtractedMetadata, ExtractedValue, PageRequest};
use data_feed::{LatestSource, LatestStream, LatestUpdate};
use futures::stream;
use serde_json::json;
use table_core::{
    Cell, CellValue, DType, RunNumber, RunRow, TableData, TableMetadata, Timestamp, Variable,
};

pub const MISSING_PROPOSAL: &str = "9999";

type Script = Vec<Result<LatestUpdate, ClientError>>;

/// Runs `1..=n`, each with `energy = run` and a heavy `image` column.
#[derive(Default)]
pub struct FakeApi {
    runs: Vec<RunNumber>,
    timestamp: Timestamp,
    metadata_calls: RefCell<usize>,
    page_calls: RefCell<Vec<PageRequest>>,
    refresh_calls: RefCell<Vec<String>>,
    subscriptions: RefCell<Vec<(String, Timestamp)>>,
    streams: RefCell<VecDeque<Script>>,
    failing_pages: RefCell<BTreeSet<u32>>,
    failing_extracted: RefCell<BTreeSet<RunNumber>>,
}

impl FakeApi {
    pub fn with_runs(n: RunNumber) -> Self {
        Self {
            runs: (1..=n).collect(),
            timestamp: 1.0,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn fail_page(&self, page: u32) {
        self.failing_pages.borrow_mut().insert(page);
    }

    pub fn heal_page(&self, page: u32) {
        self.failing_pages.borrow_mut().remove(&page);
    }

    pub fn fail_extracted(&self, run: RunNumber) {
        self.failing_extracted.borrow_mut().insert(run);
    }

    /// Messages for the next subscription, which ends after the last one.
    pub fn script_stream(&self, messages: Script) {
        self.streams.borrow_mut().push_back(messages);
    }

    pub fn metadata_calls(&self) -> usize {
        *self.metadata_calls.borrow()
    }

    pub fn page_calls(&self) -> Vec<PageRequest> {
        self.page_calls.borrow().clone()
    }

    pub fn refresh_calls(&self) -> Vec<String> {
        self.refresh_calls.borrow().clone()
    }

    pub fn subscriptions(&self) -> Vec<(String, Timestamp)> {
        self.subscriptions.borrow().clone()
    }

    pub fn metadata(&self) -> TableMetadata {
        let mut meta = TableMetadata {
            runs: self.runs.clone(),
            timestamp: self.timestamp,
            ..Default::default()
        };
        for var in [
            Variable::new("run").with_title("Run"),
            Variable::new("energy").with_title("Energy"),
            Variable::new("image"),
        ] {
            meta.variables.insert(var.name.clone(), var);
        }
        meta
    }

    fn row(run: RunNumber, request: &PageRequest) -> RunRow {
        let mut row = RunRow::new();
        for field in request.fields() {
            let cell = match field {
                "run" | "energy" => Cell::number(run as f64),
                "image" if request.lightweight => Cell::pending(DType::Image),
                "image" => Cell::new(CellValue::Image(format!("png-{run}")), DType::Image),
                _ => Cell::new(CellValue::Empty, DType::None),
            };
            row.insert(field.to_string(), cell);
        }
        row
    }
}

#[async_trait(?Send)]
impl DashboardApi for FakeApi {
    async fn fetch_metadata(&self, proposal: &str) -> Result<TableMetadata, ClientError> {
        *self.metadata_calls.borrow_mut() += 1;
        if proposal == MISSING_PROPOSAL {
            return Err(ClientError::NotFound(proposal.to_string()));
        }
        Ok(self.metadata())
    }

    async fn fetch_table_page(&self, request: PageRequest) -> Result<TableData, ClientError> {
        self.page_calls.borrow_mut().push(request.clone());
        tokio::task::yield_now().await;
        if self.failing_pages.borrow().contains(&request.page) {
            return Err(ClientError::Closed);
        }
        let start = (request.page.saturating_sub(1) * request.page_size) as usize;
        Ok(self
            .runs
            .iter()
            .skip(start)
            .take(request.page_size as usize)
            .map(|run| (*run, Self::row(*run, &request)))
            .collect())
    }

    async fn refresh(&self, proposal: &str) -> Result<TableMetadata, ClientError> {
        self.refresh_calls.borrow_mut().push(proposal.to_string());
        if proposal == MISSING_PROPOSAL {
            return Err(ClientError::GraphQl(vec![format!(
                "Proposal {proposal} not found"
            )]));
        }
        Ok(self.metadata())
    }

    async fn fetch_extracted(
        &self,
        _proposal: &str,
        run: RunNumber,
        variable: &str,
    ) -> Result<ExtractedValue, ClientError> {
        if self.failing_extracted.borrow().contains(&run) {
            return Err(ClientError::Decode(format!("no file for run {run}")));
        }
        Ok(ExtractedValue {
            data: json!([run, run * 2]),
            metadata: ExtractedMetadata {
                name: variable.to_string(),
                dtype: DType::Array,
                dims: vec!["index".into()],
                coords: Default::default(),
                attrs: None,
            },
        })
    }
}

impl LatestSource for FakeApi {
    type Error = ClientError;

    fn subscribe_latest(&self, proposal: &str, since: Timestamp) -> LatestStream<ClientError> {
        self.subscriptions
            .borrow_mut()
            .push((proposal.to_string(), since));
        match self.streams.borrow_mut().pop_front() {
            Some(messages) => Box::pin(stream::iter(messages)),
            None => Box::pin(stream::pending()),
        }
    }
}

/// Push message carrying one run with `energy` and a metadata snapshot.
pub fn latest(run: RunNumber, energy: f64, timestamp: Timestamp) -> LatestUpdate {
    let mut runs = TableData::new();
    runs.insert(
        run,
        [("energy".to_string(), Cell::number(energy))]
            .into_iter()
            .collect(),
    );
    LatestUpdate {
        runs,
        metadata: TableMetadata {
            runs: vec![run],
            timestamp,
            ..Default::default()
        },
    }
}
