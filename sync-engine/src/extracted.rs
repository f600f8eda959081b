use std::collections::BTreeMap;

use damnit_client::{DashboardApi, ExtractedValue, PageRequest, FULL_TABLE_PAGE_SIZE};
use data_feed::{TableEvent, TableUpdate};
use futures::future::join_all;
use table_core::RunNumber;
use tracing::{debug, warn};

use crate::{StoreHandle, SyncError};

/// Full per-run values loaded on demand, keyed by run then variable.
#[derive(Debug, Clone, Default)]
pub struct ExtractedStore {
    values: BTreeMap<RunNumber, BTreeMap<String, ExtractedValue>>,
}

impl ExtractedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, run: RunNumber, variable: impl Into<String>, value: ExtractedValue) {
        self.values
            .entry(run)
            .or_default()
            .insert(variable.into(), value);
    }

    pub fn get(&self, run: RunNumber, variable: &str) -> Option<&ExtractedValue> {
        self.values.get(&run).and_then(|vars| vars.get(variable))
    }

    /// Runs holding a value for `variable`, ascending.
    pub fn runs_with(&self, variable: &str) -> Vec<RunNumber> {
        self.values
            .iter()
            .filter(|(_, vars)| vars.contains_key(variable))
            .map(|(run, _)| *run)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}

/// Result of loading one variable for every run.
#[derive(Debug, Default)]
pub struct ExtractedSync {
    pub loaded: Vec<RunNumber>,
    pub failed: Vec<(RunNumber, SyncError)>,
}

/// Load a single extracted value into `extracted`.
pub async fn fetch_extracted<A>(
    api: &A,
    extracted: &mut ExtractedStore,
    proposal: &str,
    run: RunNumber,
    variable: &str,
) -> Result<(), SyncError>
where
    A: DashboardApi + ?Sized,
{
    let value = api.fetch_extracted(proposal, run, variable).await?;
    extracted.insert(run, variable, value);
    Ok(())
}

/// Load `variable` for every run: its table column first, in one request,
/// then the extracted value of each run that has it. Per-run failures are
/// collected rather than aborting the rest.
pub async fn fetch_all_extracted<A>(
    api: &A,
    store: &StoreHandle,
    extracted: &mut ExtractedStore,
    proposal: &str,
    variable: &str,
) -> Result<ExtractedSync, SyncError>
where
    A: DashboardApi + ?Sized,
{
    let request =
        PageRequest::new(proposal, 1, FULL_TABLE_PAGE_SIZE).with_columns([variable]);
    let data = api.fetch_table_page(request).await?;
    store
        .apply(TableEvent::Page {
            page: 1,
            update: TableUpdate::data(data),
        })
        .await;

    let runs: Vec<RunNumber> = {
        let guard = store.read().await;
        guard
            .data()
            .iter()
            .filter(|(_, row)| row.contains_key(variable))
            .map(|(run, _)| *run)
            .collect()
    };
    debug!(proposal, variable, runs = runs.len(), "fetching extracted values");

    let results = join_all(
        runs.iter()
            .map(|run| api.fetch_extracted(proposal, *run, variable)),
    )
    .await;

    let mut summary = ExtractedSync::default();
    for (run, result) in runs.into_iter().zip(results) {
        match result {
            Ok(value) => {
                extracted.insert(run, variable, value);
                summary.loaded.push(run);
            }
            Err(err) => {
                warn!(proposal, run, variable, error = %err, "extracted value failed");
                summary.failed.push((run, err.into()));
            }
        }
    }
    Ok(summary)
}
