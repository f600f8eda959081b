use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;

use futures_core::Stream;
use table_core::{Cell, RunNumber, RunRow, TableData, TableMetadata, Timestamp, RUN_VARIABLE};
use tracing::{debug, info};

/// Message pushed by the live subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatestUpdate {
    #[serde(default)]
    pub runs: TableData,
    pub metadata: TableMetadata,
}

/// Partial update for the store. Initial queries, paged fetches and pushes
/// all reduce to this shape.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableUpdate {
    pub data: TableData,
    pub metadata: Option<TableMetadata>,
}

impl TableUpdate {
    pub fn data(data: TableData) -> Self {
        Self {
            data,
            metadata: None,
        }
    }

    pub fn metadata(metadata: TableMetadata) -> Self {
        Self {
            data: TableData::new(),
            metadata: Some(metadata),
        }
    }

    pub fn with_metadata(mut self, metadata: TableMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl From<LatestUpdate> for TableUpdate {
    fn from(update: LatestUpdate) -> Self {
        Self {
            data: update.runs,
            metadata: Some(update.metadata),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TableEvent {
    /// Lightweight or full page fetch (1-based page number).
    Page { page: u32, update: TableUpdate },
    /// Heavy columns fetched in the deferred pass.
    Deferred { page: u32, data: TableData },
    /// Live push from the subscription.
    Latest(LatestUpdate),
    /// Metadata from the one-shot refresh.
    Refreshed(TableMetadata),
    /// Active dataset changed or the view went away.
    Reset,
}

/// Consumer interface for table events.
pub trait DataSink {
    fn on_event(&mut self, event: TableEvent);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub runs_touched: usize,
    pub metadata_replaced: bool,
}

/// Client-side cache of the active dataset.
#[derive(Debug, Default)]
pub struct TableStore {
    data: TableData,
    metadata: TableMetadata,
    last_update: BTreeMap<RunNumber, Timestamp>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &TableData {
        &self.data
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    /// Server cursor for the live subscription.
    pub fn timestamp(&self) -> Timestamp {
        self.metadata.timestamp
    }

    pub fn row(&self, run: RunNumber) -> Option<&RunRow> {
        self.data.get(&run)
    }

    pub fn cell(&self, run: RunNumber, variable: &str) -> Option<&Cell> {
        self.data.get(&run).and_then(|row| row.get(variable))
    }

    pub fn last_update(&self, run: RunNumber) -> Option<Timestamp> {
        self.last_update.get(&run).copied()
    }

    /// Runs merged at or after `since` (client clock).
    pub fn updated_since(&self, since: Timestamp) -> Vec<RunNumber> {
        self.last_update
            .iter()
            .filter(|(_, ts)| **ts >= since)
            .map(|(run, _)| *run)
            .collect()
    }

    /// Rows in canonical order; runs without fetched data yield `None`.
    pub fn rows(&self) -> impl Iterator<Item = (RunNumber, Option<&RunRow>)> + '_ {
        self.metadata
            .runs
            .iter()
            .map(move |run| (*run, self.data.get(run)))
    }

    pub fn merge(&mut self, update: TableUpdate) -> MergeOutcome {
        self.merge_at(update, now_ms())
    }

    /// Merge with an explicit client timestamp for `last_update`.
    ///
    /// Metadata, when present, replaces the current snapshot. Row data is
    /// merged per variable: known variables survive unless the update carries
    /// a value for the same name, and a pending cell never hides a value that
    /// is already known.
    pub fn merge_at(&mut self, update: TableUpdate, now: Timestamp) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        if !update.data.is_empty() {
            for (run, variables) in update.data {
                let row = self.data.entry(run).or_insert_with(|| {
                    let mut row = RunRow::new();
                    row.insert(RUN_VARIABLE.to_string(), Cell::number(run as f64));
                    row
                });
                for (name, cell) in variables {
                    match row.get(&name) {
                        Some(existing) if cell.is_deferred() && !existing.is_deferred() => {}
                        _ => {
                            row.insert(name, cell);
                        }
                    }
                }
                self.last_update.insert(run, now);
                outcome.runs_touched += 1;
            }
        }

        if let Some(metadata) = update.metadata {
            info!(
                variables = metadata.variables.len(),
                runs = metadata.runs.len(),
                timestamp = metadata.timestamp,
                "table metadata replaced"
            );
            self.metadata = metadata;
            outcome.metadata_replaced = true;
        }

        outcome
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl DataSink for TableStore {
    fn on_event(&mut self, event: TableEvent) {
        match event {
            TableEvent::Page { page, update } => {
                let outcome = self.merge(update);
                debug!(page, runs = outcome.runs_touched, "page merged");
            }
            TableEvent::Deferred { page, data } => {
                let outcome = self.merge(TableUpdate::data(data));
                debug!(page, runs = outcome.runs_touched, "deferred columns merged");
            }
            TableEvent::Latest(update) => {
                let outcome = self.merge(update.into());
                debug!(runs = outcome.runs_touched, "live update merged");
            }
            TableEvent::Refreshed(metadata) => {
                self.merge(TableUpdate::metadata(metadata));
            }
            TableEvent::Reset => self.reset(),
        }
    }
}

/// Current wall clock in milliseconds.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis() as Timestamp
}

/// Push feed: concrete implementations live in the transport crate.
pub type LatestStream<E> = Pin<Box<dyn Stream<Item = Result<LatestUpdate, E>> + 'static>>;

pub trait LatestSource {
    type Error;

    /// Subscribe to updates of a proposal newer than `since`. The stream
    /// follows the cursor itself as pushes arrive.
    fn subscribe_latest(&self, proposal: &str, since: Timestamp) -> LatestStream<Self::Error>;
}
