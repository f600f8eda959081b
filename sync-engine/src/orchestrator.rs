//! Two-phase page fetch: cheap columns first, withheld heavy columns second.

use std::collections::BTreeSet;

use damnit_client::{ClientError, DashboardApi, PageRequest, Priority};
use data_feed::{TableEvent, TableUpdate};
use table_core::TableData;
use tracing::debug;

use crate::{StoreHandle, SyncError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageFetch {
    pub rows: usize,
    /// Columns fetched in the deferred pass.
    pub heavy_columns: Vec<String>,
}

/// Distinct names of cells whose value the server withheld.
pub fn heavy_columns(data: &TableData) -> Vec<String> {
    data.values()
        .flat_map(|row| {
            row.iter()
                .filter(|(_, cell)| cell.is_deferred())
                .map(|(name, _)| name.clone())
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Fetch one page into the store.
///
/// Columns come from the schema already in the store; metadata is only
/// queried when the store has none yet. The lightweight pass is sent
/// immediately, the heavy pass only once it has resolved and through the
/// background queue. Results are written only while the store is still at
/// `generation`.
pub async fn fetch_page<A>(
    api: &A,
    store: &StoreHandle,
    generation: u64,
    proposal: &str,
    page: u32,
    page_size: u32,
) -> Result<PageFetch, SyncError>
where
    A: DashboardApi + ?Sized,
{
    let known: Vec<String> = store.read().await.metadata().variables.keys().cloned().collect();
    let (columns, metadata) = if known.is_empty() {
        let metadata = api
            .fetch_metadata(proposal)
            .await
            .map_err(|source| page_error(proposal, page, source))?;
        (metadata.variables.keys().cloned().collect(), Some(metadata))
    } else {
        (known, None)
    };

    let request = PageRequest::new(proposal, page, page_size)
        .with_columns(columns)
        .lightweight();
    let data = api
        .fetch_table_page(request)
        .await
        .map_err(|source| page_error(proposal, page, source))?;
    if data.is_empty() {
        debug!(proposal, page, "page is empty");
        return Ok(PageFetch::default());
    }

    let heavy = heavy_columns(&data);
    let rows = data.len();
    let mut update = TableUpdate::data(data);
    if let Some(metadata) = metadata {
        update = update.with_metadata(metadata);
    }
    if !store
        .apply_if(generation, TableEvent::Page { page, update })
        .await
    {
        debug!(proposal, page, "dropping page of a replaced selection");
        return Err(SyncError::Superseded { page });
    }

    if !heavy.is_empty() {
        debug!(proposal, page, columns = ?heavy, "fetching deferred columns");
        let request = PageRequest::new(proposal, page, page_size)
            .with_columns(heavy.iter().cloned())
            .with_priority(Priority::Background);
        let data = api
            .fetch_table_page(request)
            .await
            .map_err(|source| page_error(proposal, page, source))?;
        if !store
            .apply_if(generation, TableEvent::Deferred { page, data })
            .await
        {
            debug!(proposal, page, "dropping deferred columns of a replaced selection");
            return Err(SyncError::Superseded { page });
        }
    }

    Ok(PageFetch {
        rows,
        heavy_columns: heavy,
    })
}

fn page_error(proposal: &str, page: u32, source: ClientError) -> SyncError {
    if source.is_not_found() {
        SyncError::NotFound {
            proposal: proposal.to_string(),
        }
    } else {
        SyncError::TransientFetch { page, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeApi;
    use table_core::{Cell, CellValue, DType};

    #[test]
    fn heavy_columns_are_distinct_and_sorted() {
        let mut data = TableData::new();
        for run in 1..=3 {
            let mut row = table_core::RunRow::new();
            row.insert("energy".into(), Cell::number(run as f64));
            row.insert("image".into(), Cell::pending(DType::Image));
            row.insert("trace".into(), Cell::pending(DType::Array));
            row.insert("note".into(), Cell::new(CellValue::Empty, DType::String));
            data.insert(run, row);
        }
        assert_eq!(heavy_columns(&data), vec!["image", "trace"]);
    }

    #[tokio::test]
    async fn heavy_pass_requests_only_withheld_columns() {
        let api = FakeApi::with_runs(25);
        let store = StoreHandle::new();
        let fetch = fetch_page(&api, &store, store.generation(), "2956", 2, 10)
            .await
            .unwrap();
        assert_eq!(fetch.rows, 10);
        assert_eq!(fetch.heavy_columns, vec!["image"]);

        let calls = api.page_calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].lightweight);
        assert_eq!(calls[0].priority, Priority::Interactive);
        assert!(!calls[1].lightweight);
        assert_eq!(calls[1].priority, Priority::Background);
        assert_eq!(calls[1].fields(), vec!["run", "image"]);

        let guard = store.read().await;
        let cell = guard.cell(11, "image").unwrap();
        assert!(matches!(cell.value, CellValue::Image(_)));
        assert_eq!(guard.cell(11, "energy"), Some(&Cell::number(11.0)));
        assert_eq!(guard.metadata().runs.len(), 25);
        assert_eq!(api.metadata_calls(), 1);
    }

    #[tokio::test]
    async fn known_schema_skips_the_metadata_query() {
        let api = FakeApi::with_runs(25);
        let store = StoreHandle::new();
        store.apply(TableEvent::Refreshed(api.metadata())).await;
        fetch_page(&api, &store, store.generation(), "2956", 1, 10)
            .await
            .unwrap();
        assert_eq!(api.metadata_calls(), 0);
        assert_eq!(api.page_calls()[0].fields(), vec!["run", "energy", "image"]);
    }

    #[tokio::test]
    async fn page_for_a_replaced_selection_is_dropped() {
        let api = FakeApi::with_runs(25);
        let store = StoreHandle::new();
        let generation = store.generation();
        store.apply(TableEvent::Reset).await;
        let err = fetch_page(&api, &store, generation, "2956", 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Superseded { page: 1 }));
        assert!(store.read().await.data().is_empty());
        assert_eq!(api.page_calls().len(), 1);
    }

    #[tokio::test]
    async fn missing_proposal_maps_to_not_found() {
        let api = FakeApi::with_runs(5);
        let store = StoreHandle::new();
        let err = fetch_page(&api, &store, 0, crate::testing::MISSING_PROPOSAL, 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
    }

    #[tokio::test]
    async fn page_past_the_end_fetches_nothing_heavy() {
        let api = FakeApi::with_runs(5);
        let store = StoreHandle::new();
        let fetch = fetch_page(&api, &store, store.generation(), "2956", 4, 10)
            .await
            .unwrap();
        assert_eq!(fetch, PageFetch::default());
        assert_eq!(api.page_calls().len(), 1);
        assert!(store.read().await.data().is_empty());
    }
}
