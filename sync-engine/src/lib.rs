//! Client-side synchronisation of the run table: viewport-driven paging with
//! deferred heavy columns, the live feed of the selected proposal, and
//! on-demand extracted values.

use std::sync::Arc;

use damnit_client::{ClientConfig, ClientError, DashboardApi, GraphqlClient};
use table_core::{Rect, RunNumber};
use thiserror::Error;

pub mod extracted;
pub mod orchestrator;
pub mod paginator;
pub mod reconciler;
mod store;

#[cfg(test)]
mod testing;

pub use extracted::{fetch_all_extracted, fetch_extracted, ExtractedStore, ExtractedSync};
pub use orchestrator::{fetch_page, heavy_columns, PageFetch};
pub use paginator::{PageLoad, Paginator, PagingMode, RegionSync};
pub use reconciler::{was_replaced, LiveFeed, ProposalStatus, Reconciler, SyncState};
pub use store::StoreHandle;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("proposal {proposal} not found")]
    NotFound { proposal: String },
    #[error("page {page} failed: {source}")]
    TransientFetch {
        page: u32,
        #[source]
        source: ClientError,
    },
    #[error("page {page} belongs to a replaced selection")]
    Superseded { page: u32 },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("no proposal selected")]
    NoActiveProposal,
}

/// Everything the dashboard needs for one browser tab: one store, one
/// reconciler and a paginator for the selected proposal.
pub struct DashboardSync<A: ?Sized> {
    api: Arc<A>,
    store: StoreHandle,
    reconciler: Reconciler<A>,
    paginator: Option<Paginator<A>>,
    extracted: ExtractedStore,
    mode: PagingMode,
}

impl DashboardSync<GraphqlClient> {
    pub fn from_config(config: ClientConfig) -> Result<Self, SyncError> {
        let mode = PagingMode::Paged {
            page_size: config.page_size,
        };
        let reconnect_delay = config.retry.delay;
        let client = GraphqlClient::new(config)?;
        let mut sync = Self::new(Arc::new(client), mode);
        sync.reconciler.set_reconnect_delay(reconnect_delay);
        Ok(sync)
    }
}

impl<A: DashboardApi + ?Sized + 'static> DashboardSync<A> {
    pub fn new(api: Arc<A>, mode: PagingMode) -> Self {
        let store = StoreHandle::new();
        Self {
            reconciler: Reconciler::new(Arc::clone(&api), store.clone()),
            api,
            store,
            paginator: None,
            extracted: ExtractedStore::new(),
            mode,
        }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn state(&self) -> SyncState {
        self.reconciler.state()
    }

    pub fn status(&self) -> ProposalStatus {
        self.reconciler.status()
    }

    pub fn paginator(&self) -> Option<&Paginator<A>> {
        self.paginator.as_ref()
    }

    pub fn extracted(&self) -> &ExtractedStore {
        &self.extracted
    }

    /// Select a proposal. Page state and extracted values of the previous
    /// selection are dropped; the returned feed must be driven by the host.
    pub async fn select(&mut self, proposal: &str) -> Result<Option<LiveFeed>, SyncError> {
        let result = self.reconciler.select(proposal).await;
        match &result {
            Ok(None) => {}
            Ok(Some(_)) => {
                self.paginator = Some(Paginator::with_mode(
                    Arc::clone(&self.api),
                    self.store.clone(),
                    proposal,
                    self.mode,
                ));
                self.extracted.reset();
            }
            Err(_) => {
                self.paginator = None;
                self.extracted.reset();
            }
        }
        result
    }

    pub async fn clear(&mut self) {
        self.reconciler.clear().await;
        self.paginator = None;
        self.extracted.reset();
    }

    pub async fn sync_region(&self, rect: &Rect) -> Result<RegionSync, SyncError> {
        let paginator = self.paginator.as_ref().ok_or(SyncError::NoActiveProposal)?;
        Ok(paginator.sync_region(rect).await)
    }

    pub async fn retry_failed(&self) -> Result<RegionSync, SyncError> {
        let paginator = self.paginator.as_ref().ok_or(SyncError::NoActiveProposal)?;
        Ok(paginator.retry_failed().await)
    }

    pub async fn fetch_extracted(&mut self, run: RunNumber, variable: &str) -> Result<(), SyncError> {
        let proposal = self.active_proposal()?;
        fetch_extracted(self.api.as_ref(), &mut self.extracted, &proposal, run, variable).await
    }

    pub async fn fetch_all_extracted(&mut self, variable: &str) -> Result<ExtractedSync, SyncError> {
        let proposal = self.active_proposal()?;
        fetch_all_extracted(
            self.api.as_ref(),
            &self.store,
            &mut self.extracted,
            &proposal,
            variable,
        )
        .await
    }

    fn active_proposal(&self) -> Result<String, SyncError> {
        self.paginator
            .as_ref()
            .map(|p| p.proposal().to_string())
            .ok_or(SyncError::NoActiveProposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeApi, MISSING_PROPOSAL};

    fn engine(api: &Arc<FakeApi>) -> DashboardSync<FakeApi> {
        DashboardSync::new(api.clone(), PagingMode::Paged { page_size: 10 })
    }

    #[tokio::test]
    async fn nothing_loads_before_a_selection() {
        let api = Arc::new(FakeApi::with_runs(10));
        let mut sync = engine(&api);
        let rect = Rect::new(0, 0, 100, 20);
        assert!(matches!(
            sync.sync_region(&rect).await,
            Err(SyncError::NoActiveProposal)
        ));
        assert!(matches!(
            sync.fetch_all_extracted("energy").await,
            Err(SyncError::NoActiveProposal)
        ));
    }

    #[tokio::test]
    async fn selection_then_scroll_fills_the_store() {
        let api = Arc::new(FakeApi::with_runs(60));
        let mut sync = engine(&api);
        let _feed = sync.select("2956").await.unwrap();
        let summary = sync.sync_region(&Rect::new(0, 0, 100, 20)).await.unwrap();
        assert_eq!(summary.loaded, vec![1, 2, 3]);
        assert_eq!(sync.store().read().await.data().len(), 30);
        assert_eq!(sync.paginator().unwrap().loaded_pages(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn switching_proposal_starts_with_fresh_pages() {
        let api = Arc::new(FakeApi::with_runs(60));
        let mut sync = engine(&api);
        let _first = sync.select("2956").await.unwrap();
        sync.sync_region(&Rect::new(0, 0, 100, 5)).await.unwrap();
        sync.fetch_extracted(1, "trace").await.unwrap();

        let _second = sync.select("3000").await.unwrap();
        let paginator = sync.paginator().unwrap();
        assert_eq!(paginator.proposal(), "3000");
        assert!(paginator.loaded_pages().is_empty());
        assert!(sync.extracted().is_empty());
        assert!(sync.store().read().await.data().is_empty());
    }

    #[tokio::test]
    async fn missing_proposal_leaves_no_paginator() {
        let api = Arc::new(FakeApi::with_runs(5));
        let mut sync = engine(&api);
        assert!(sync.select(MISSING_PROPOSAL).await.is_err());
        assert!(sync.paginator().is_none());
        assert!(sync.status().not_found);
    }

    #[test]
    fn engine_builds_from_config() {
        let config = ClientConfig::new("http://localhost:8000").with_page_size(25);
        let sync = DashboardSync::from_config(config).unwrap();
        assert_eq!(sync.mode, PagingMode::Paged { page_size: 25 });
        assert_eq!(sync.status(), ProposalStatus::default());
    }
}
