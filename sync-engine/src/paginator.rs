use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use damnit_client::{DashboardApi, FULL_TABLE_PAGE_SIZE};
use futures::future::join_all;
use table_core::{visible_pages, Pages, Rect};
use tracing::{debug, warn};

use crate::orchestrator::{fetch_page, PageFetch};
use crate::{StoreHandle, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// Pages follow the viewport.
    Paged { page_size: u32 },
    /// The whole table in one request.
    FullTable,
}

#[derive(Debug)]
pub enum PageLoad {
    /// Already loading or loaded.
    Skipped,
    Loaded(PageFetch),
}

/// What one viewport evaluation did. Failures are reported here and never
/// raised to the caller.
#[derive(Debug, Default)]
pub struct RegionSync {
    pub requested: Vec<u32>,
    pub loaded: Vec<u32>,
    pub failed: Vec<(u32, SyncError)>,
}

impl RegionSync {
    pub fn is_idle(&self) -> bool {
        self.requested.is_empty()
    }
}

/// Viewport-driven loader for one proposal. A new proposal gets a new
/// paginator.
pub struct Paginator<A: ?Sized> {
    api: Arc<A>,
    store: StoreHandle,
    proposal: String,
    mode: PagingMode,
    /// Store generation this paginator was created under.
    generation: u64,
    pages: Mutex<Pages>,
    failed: Mutex<BTreeSet<u32>>,
}

impl<A: DashboardApi + ?Sized> Paginator<A> {
    pub fn new(api: Arc<A>, store: StoreHandle, proposal: impl Into<String>, page_size: u32) -> Self {
        Self::with_mode(
            api,
            store,
            proposal,
            PagingMode::Paged {
                page_size: page_size.max(1),
            },
        )
    }

    pub fn with_mode(
        api: Arc<A>,
        store: StoreHandle,
        proposal: impl Into<String>,
        mode: PagingMode,
    ) -> Self {
        Self {
            generation: store.generation(),
            api,
            store,
            proposal: proposal.into(),
            mode,
            pages: Mutex::new(Pages::new()),
            failed: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn proposal(&self) -> &str {
        &self.proposal
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    pub fn page_size(&self) -> u32 {
        match self.mode {
            PagingMode::Paged { page_size } => page_size,
            PagingMode::FullTable => FULL_TABLE_PAGE_SIZE,
        }
    }

    pub fn is_loading(&self, page: u32) -> bool {
        lock(&self.pages).is_loading(page)
    }

    pub fn is_loaded(&self, page: u32) -> bool {
        lock(&self.pages).is_loaded(page)
    }

    pub fn loaded_pages(&self) -> Vec<u32> {
        lock(&self.pages).loaded().to_vec()
    }

    pub fn failed_pages(&self) -> Vec<u32> {
        lock(&self.failed).iter().copied().collect()
    }

    /// Load a 1-based page once. Concurrent calls for the same page result
    /// in a single fetch. A page whose load fails or is dropped before it
    /// finishes is released and recorded as failed, so it can be tried again.
    pub async fn load_page(&self, page: u32) -> Result<PageLoad, SyncError> {
        if page == 0 || !lock(&self.pages).try_begin(page) {
            return Ok(PageLoad::Skipped);
        }
        let claim = PageClaim {
            pages: &self.pages,
            failed: &self.failed,
            page,
            finished: false,
        };
        debug!(proposal = %self.proposal, page, "loading page");

        let result = fetch_page(
            self.api.as_ref(),
            &self.store,
            self.generation,
            &self.proposal,
            page,
            self.page_size(),
        )
        .await;
        match result {
            Ok(fetch) => {
                claim.finish();
                debug!(proposal = %self.proposal, page, rows = fetch.rows, "page loaded");
                Ok(PageLoad::Loaded(fetch))
            }
            Err(err) => {
                warn!(proposal = %self.proposal, page, error = %err, "page load failed");
                Err(err)
            }
        }
    }

    /// Make sure every page touching `rect` (plus half a page either side) is
    /// loaded or loading. Safe to call on every scroll event.
    pub async fn sync_region(&self, rect: &Rect) -> RegionSync {
        let pages: Vec<u32> = match self.mode {
            PagingMode::FullTable => vec![1],
            PagingMode::Paged { page_size } => match visible_pages(rect, page_size) {
                Some(range) => range.requested_pages().collect(),
                None => Vec::new(),
            },
        };
        self.load_pages(pages).await
    }

    /// Re-issue loads for pages whose last attempt failed.
    pub async fn retry_failed(&self) -> RegionSync {
        let pages = self.failed_pages();
        self.load_pages(pages).await
    }

    async fn load_pages(&self, pages: Vec<u32>) -> RegionSync {
        let pending: Vec<u32> = pages
            .into_iter()
            .filter(|page| !self.is_loaded(*page))
            .collect();
        let results = join_all(pending.iter().map(|page| self.load_page(*page))).await;

        let mut summary = RegionSync {
            requested: pending.clone(),
            ..Default::default()
        };
        for (page, result) in pending.into_iter().zip(results) {
            match result {
                Ok(PageLoad::Loaded(_)) => summary.loaded.push(page),
                Ok(PageLoad::Skipped) => {}
                Err(err) => summary.failed.push((page, err)),
            }
        }
        summary
    }
}

/// A page marked loading. Unless finished, dropping it releases the page
/// and records it as failed.
struct PageClaim<'a> {
    pages: &'a Mutex<Pages>,
    failed: &'a Mutex<BTreeSet<u32>>,
    page: u32,
    finished: bool,
}

impl PageClaim<'_> {
    fn finish(mut self) {
        self.finished = true;
        lock(self.pages).add_to_loaded(self.page);
        lock(self.failed).remove(&self.page);
    }
}

impl Drop for PageClaim<'_> {
    fn drop(&mut self) {
        if !self.finished {
            lock(self.pages).remove_from_loading(self.page);
            lock(self.failed).insert(self.page);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
