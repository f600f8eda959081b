//! Keeps the store in step with the server for the selected proposal.
//!
//! Selecting a proposal wipes the store, runs the one-shot refresh and only
//! then opens the live feed, with the refreshed timestamp as its cursor.
//! A feed that drops is reopened at the last cursor seen.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use damnit_client::{sleep, DashboardApi, RetryPolicy};
use data_feed::TableEvent;
use futures::future::{AbortHandle, Abortable, Aborted, LocalBoxFuture};
use futures::{FutureExt, StreamExt};
use table_core::Timestamp;
use tracing::{debug, info, warn};

use crate::{StoreHandle, SyncError};

#[derive(Debug, Clone, PartialEq)]
pub enum SyncState {
    Idle,
    /// Refresh in flight.
    Pending { proposal: String },
    Subscribed { proposal: String, cursor: Timestamp },
    /// Terminal for this proposal.
    NotFound { proposal: String },
    /// The server completed the feed or it failed for good; the store keeps
    /// what it had.
    Disconnected { proposal: String, cursor: Timestamp },
}

impl SyncState {
    pub fn proposal(&self) -> Option<&str> {
        match self {
            SyncState::Idle => None,
            SyncState::Pending { proposal }
            | SyncState::Subscribed { proposal, .. }
            | SyncState::NotFound { proposal }
            | SyncState::Disconnected { proposal, .. } => Some(proposal),
        }
    }

    pub fn cursor(&self) -> Option<Timestamp> {
        match self {
            SyncState::Subscribed { cursor, .. } | SyncState::Disconnected { cursor, .. } => {
                Some(*cursor)
            }
            _ => None,
        }
    }
}

/// Flat view for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposalStatus {
    pub value: Option<String>,
    pub loading: bool,
    pub not_found: bool,
}

impl From<&SyncState> for ProposalStatus {
    fn from(state: &SyncState) -> Self {
        ProposalStatus {
            value: state.proposal().map(str::to_string),
            loading: matches!(state, SyncState::Pending { .. }),
            not_found: matches!(state, SyncState::NotFound { .. }),
        }
    }
}

/// The live feed of the selected proposal. The host must drive it, e.g. with
/// `spawn_local`. Transient failures are reconnected; it resolves when the
/// server completes the feed, on a permanent failure, or when a later
/// selection aborts it.
pub type LiveFeed = Abortable<LocalBoxFuture<'static, ()>>;

pub struct Reconciler<A: ?Sized> {
    api: Arc<A>,
    store: StoreHandle,
    state: Arc<Mutex<SyncState>>,
    feed: Option<AbortHandle>,
    reconnect_delay: Duration,
}

impl<A: DashboardApi + ?Sized + 'static> Reconciler<A> {
    pub fn new(api: Arc<A>, store: StoreHandle) -> Self {
        Self {
            api,
            store,
            state: Arc::new(Mutex::new(SyncState::Idle)),
            feed: None,
            reconnect_delay: RetryPolicy::default().delay,
        }
    }

    /// Pause before reopening a dropped feed. Applies to feeds started later.
    pub fn set_reconnect_delay(&mut self, delay: Duration) {
        self.reconnect_delay = delay;
    }

    pub fn state(&self) -> SyncState {
        lock(&self.state).clone()
    }

    pub fn status(&self) -> ProposalStatus {
        ProposalStatus::from(&*lock(&self.state))
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    /// Switch to `proposal`. Re-selecting the active proposal while it is
    /// subscribed is a no-op and returns `Ok(None)`.
    pub async fn select(&mut self, proposal: &str) -> Result<Option<LiveFeed>, SyncError> {
        if let SyncState::Subscribed { proposal: current, .. } = &*lock(&self.state) {
            if current == proposal && self.feed.is_some() {
                return Ok(None);
            }
        }
        self.stop_feed();
        self.store.apply(TableEvent::Reset).await;
        self.set_state(SyncState::Pending {
            proposal: proposal.to_string(),
        });

        let metadata = match self.api.refresh(proposal).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(proposal, error = %err, "refresh failed");
                self.set_state(SyncState::NotFound {
                    proposal: proposal.to_string(),
                });
                return Err(SyncError::NotFound {
                    proposal: proposal.to_string(),
                });
            }
        };

        let cursor = metadata.timestamp;
        self.store.apply(TableEvent::Refreshed(metadata)).await;
        self.set_state(SyncState::Subscribed {
            proposal: proposal.to_string(),
            cursor,
        });

        let (handle, registration) = AbortHandle::new_pair();
        self.feed = Some(handle);
        let feed = run_feed(
            Arc::clone(&self.api),
            self.store.clone(),
            Arc::clone(&self.state),
            proposal.to_string(),
            cursor,
            self.reconnect_delay,
        )
        .boxed_local();
        Ok(Some(Abortable::new(feed, registration)))
    }

    /// Drop the selection and everything loaded for it.
    pub async fn clear(&mut self) {
        self.stop_feed();
        self.store.apply(TableEvent::Reset).await;
        self.set_state(SyncState::Idle);
    }

    fn stop_feed(&mut self) {
        if let Some(handle) = self.feed.take() {
            debug!("closing live feed");
            handle.abort();
        }
    }

    fn set_state(&self, next: SyncState) {
        info!(state = ?next, "sync state");
        *lock(&self.state) = next;
    }
}

impl<A: ?Sized> Drop for Reconciler<A> {
    fn drop(&mut self) {
        if let Some(handle) = self.feed.take() {
            handle.abort();
        }
    }
}

async fn run_feed<A>(
    api: Arc<A>,
    store: StoreHandle,
    state: Arc<Mutex<SyncState>>,
    proposal: String,
    mut cursor: Timestamp,
    reconnect_delay: Duration,
) where
    A: DashboardApi + ?Sized,
{
    loop {
        debug!(proposal = %proposal, cursor, "subscribing");
        let mut stream = api.subscribe_latest(&proposal, cursor);
        let failure = loop {
            match stream.next().await {
                Some(Ok(update)) => {
                    let timestamp = update.metadata.timestamp;
                    store.apply(TableEvent::Latest(update)).await;
                    if timestamp > cursor {
                        cursor = timestamp;
                        *lock(&state) = SyncState::Subscribed {
                            proposal: proposal.clone(),
                            cursor,
                        };
                    }
                }
                Some(Err(err)) => break Some(err),
                None => break None,
            }
        };
        match failure {
            Some(err) if err.is_transient() => {
                warn!(proposal = %proposal, cursor, error = %err, "live feed dropped, reconnecting");
                sleep(reconnect_delay).await;
            }
            Some(err) => {
                warn!(proposal = %proposal, error = %err, "live feed failed");
                break;
            }
            None => break,
        }
    }
    info!(proposal = %proposal, cursor, "live feed closed");
    *lock(&state) = SyncState::Disconnected { proposal, cursor };
}

/// Whether a feed future ended because a newer selection replaced it.
pub fn was_replaced(result: &Result<(), Aborted>) -> bool {
    result.is_err()
}

fn lock(state: &Mutex<SyncState>) -> MutexGuard<'_, SyncState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
