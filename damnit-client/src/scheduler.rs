//! Admission control for outgoing requests.
//!
//! Background requests (page prefetches and deferred heavy columns) share a
//! bounded number of slots and wait in FIFO order; interactive requests are
//! admitted immediately so that user actions never queue behind prefetches.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ClientError;

/// Tag attached to every request at its call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Interactive,
    Background,
}

#[derive(Debug, Default)]
struct GateState {
    active: usize,
    queue: VecDeque<oneshot::Sender<GatePermit>>,
}

#[derive(Debug, Clone)]
pub struct PriorityGate {
    max_active: usize,
    state: Arc<Mutex<GateState>>,
}

/// Held for the lifetime of a request. Dropping it, whether the request
/// succeeded, failed or was abandoned, hands the slot to the next waiter.
#[derive(Debug)]
pub struct GatePermit {
    state: Option<Arc<Mutex<GateState>>>,
}

impl PriorityGate {
    pub fn new(max_active: usize) -> Self {
        Self {
            max_active: max_active.max(1),
            state: Arc::new(Mutex::new(GateState::default())),
        }
    }

    pub fn max_active(&self) -> usize {
        self.max_active
    }

    /// Background requests currently holding a slot.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).active
    }

    /// Background requests waiting for a slot.
    pub fn queued(&self) -> usize {
        lock(&self.state).queue.len()
    }

    /// Reserve a place for a request. The queue position is taken when this
    /// is called, not when the returned future is first polled.
    pub fn admit(
        &self,
        priority: Priority,
    ) -> impl Future<Output = Result<GatePermit, ClientError>> + 'static {
        let ticket = match priority {
            Priority::Interactive => Ok(GatePermit { state: None }),
            Priority::Background => {
                let mut state = lock(&self.state);
                if state.active < self.max_active {
                    state.active += 1;
                    Ok(GatePermit {
                        state: Some(Arc::clone(&self.state)),
                    })
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.queue.push_back(tx);
                    debug!(queued = state.queue.len(), "background request queued");
                    Err(rx)
                }
            }
        };
        async move {
            match ticket {
                Ok(permit) => Ok(permit),
                Err(rx) => rx.await.map_err(|_| ClientError::Closed),
            }
        }
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        loop {
            let next = {
                let mut guard = lock(&state);
                match guard.queue.pop_front() {
                    Some(tx) => tx,
                    None => {
                        guard.active = guard.active.saturating_sub(1);
                        return;
                    }
                }
            };
            let handoff = GatePermit {
                state: Some(Arc::clone(&state)),
            };
            match next.send(handoff) {
                Ok(()) => return,
                // Waiter went away; its slot passes to the one behind it.
                Err(mut unused) => unused.state = None,
            }
        }
    }
}

fn lock(state: &Mutex<GateState>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
