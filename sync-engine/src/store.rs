use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use data_feed::{DataSink, TableEvent, TableStore};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, MutexGuard};

/// Shared handle to the table cache. Every write is one event applied under
/// the lock, then forwarded to subscribers.
///
/// The generation counts resets. Writers that started under an older
/// generation use [`StoreHandle::apply_if`] so their results never land in
/// the store of a later selection.
#[derive(Debug, Clone, Default)]
pub struct StoreHandle {
    store: Arc<Mutex<TableStore>>,
    generation: Arc<AtomicU64>,
    listeners: Arc<StdMutex<Vec<UnboundedSender<TableEvent>>>>,
}

impl StoreHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub async fn apply(&self, event: TableEvent) {
        let mut store = self.store.lock().await;
        self.commit(&mut store, event);
    }

    /// Apply `event` unless the store was reset after `generation` was read.
    /// Returns whether the event was applied.
    pub async fn apply_if(&self, generation: u64, event: TableEvent) -> bool {
        let mut store = self.store.lock().await;
        if self.generation() != generation {
            return false;
        }
        self.commit(&mut store, event);
        true
    }

    fn commit(&self, store: &mut TableStore, event: TableEvent) {
        if matches!(event, TableEvent::Reset) {
            self.generation.fetch_add(1, Ordering::AcqRel);
        }
        store.on_event(event.clone());
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Events applied from now on, in application order.
    pub fn subscribe(&self) -> UnboundedReceiver<TableEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Read access. Do not hold the guard across an await.
    pub async fn read(&self) -> MutexGuard<'_, TableStore> {
        self.store.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use table_core::TableMetadata;

    #[tokio::test]
    async fn subscribers_see_applied_events() {
        let store = StoreHandle::new();
        let mut rx = store.subscribe();
        let meta = TableMetadata {
            timestamp: 3.0,
            ..Default::default()
        };
        store.apply(TableEvent::Refreshed(meta)).await;
        assert_eq!(store.read().await.timestamp(), 3.0);
        assert!(matches!(rx.try_next(), Ok(Some(TableEvent::Refreshed(_)))));
    }

    #[tokio::test]
    async fn events_from_before_a_reset_are_dropped() {
        let store = StoreHandle::new();
        let before = store.generation();
        let meta = TableMetadata {
            timestamp: 3.0,
            ..Default::default()
        };
        assert!(store.apply_if(before, TableEvent::Refreshed(meta.clone())).await);

        store.apply(TableEvent::Reset).await;
        assert_eq!(store.generation(), before + 1);
        assert!(!store.apply_if(before, TableEvent::Refreshed(meta)).await);
        assert_eq!(store.read().await.timestamp(), 0.0);
    }
}
