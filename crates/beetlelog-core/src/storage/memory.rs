use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::trace;

use super::{DurableStore, StorageError, StorageEvent, EVENT_CHANNEL_CAPACITY};

struct Listener {
    context_id: u64,
    events: broadcast::Sender<StorageEvent>,
}

struct SharedInner {
    entries: Mutex<HashMap<String, String>>,
    listeners: Mutex<Vec<Listener>>,
    next_context: AtomicU64,
}

/// Storage shared by several execution contexts within one process.
///
/// Behaves like same-origin browser local storage: every context sees the
/// same values, and a write from one context is announced to all the others.
#[derive(Clone)]
pub struct SharedStorage {
    inner: Arc<SharedInner>,
}

impl SharedStorage {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SharedInner {
                entries: Mutex::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_context: AtomicU64::new(0),
            }),
        }
    }

    /// Open a handle for a new execution context
    pub fn context(&self) -> MemoryStore {
        let context_id = self.inner.next_context.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Listener {
                context_id,
                events: events.clone(),
            });

        MemoryStore {
            context_id,
            events,
            shared: Arc::clone(&self.inner),
        }
    }
}

impl Default for SharedStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// One execution context's handle onto a `SharedStorage`.
pub struct MemoryStore {
    context_id: u64,
    events: broadcast::Sender<StorageEvent>,
    shared: Arc<SharedInner>,
}

impl MemoryStore {
    /// A standalone store with no sibling contexts
    pub fn new() -> Self {
        SharedStorage::new().context()
    }

    fn announce(&self, key: &str, value: Option<&str>) {
        let listeners = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter().filter(|l| l.context_id != self.context_id) {
            // No receivers yet is fine; that context is not listening
            let _ = listener
                .events
                .send(StorageEvent::new(key, value.map(str::to_string)));
        }
        trace!(key, from = self.context_id, "Announced storage change");
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| l.context_id != self.context_id);
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        self.announce(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let existed = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some();
        if existed {
            self.announce(key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
