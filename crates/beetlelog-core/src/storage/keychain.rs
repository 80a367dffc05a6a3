use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use tokio::sync::broadcast;

use super::{DurableStore, StorageError, StorageEvent, EVENT_CHANNEL_CAPACITY};

/// Default keychain service name
pub const SERVICE_NAME: &str = "beetlelog";

/// Tokens kept in the OS keychain, one entry per key.
///
/// The keychain is only written by this process, so `subscribe` never fires.
pub struct KeychainStore {
    service: String,
    entries: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<StorageEvent>,
}

impl KeychainStore {
    pub fn new(service: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            service: service.into(),
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn with_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(&Entry) -> keyring::Result<R>,
    ) -> Result<R, StorageError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains_key(key) {
            let entry = Entry::new(&self.service, key)?;
            entries.insert(key.to_string(), entry);
        }
        Ok(f(&entries[key])?)
    }
}

impl Default for KeychainStore {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl DurableStore for KeychainStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e),
        })
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.with_entry(key, |entry| entry.set_password(value))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
