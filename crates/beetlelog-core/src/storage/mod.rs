//! Durable token storage.
//!
//! The session store mirrors its token pair into a `DurableStore` so that it
//! survives restarts and so that other execution contexts (browser-style tabs,
//! sibling processes) can observe logins and logouts. Three backends exist:
//!
//! - `SharedStorage` / `MemoryStore`: an in-process map shared by several
//!   context handles, notifying every handle except the writer
//! - `FileStore`: a JSON token file, polled for changes made by other processes
//! - `KeychainStore`: OS keychain entries for secure on-device storage

pub mod file;
pub mod keychain;
pub mod memory;

use thiserror::Error;
use tokio::sync::broadcast;

pub use file::FileStore;
pub use keychain::KeychainStore;
pub use memory::{MemoryStore, SharedStorage};

/// Storage key for the short-lived access token
pub const ACCESS_TOKEN_KEY: &str = "access-token";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh-token";

/// Buffer size for change-notification channels.
/// Only two keys exist, so a subscriber falling this far behind resyncs instead.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 32;

/// A change to one key, made by some other execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// New value, or `None` when the key was removed
    pub value: Option<String>,
}

impl StorageEvent {
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Token storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Token file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] ::keyring::Error),
}

/// Key/value storage that outlives the process.
///
/// Writes to separate keys are not atomic as a pair; readers must tolerate
/// seeing one key updated and the other stale.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<(), StorageError>;

    /// Subscribe to changes made by *other* execution contexts.
    /// The handle's own writes are never reported back to it.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}
