//! JSON file token storage.
//!
//! Tokens live in a single JSON object file. Writes go to a temp file that is
//! renamed over the original, so a concurrent reader never sees a torn file.
//! Changes made by other processes are picked up by a polling task started on
//! the first `subscribe`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{DurableStore, StorageError, StorageEvent, EVENT_CHANNEL_CAPACITY};

/// Token file name in the cache directory
pub const TOKEN_FILE: &str = "session.json";

type Entries = HashMap<String, String>;

struct FileInner {
    path: PathBuf,
    /// Contents as of this handle's last read or write. Guards all file I/O.
    last_seen: Mutex<Entries>,
    events: broadcast::Sender<StorageEvent>,
    poll_interval: Duration,
    watching: AtomicBool,
}

pub struct FileStore {
    inner: Arc<FileInner>,
}

impl FileStore {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        let initial = match read_entries(&path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable token file");
                Entries::new()
            }
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(FileInner {
                path,
                last_seen: Mutex::new(initial),
                events,
                poll_interval,
                watching: AtomicBool::new(false),
            }),
        }
    }

    /// Token file inside the given cache directory
    pub fn in_dir(cache_dir: &Path, poll_interval: Duration) -> Self {
        Self::new(cache_dir.join(TOKEN_FILE), poll_interval)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn start_watching(&self) {
        if self.inner.watching.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime; token file changes from other processes will not be seen");
            self.inner.watching.store(false, Ordering::SeqCst);
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.poll_interval;
        runtime.spawn(poll_for_changes(weak, interval));
    }
}

impl FileInner {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read-modify-write under the lock. Changes other processes made since
    /// this handle last looked are announced before ours is applied.
    fn update(&self, apply: impl FnOnce(&mut Entries) -> bool) -> Result<(), StorageError> {
        let mut last_seen = self.lock();
        let (mut entries, corrupt) = match read_entries(&self.path) {
            Ok(entries) => (entries, false),
            Err(StorageError::Serialization(e)) => {
                warn!(path = %self.path.display(), error = %e, "Overwriting corrupt token file");
                (Entries::new(), true)
            }
            Err(e) => return Err(e),
        };
        self.announce_changes(&last_seen, &entries);
        let changed = apply(&mut entries);
        *last_seen = entries;
        if changed || corrupt {
            write_entries(&self.path, &last_seen)?;
        }
        Ok(())
    }

    /// Compare the file against what this handle last saw and announce differences
    fn detect_changes(&self) {
        let mut last_seen = self.lock();
        let current = match read_entries(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(error = %e, "Skipping token file poll");
                return;
            }
        };
        self.announce_changes(&last_seen, &current);
        *last_seen = current;
    }

    fn announce_changes(&self, last_seen: &Entries, current: &Entries) {
        if current == last_seen {
            return;
        }
        for (key, value) in current {
            if last_seen.get(key) != Some(value) {
                let _ = self
                    .events
                    .send(StorageEvent::new(key.clone(), Some(value.clone())));
            }
        }
        for key in last_seen.keys().filter(|k| !current.contains_key(*k)) {
            let _ = self.events.send(StorageEvent::new(key.clone(), None));
        }
        debug!(path = %self.path.display(), "Token file changed externally");
    }
}

async fn poll_for_changes(inner: Weak<FileInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.detect_changes();
    }
}

fn read_entries(path: &Path) -> Result<Entries, StorageError> {
    if !path.exists() {
        return Ok(Entries::new());
    }
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(Entries::new());
    }
    Ok(serde_json::from_str(&contents)?)
}

fn write_entries(path: &Path, entries: &Entries) -> Result<(), StorageError> {
    if entries.is_empty() {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(entries)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl DurableStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let _guard = self.inner.lock();
        Ok(read_entries(&self.inner.path)?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.inner.update(|entries| {
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        })
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.inner.update(|entries| entries.remove(key).is_some())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        let receiver = self.inner.events.subscribe();
        self.start_watching();
        receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};
    use tempfile::TempDir;

    const POLL: Duration = Duration::from_millis(20);

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(dir.path(), POLL);
        store.set(ACCESS_TOKEN_KEY, "A1").unwrap();
        store.set(REFRESH_TOKEN_KEY, "R1").unwrap();
        drop(store);

        let reopened = FileStore::in_dir(dir.path(), POLL);
        assert_eq!(reopened.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("A1"));
        assert_eq!(reopened.get(REFRESH_TOKEN_KEY).unwrap().as_deref(), Some("R1"));
    }

    #[test]
    fn test_removing_last_key_deletes_file() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(dir.path(), POLL);
        store.set(ACCESS_TOKEN_KEY, "A1").unwrap();
        assert!(store.path().exists());

        store.remove(ACCESS_TOKEN_KEY).unwrap();
        store.remove(ACCESS_TOKEN_KEY).unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(TOKEN_FILE), "{not json").unwrap();
        let store = FileStore::in_dir(dir.path(), POLL);
        assert!(matches!(
            store.get(ACCESS_TOKEN_KEY),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_writes_replace_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(TOKEN_FILE);
        std::fs::write(&path, "{not json").unwrap();
        let store = FileStore::in_dir(dir.path(), POLL);

        store.set(ACCESS_TOKEN_KEY, "A1").unwrap();
        let reopened = FileStore::in_dir(dir.path(), POLL);
        assert_eq!(reopened.get(ACCESS_TOKEN_KEY).unwrap().as_deref(), Some("A1"));

        // A removal that finds nothing to remove still clears the garbage
        std::fs::write(&path, "{not json").unwrap();
        store.remove(REFRESH_TOKEN_KEY).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_write_announces_external_change_seen_first() {
        let dir = TempDir::new().unwrap();
        let ours = FileStore::in_dir(dir.path(), POLL);
        let theirs = FileStore::in_dir(dir.path(), POLL);
        ours.set(ACCESS_TOKEN_KEY, "A1").unwrap();
        ours.set(REFRESH_TOKEN_KEY, "R1").unwrap();

        // No runtime, so no poller: only the write can notice the removal
        let mut events = ours.inner.events.subscribe();
        theirs.remove(REFRESH_TOKEN_KEY).unwrap();
        ours.set(ACCESS_TOKEN_KEY, "A2").unwrap();

        assert_eq!(events.try_recv().unwrap(), StorageEvent::new(REFRESH_TOKEN_KEY, None));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detects_writes_from_other_process() {
        let dir = TempDir::new().unwrap();
        let ours = FileStore::in_dir(dir.path(), POLL);
        let theirs = FileStore::in_dir(dir.path(), POLL);
        ours.set(ACCESS_TOKEN_KEY, "A1").unwrap();

        let mut events = ours.subscribe();
        theirs.remove(ACCESS_TOKEN_KEY).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("no change detected")
            .unwrap();
        assert_eq!(event, StorageEvent::new(ACCESS_TOKEN_KEY, None));
    }

    #[tokio::test]
    async fn test_own_writes_are_not_reported() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::in_dir(dir.path(), POLL);
        let mut events = store.subscribe();

        store.set(ACCESS_TOKEN_KEY, "A1").unwrap();
        tokio::time::sleep(POLL * 5).await;

        assert!(events.try_recv().is_err());
    }
}
