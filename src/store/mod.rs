//! Durable key-value metadata for mirrored repositories.
//!
//! A single embedded [`redb`] database holds two independent namespaces,
//! mirror state and usage counters, both keyed by canonical `owner/name`
//! strings.  Every call runs in its own transaction; there is no
//! cross-key transaction and no locking beyond per-call atomicity, so
//! read-modify-write sequences must be serialized by the caller.

pub mod key;
pub mod records;
pub mod tables;

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, TableError};
use thiserror::Error;
use tracing::{debug, info};

pub use key::{InvalidKey, RepoKey};
pub use records::{MirrorState, UsageCounters};
pub use tables::{Record, RecordKind};

/// Records fetched per read transaction while scanning.
const SCAN_PAGE_SIZE: usize = 128;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("metadata store unavailable: {0}")]
    Unavailable(#[source] redb::Error),

    #[error("failed to prepare metadata store directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt {kind} record for {key}: {source}")]
    Decode {
        kind: RecordKind,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {kind} record for {key}: {source}")]
    Encode {
        kind: RecordKind,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("metadata store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn unavailable(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Unavailable(err.into())
}

// ---------------------------------------------------------------------------
// MetadataStore
// ---------------------------------------------------------------------------

/// Handle to the embedded metadata database.  Cheap to clone.
#[derive(Clone)]
pub struct MetadataStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl MetadataStore {
    /// Open (or create) the database at `path`, creating both namespaces.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let db = Database::create(path).map_err(unavailable)?;

        let txn = db.begin_write().map_err(unavailable)?;
        for kind in RecordKind::ALL {
            txn.open_table(kind.table()).map_err(unavailable)?;
        }
        txn.commit().map_err(unavailable)?;

        info!(path = %path.display(), "metadata store opened");
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert `record` under `key` in its namespace.
    pub fn put<R: Record>(&self, key: &str, record: &R) -> Result<(), StoreError> {
        let value = serde_json::to_vec(record).map_err(|source| StoreError::Encode {
            kind: R::KIND,
            key: key.to_string(),
            source,
        })?;

        let txn = self.db.begin_write().map_err(unavailable)?;
        {
            let mut table = txn.open_table(R::KIND.table()).map_err(unavailable)?;
            table.insert(key, value.as_slice()).map_err(unavailable)?;
        }
        txn.commit().map_err(unavailable)?;

        debug!(kind = %R::KIND, %key, "record written");
        Ok(())
    }

    /// Fetch the record under `key`.  An absent key is `Ok(None)`.
    pub fn get<R: Record>(&self, key: &str) -> Result<Option<R>, StoreError> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = match txn.open_table(R::KIND.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        };

        let Some(value) = table.get(key).map_err(unavailable)? else {
            return Ok(None);
        };
        decode::<R>(key, value.value()).map(Some)
    }

    /// Lazily iterate every record of one kind in key order.
    ///
    /// Each call starts a fresh scan; pages are read in separate
    /// transactions, so the sequence is not a point-in-time snapshot.
    pub fn scan<R: Record>(&self) -> Scan<R> {
        Scan {
            db: Arc::clone(&self.db),
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
            _record: PhantomData,
        }
    }

    /// Cheap liveness probe used by the health check.
    pub fn check(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        txn.open_table(RecordKind::MirrorState.table())
            .map_err(unavailable)?;
        Ok(())
    }

    /// Release this handle.  The database file is closed once the last
    /// clone is dropped.
    pub fn close(self) {
        let remaining = Arc::strong_count(&self.db) - 1;
        info!(path = %self.path.display(), remaining, "metadata store handle closed");
    }
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn decode<R: Record>(key: &str, bytes: &[u8]) -> Result<R, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Decode {
        kind: R::KIND,
        key: key.to_string(),
        source,
    })
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

/// Lazy, finite iterator over one record namespace.
pub struct Scan<R> {
    db: Arc<Database>,
    after: Option<String>,
    buffer: VecDeque<(String, Vec<u8>)>,
    exhausted: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Scan<R> {
    fn fill(&mut self) -> Result<(), StoreError> {
        let txn = self.db.begin_read().map_err(unavailable)?;
        let table = match txn.open_table(R::KIND.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => {
                self.exhausted = true;
                return Ok(());
            }
            Err(e) => return Err(unavailable(e)),
        };

        let after = self.after.clone();
        let bounds: (Bound<&str>, Bound<&str>) = match after.as_deref() {
            Some(last) => (Bound::Excluded(last), Bound::Unbounded),
            None => (Bound::Unbounded, Bound::Unbounded),
        };

        let mut page = Vec::with_capacity(SCAN_PAGE_SIZE);
        for entry in table.range::<&str>(bounds).map_err(unavailable)?.take(SCAN_PAGE_SIZE) {
            let (key, value) = entry.map_err(unavailable)?;
            page.push((key.value().to_string(), value.value().to_vec()));
        }

        if page.len() < SCAN_PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((last, _)) = page.last() {
            self.after = Some(last.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl<R: Record> Iterator for Scan<R> {
    type Item = Result<R, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((key, bytes)) = self.buffer.pop_front() {
                return Some(decode::<R>(&key, &bytes));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn open_temp() -> (tempfile::TempDir, MetadataStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(tmp.path().join("db").join("metadata.redb")).unwrap();
        (tmp, store)
    }

    fn key(owner: &str, name: &str) -> RepoKey {
        RepoKey::new(owner, name).unwrap()
    }

    #[test]
    fn get_missing_key_is_not_found_without_error() {
        let (_tmp, store) = open_temp();
        let state: Option<MirrorState> = store.get("alice/repo1").unwrap();
        assert!(state.is_none());
    }

    #[test]
    fn mirror_state_round_trips_exactly() {
        let (_tmp, store) = open_temp();
        let k = key("alice", "repo1");
        let state = MirrorState::new(
            &k,
            "https://github.com/alice/repo1",
            "0123456789abcdef0123456789abcdef01234567",
            Utc::now(),
            Duration::from_nanos(1_800_000_000_123),
        );
        store.put(&k.canonical(), &state).unwrap();

        let back: MirrorState = store.get(&k.canonical()).unwrap().unwrap();
        assert_eq!(back, state);
        assert_eq!(
            back.expires_at.timestamp_nanos_opt(),
            state.expires_at.timestamp_nanos_opt()
        );
    }

    #[test]
    fn namespaces_are_independent() {
        let (_tmp, store) = open_temp();
        let k = key("alice", "repo1");
        store
            .put(&k.canonical(), &UsageCounters::zeroed(&k))
            .unwrap();

        let state: Option<MirrorState> = store.get(&k.canonical()).unwrap();
        assert!(state.is_none());
        let counters: Option<UsageCounters> = store.get(&k.canonical()).unwrap();
        assert_eq!(counters.unwrap().clone_count, 0);
    }

    #[test]
    fn put_overwrites_existing_record() {
        let (_tmp, store) = open_temp();
        let k = key("alice", "repo1");
        let mut counters = UsageCounters::zeroed(&k);
        store.put(&k.canonical(), &counters).unwrap();
        counters.request_count = 7;
        store.put(&k.canonical(), &counters).unwrap();

        let back: UsageCounters = store.get(&k.canonical()).unwrap().unwrap();
        assert_eq!(back.request_count, 7);
        assert_eq!(store.scan::<UsageCounters>().count(), 1);
    }

    #[test]
    fn scan_spans_multiple_pages_in_key_order() {
        let (_tmp, store) = open_temp();
        let total = SCAN_PAGE_SIZE * 2 + 5;
        for i in 0..total {
            let k = key("owner", &format!("repo{i:04}"));
            store
                .put(&k.canonical(), &UsageCounters::zeroed(&k))
                .unwrap();
        }

        let names: Vec<String> = store
            .scan::<UsageCounters>()
            .map(|r| r.unwrap().name)
            .collect();
        assert_eq!(names.len(), total);
        assert!(names.windows(2).all(|w| w[0] < w[1]));

        // A second scan restarts from the beginning.
        assert_eq!(store.scan::<UsageCounters>().count(), total);
    }

    #[test]
    fn scan_of_empty_namespace_is_empty() {
        let (_tmp, store) = open_temp();
        assert_eq!(store.scan::<MirrorState>().count(), 0);
    }

    #[test]
    fn corrupt_value_surfaces_decode_error() {
        let (_tmp, store) = open_temp();
        let txn = store.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(tables::MIRROR_STATE).unwrap();
            table.insert("alice/repo1", b"not json".as_slice()).unwrap();
        }
        txn.commit().unwrap();

        let err = store.get::<MirrorState>("alice/repo1").unwrap_err();
        assert!(matches!(err, StoreError::Decode { kind: RecordKind::MirrorState, .. }));

        let scanned: Vec<_> = store.scan::<MirrorState>().collect();
        assert_eq!(scanned.len(), 1);
        assert!(scanned[0].is_err());
    }

    #[test]
    fn reopening_preserves_records() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("metadata.redb");
        let k = key("bob", "tools");
        {
            let store = MetadataStore::open(&path).unwrap();
            store
                .put(&k.canonical(), &UsageCounters::zeroed(&k))
                .unwrap();
            store.close();
        }
        let store = MetadataStore::open(&path).unwrap();
        let back: Option<UsageCounters> = store.get(&k.canonical()).unwrap();
        assert!(back.is_some());
    }
}
