//! redb table definitions for the metadata store.
//!
//! Each table uses `&str` keys (canonical `owner/name`) and `&[u8]` values
//! holding JSON-serialized records.

use std::fmt;

use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Mirror state records keyed by `owner/name`.
pub const MIRROR_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("state");

/// Usage counter records keyed by `owner/name`.
pub const USAGE_COUNTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("counters");

/// The two record namespaces held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    MirrorState,
    UsageCounters,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::MirrorState, RecordKind::UsageCounters];

    pub fn table(self) -> TableDefinition<'static, &'static str, &'static [u8]> {
        match self {
            RecordKind::MirrorState => MIRROR_STATE,
            RecordKind::UsageCounters => USAGE_COUNTERS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordKind::MirrorState => "state",
            RecordKind::UsageCounters => "counters",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value type persisted in exactly one [`RecordKind`] namespace.
pub trait Record: Serialize + DeserializeOwned + Send + 'static {
    const KIND: RecordKind;
}
