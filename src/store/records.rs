//! Record schemas persisted by the metadata store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::key::RepoKey;
use super::tables::{Record, RecordKind};

/// Smallest TTL honoured; keeps `expires_at` strictly after `downloaded_at`.
const MIN_TTL: Duration = Duration::from_millis(1);

/// What the cache last observed about a repository's local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorState {
    pub owner: String,
    pub name: String,
    /// Last successful materialization or revalidation.
    pub downloaded_at: DateTime<Utc>,
    /// After this instant the mirror must be revalidated before use.
    pub expires_at: DateTime<Utc>,
    pub source_url: String,
    /// Remote head commit observed at `downloaded_at`.
    pub head_commit: String,
}

impl MirrorState {
    pub fn new(
        key: &RepoKey,
        source_url: &str,
        head_commit: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            owner: key.owner().to_string(),
            name: key.name().to_string(),
            downloaded_at: now,
            expires_at: expiry_after(now, ttl),
            source_url: source_url.to_string(),
            head_commit: head_commit.to_string(),
        }
    }

    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl Record for MirrorState {
    const KIND: RecordKind = RecordKind::MirrorState;
}

/// Per-repository usage accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub owner: String,
    pub name: String,
    /// Full materializations performed.
    pub clone_count: u64,
    /// Requests received, cache hits included.
    pub request_count: u64,
}

impl UsageCounters {
    pub fn zeroed(key: &RepoKey) -> Self {
        Self {
            owner: key.owner().to_string(),
            name: key.name().to_string(),
            clone_count: 0,
            request_count: 0,
        }
    }
}

impl Record for UsageCounters {
    const KIND: RecordKind = RecordKind::UsageCounters;
}

fn expiry_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl.max(MIN_TTL))
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RepoKey {
        RepoKey::new("alice", "repo1").unwrap()
    }

    #[test]
    fn new_state_expires_after_ttl() {
        let now = Utc::now();
        let state = MirrorState::new(
            &key(),
            "https://example.com/alice/repo1",
            "abc",
            now,
            Duration::from_secs(1800),
        );
        assert_eq!(state.downloaded_at, now);
        assert_eq!(state.expires_at - now, chrono::Duration::seconds(1800));
        assert!(state.is_fresh_at(now));
        assert!(!state.is_fresh_at(now + chrono::Duration::seconds(1800)));
    }

    #[test]
    fn zero_ttl_still_expires_after_download() {
        let now = Utc::now();
        let state = MirrorState::new(&key(), "u", "h", now, Duration::ZERO);
        assert!(state.expires_at > state.downloaded_at);
    }

    #[test]
    fn huge_ttl_saturates_instead_of_overflowing() {
        let now = Utc::now();
        let state = MirrorState::new(&key(), "u", "h", now, Duration::MAX);
        assert_eq!(state.expires_at, DateTime::<Utc>::MAX_UTC);
    }
}
