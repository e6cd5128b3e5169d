//! Mirror lifecycle orchestration.
//!
//! [`MirrorCache::ensure_mirror`] is the single entry point that turns a
//! repository key into a usable local mirror.  It decides between reusing
//! the directory as is, revalidating it against the remote head, or
//! (re)materializing it, and keeps the metadata store consistent with what
//! is on disk.
//!
//! | directory        | state record | remote head     | action                           |
//! |------------------|--------------|-----------------|----------------------------------|
//! | missing          | any          | probed          | clone, record with fresh TTL     |
//! | present, invalid | any          | probed          | remove, clone, record fresh TTL  |
//! | valid            | unexpired    | not probed      | reuse                            |
//! | valid            | expired      | unchanged       | keep, record with stale TTL      |
//! | valid            | expired      | changed         | clone, replace, record fresh TTL |
//! | valid            | missing      | probed          | clone, replace, record fresh TTL |
//!
//! A valid mirror is only removed once its replacement cloned and
//! validated, so a failed or timed-out reclone leaves the old mirror and
//! its record as they were.
//!
//! All of the above runs under a per-repository lock.  Usage counters use
//! a separate lock space so that counting a request never waits on a
//! clone.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::error::{Failure, MirrorError, Phase};
use super::layout::staging_path;
use super::locks::KeyedLocks;
use super::probe::RemoteProber;
use super::transport::MirrorTransport;
use crate::metrics::Metrics;
use crate::store::{MetadataStore, MirrorState, RepoKey, StoreError, UsageCounters};

/// How a successful [`MirrorCache::ensure_mirror`] call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Unexpired mirror used without contacting the remote.
    Reused,
    /// Expired mirror confirmed current; its expiry was extended.
    Revalidated,
    /// A full clone was performed.
    Materialized,
}

impl MirrorOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            MirrorOutcome::Reused => "reused",
            MirrorOutcome::Revalidated => "revalidated",
            MirrorOutcome::Materialized => "materialized",
        }
    }
}

/// Bounds applied to upstream work.
#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub probe_timeout: Duration,
    pub clone_timeout: Duration,
    pub max_concurrent_clones: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(30),
            clone_timeout: Duration::from_secs(30 * 60),
            max_concurrent_clones: 4,
        }
    }
}

/// Keeps local mirrors and their metadata in step.
#[derive(Clone)]
pub struct MirrorCache {
    store: MetadataStore,
    prober: Arc<dyn RemoteProber>,
    transport: Arc<dyn MirrorTransport>,
    mirror_locks: KeyedLocks,
    counter_locks: KeyedLocks,
    clone_permits: Arc<Semaphore>,
    limits: CacheLimits,
    metrics: Arc<Metrics>,
}

impl MirrorCache {
    pub fn new(
        store: MetadataStore,
        prober: Arc<dyn RemoteProber>,
        transport: Arc<dyn MirrorTransport>,
        limits: CacheLimits,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            prober,
            transport,
            mirror_locks: KeyedLocks::new(),
            counter_locks: KeyedLocks::new(),
            clone_permits: Arc::new(Semaphore::new(limits.max_concurrent_clones.max(1))),
            limits,
            metrics,
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Ensure
    // -----------------------------------------------------------------------

    /// Make sure `dest` holds a usable mirror of `url` for `key`.
    ///
    /// Holds the per-key lock for the whole decision, so concurrent calls
    /// for one repository clone at most once.  Calls for different
    /// repositories proceed in parallel, bounded only by the clone permits.
    #[instrument(skip(self, url, dest, fresh_ttl, stale_ttl), fields(%key))]
    pub async fn ensure_mirror(
        &self,
        key: &RepoKey,
        url: &str,
        dest: &Path,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) -> Result<MirrorOutcome, MirrorError> {
        let _guard = self.mirror_locks.lock(&key.canonical()).await;

        let result = self
            .ensure_locked(key, url, dest, fresh_ttl, stale_ttl)
            .await;

        match &result {
            Ok(outcome) => self.metrics.record_outcome(outcome.as_str()),
            Err(e) => {
                self.metrics.record_error(e.kind().as_str());
                warn!(error = %e, kind = %e.kind(), "ensure mirror failed");
            }
        }

        result
    }

    async fn ensure_locked(
        &self,
        key: &RepoKey,
        url: &str,
        dest: &Path,
        fresh_ttl: Duration,
        stale_ttl: Duration,
    ) -> Result<MirrorOutcome, MirrorError> {
        let recorded = self
            .read_state(key)
            .await
            .map_err(|e| MirrorError::new(key, Phase::ReadState, e))?;

        let present = path_exists(dest)
            .await
            .map_err(|e| MirrorError::new(key, Phase::InspectMirror, e))?;

        let mut probed_head = None;

        if present {
            if !self.transport.is_valid_mirror(dest).await {
                warn!(path = %dest.display(), "directory is not a valid mirror, removing");
                self.remove(key, dest).await?;
            } else {
                match recorded {
                    Some(state) if state.is_fresh_at(Utc::now()) => {
                        debug!(expires_at = %state.expires_at, "mirror is fresh");
                        return Ok(MirrorOutcome::Reused);
                    }
                    Some(state) => {
                        let head = self.probe(key, url).await?;
                        if head == state.head_commit {
                            let refreshed = MirrorState::new(key, url, &head, Utc::now(), stale_ttl);
                            self.write_state(key, refreshed).await?;
                            info!(head = %head, "expired mirror unchanged, revalidated");
                            return Ok(MirrorOutcome::Revalidated);
                        }
                        info!(
                            recorded = %state.head_commit,
                            remote = %head,
                            "expired mirror is behind the remote, recloning"
                        );
                        probed_head = Some(head);
                    }
                    None => {
                        let head = self.probe(key, url).await?;
                        warn!(path = %dest.display(), "mirror has no state record, recloning");
                        probed_head = Some(head);
                    }
                }
            }
        }

        let head = match probed_head {
            Some(head) => head,
            None => self.probe(key, url).await?,
        };

        self.materialize(key, url, dest).await?;

        let state = MirrorState::new(key, url, &head, Utc::now(), fresh_ttl);
        let expires_at = state.expires_at;
        self.write_state(key, state).await?;
        self.record_clone(key).await?;

        info!(head = %head, %expires_at, "mirror materialized");
        Ok(MirrorOutcome::Materialized)
    }

    async fn probe(&self, key: &RepoKey, url: &str) -> Result<String, MirrorError> {
        let started = Instant::now();
        let probed = tokio::time::timeout(self.limits.probe_timeout, self.prober.probe(url)).await;
        self.metrics
            .probe_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match probed {
            Ok(Ok(head)) => {
                debug!(%head, "remote head probed");
                Ok(head)
            }
            Ok(Err(e)) => Err(MirrorError::new(key, Phase::Probe, e)),
            Err(_) => Err(MirrorError::new(
                key,
                Phase::Probe,
                Failure::Timeout {
                    operation: "probe",
                    after: self.limits.probe_timeout,
                },
            )),
        }
    }

    /// Clone into a staging directory and move it into place on success,
    /// replacing whatever `dest` held.
    async fn materialize(&self, key: &RepoKey, url: &str, dest: &Path) -> Result<(), MirrorError> {
        let failed = |source: Failure| MirrorError::new(key, Phase::Materialize, source);
        let staging = staging_path(dest);

        self.remove(key, &staging).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))
                .map_err(|e| failed(Failure::Clone(e)))?;
        }

        let _permit = self
            .clone_permits
            .acquire()
            .await
            .map_err(|e| failed(Failure::Clone(anyhow!("clone permits closed: {e}"))))?;

        info!(%url, staging = %staging.display(), "cloning mirror");
        let started = Instant::now();
        let cloned = tokio::time::timeout(
            self.limits.clone_timeout,
            self.transport.clone_mirror(url, &staging),
        )
        .await;

        let outcome = match cloned {
            Ok(Ok(())) => {
                if self.transport.is_valid_mirror(&staging).await {
                    Ok(())
                } else {
                    Err(Failure::Clone(anyhow!(
                        "clone of {url} did not produce a valid mirror"
                    )))
                }
            }
            Ok(Err(e)) => Err(Failure::Clone(e)),
            Err(_) => Err(Failure::Timeout {
                operation: "clone",
                after: self.limits.clone_timeout,
            }),
        };

        if let Err(source) = outcome {
            self.discard_staging(&staging).await;
            return Err(failed(source));
        }

        self.metrics
            .clone_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if let Err(e) = self.remove(key, dest).await {
            self.discard_staging(&staging).await;
            return Err(e);
        }

        tokio::fs::rename(&staging, dest)
            .await
            .with_context(|| {
                format!(
                    "failed to move {} to {}",
                    staging.display(),
                    dest.display()
                )
            })
            .map_err(|e| failed(Failure::Clone(e)))?;

        Ok(())
    }

    async fn remove(&self, key: &RepoKey, path: &Path) -> Result<(), MirrorError> {
        self.transport.remove_mirror(path).await.map_err(|source| {
            MirrorError::new(
                key,
                Phase::RemoveMirror,
                Failure::Remove {
                    path: path.to_path_buf(),
                    source,
                },
            )
        })
    }

    async fn discard_staging(&self, staging: &Path) {
        if let Err(e) = self.transport.remove_mirror(staging).await {
            warn!(error = %e, path = %staging.display(), "failed to clean up staging directory");
        }
    }

    // -----------------------------------------------------------------------
    // Counters
    // -----------------------------------------------------------------------

    /// Add one to the clone counter of `key`.
    pub async fn record_clone(&self, key: &RepoKey) -> Result<UsageCounters, MirrorError> {
        self.bump(key, |c| c.clone_count = c.clone_count.saturating_add(1))
            .await
    }

    /// Add one to the request counter of `key`.
    pub async fn record_request(&self, key: &RepoKey) -> Result<UsageCounters, MirrorError> {
        self.metrics.requests_total.inc();
        self.bump(key, |c| c.request_count = c.request_count.saturating_add(1))
            .await
    }

    async fn bump(
        &self,
        key: &RepoKey,
        apply: fn(&mut UsageCounters),
    ) -> Result<UsageCounters, MirrorError> {
        let canonical = key.canonical();
        let guard = self.counter_locks.lock(&canonical).await;
        let owned = key.clone();

        self.blocking(move |store| {
            // The guard travels with the read-modify-write so a cancelled
            // caller cannot release it while the write is still pending.
            let _guard = guard;
            let mut counters = store
                .get::<UsageCounters>(&canonical)?
                .unwrap_or_else(|| UsageCounters::zeroed(&owned));
            apply(&mut counters);
            store.put(&canonical, &counters)?;
            Ok(counters)
        })
        .await
        .map_err(|e| MirrorError::new(key, Phase::RecordCounter, e))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get_mirror_state(&self, key: &RepoKey) -> Result<Option<MirrorState>, MirrorError> {
        self.read_state(key)
            .await
            .map_err(|e| MirrorError::new(key, Phase::ReadState, e))
    }

    pub async fn get_usage_counters(
        &self,
        key: &RepoKey,
    ) -> Result<Option<UsageCounters>, MirrorError> {
        let canonical = key.canonical();
        self.blocking(move |store| store.get::<UsageCounters>(&canonical))
            .await
            .map_err(|e| MirrorError::new(key, Phase::ReadCounters, e))
    }

    /// Every mirror state record, ordered by key.
    pub async fn list_mirror_states(&self) -> Result<Vec<MirrorState>, MirrorError> {
        self.blocking(|store| store.scan::<MirrorState>().collect())
            .await
            .map_err(|e| MirrorError::new("*", Phase::List, e))
    }

    /// Every usage counter record, ordered by key.
    pub async fn list_usage_counters(&self) -> Result<Vec<UsageCounters>, MirrorError> {
        self.blocking(|store| store.scan::<UsageCounters>().collect())
            .await
            .map_err(|e| MirrorError::new("*", Phase::List, e))
    }

    // -----------------------------------------------------------------------
    // Store access
    // -----------------------------------------------------------------------

    async fn read_state(&self, key: &RepoKey) -> Result<Option<MirrorState>, StoreError> {
        let canonical = key.canonical();
        self.blocking(move |store| store.get::<MirrorState>(&canonical))
            .await
    }

    async fn write_state(&self, key: &RepoKey, state: MirrorState) -> Result<(), MirrorError> {
        let canonical = key.canonical();
        self.blocking(move |store| store.put(&canonical, &state))
            .await
            .map_err(|e| MirrorError::new(key, Phase::WriteState, e))
    }

    /// Run a store operation on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&MetadataStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(&store)).await?
    }
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

async fn path_exists(path: &Path) -> Result<bool, Failure> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(Failure::Inspect {
            path: path.to_path_buf(),
            source,
        }),
    }
}
