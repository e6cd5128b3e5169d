//! Failure taxonomy for mirror orchestration.
//!
//! Every error leaving [`MirrorCache`](super::MirrorCache) names the
//! repository and the phase it failed in.  Callers branch on
//! [`MirrorError::kind`] rather than on collaborator-specific errors.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::probe::ProbeError;
use crate::store::StoreError;

/// Stable classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backing storage unreachable or corrupt.
    StoreUnavailable,
    /// The remote could not be listed.
    RemoteUnreachable,
    /// The remote has no resolvable default branch.
    NoDefaultRef,
    /// The external clone failed.
    MaterializeFailed,
    /// A stale or invalid directory could not be removed.
    InvalidLocalMirror,
    /// A bounded network operation ran out of time.
    Timeout,
}

impl ErrorKind {
    /// Whether repeating the whole call later may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RemoteUnreachable | ErrorKind::MaterializeFailed | ErrorKind::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::RemoteUnreachable => "remote_unreachable",
            ErrorKind::NoDefaultRef => "no_default_ref",
            ErrorKind::MaterializeFailed => "materialize_failed",
            ErrorKind::InvalidLocalMirror => "invalid_local_mirror",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step of the orchestration that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ReadState,
    InspectMirror,
    RemoveMirror,
    Probe,
    Materialize,
    WriteState,
    RecordCounter,
    ReadCounters,
    List,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::ReadState => "read state",
            Phase::InspectMirror => "inspect mirror",
            Phase::RemoveMirror => "remove mirror",
            Phase::Probe => "probe remote",
            Phase::Materialize => "materialize",
            Phase::WriteState => "write state",
            Phase::RecordCounter => "record counter",
            Phase::ReadCounters => "read counters",
            Phase::List => "list records",
        })
    }
}

/// Underlying cause of a [`MirrorError`].
#[derive(Debug, Error)]
pub enum Failure {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("clone failed: {0:#}")]
    Clone(#[source] anyhow::Error),

    #[error("failed to inspect {}: {source}", path.display())]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl Failure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Failure::Store(_) => ErrorKind::StoreUnavailable,
            Failure::Probe(ProbeError::RemoteUnreachable { .. }) => ErrorKind::RemoteUnreachable,
            Failure::Probe(ProbeError::NoDefaultRef { .. }) => ErrorKind::NoDefaultRef,
            Failure::Clone(_) => ErrorKind::MaterializeFailed,
            Failure::Inspect { .. } | Failure::Remove { .. } => ErrorKind::InvalidLocalMirror,
            Failure::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

/// A [`Failure`] with the repository and phase it occurred in.
#[derive(Debug, Error)]
#[error("{phase} failed for {key}: {source}")]
pub struct MirrorError {
    pub key: String,
    pub phase: Phase,
    #[source]
    pub source: Failure,
}

impl MirrorError {
    pub fn new(key: impl fmt::Display, phase: Phase, source: impl Into<Failure>) -> Self {
        Self {
            key: key.to_string(),
            phase,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_failures_map_to_their_kinds() {
        let err = MirrorError::new(
            "alice/repo1",
            Phase::Probe,
            ProbeError::NoDefaultRef {
                url: "https://example.com/alice/repo1".into(),
            },
        );
        assert_eq!(err.kind(), ErrorKind::NoDefaultRef);
        assert!(!err.is_retryable());

        let err = MirrorError::new(
            "alice/repo1",
            Phase::Probe,
            ProbeError::RemoteUnreachable {
                url: "https://example.com/alice/repo1".into(),
                source: anyhow::anyhow!("connection refused"),
            },
        );
        assert_eq!(err.kind(), ErrorKind::RemoteUnreachable);
        assert!(err.is_retryable());
    }

    #[test]
    fn message_names_key_and_phase() {
        let err = MirrorError::new(
            "alice/repo1",
            Phase::Materialize,
            Failure::Timeout {
                operation: "clone",
                after: Duration::from_secs(5),
            },
        );
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(
            err.to_string(),
            "materialize failed for alice/repo1: clone timed out after 5s"
        );
    }

    #[test]
    fn remove_failure_is_invalid_local_mirror() {
        let err = MirrorError::new(
            "alice/repo1",
            Phase::RemoveMirror,
            Failure::Remove {
                path: PathBuf::from("/srv/alice/repo1.git"),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            },
        );
        assert_eq!(err.kind(), ErrorKind::InvalidLocalMirror);
        assert!(!err.is_retryable());
    }
}
