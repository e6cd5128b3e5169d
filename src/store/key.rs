//! Repository identity used as the lookup key for every metadata record.

use std::fmt;

use thiserror::Error;

/// Longest owner or repository name accepted.
const MAX_SEGMENT_LEN: usize = 100;

/// Validated `owner/name` pair.
///
/// Both segments are restricted to ASCII alphanumerics, `-`, `_` and `.`,
/// and may not start with a dot, so the canonical form can double as a
/// relative filesystem path without traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoKey {
    owner: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {segment} {value:?}: {reason}")]
pub struct InvalidKey {
    pub segment: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl RepoKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, InvalidKey> {
        let owner = owner.into();
        let name = name.into();
        validate_segment("owner", &owner)?;
        validate_segment("name", &name)?;
        Ok(Self { owner, name })
    }

    /// Parse the canonical `owner/name` form.
    pub fn parse(canonical: &str) -> Result<Self, InvalidKey> {
        match canonical.split_once('/') {
            Some((owner, name)) => Self::new(owner, name),
            None => Err(InvalidKey {
                segment: "key",
                value: canonical.to_string(),
                reason: "expected owner/name",
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `owner/name` string both record namespaces are keyed by.
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn validate_segment(segment: &'static str, value: &str) -> Result<(), InvalidKey> {
    let fail = |reason| {
        Err(InvalidKey {
            segment,
            value: value.to_string(),
            reason,
        })
    };
    if value.is_empty() {
        return fail("must not be empty");
    }
    if value.len() > MAX_SEGMENT_LEN {
        return fail("too long");
    }
    if value.starts_with('.') {
        return fail("must not start with '.'");
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return fail("only ASCII letters, digits, '-', '_' and '.' are allowed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_joins_with_slash() {
        let key = RepoKey::new("alice", "repo1").unwrap();
        assert_eq!(key.canonical(), "alice/repo1");
        assert_eq!(key.to_string(), "alice/repo1");
    }

    #[test]
    fn parse_round_trips_canonical_form() {
        let key = RepoKey::parse("acme-corp/my_repo.v2").unwrap();
        assert_eq!(key.owner(), "acme-corp");
        assert_eq!(key.name(), "my_repo.v2");
    }

    #[test]
    fn owners_cannot_collide_through_the_separator() {
        // "a/b-c" can only come from owner "a"; a slash inside a segment is rejected.
        assert!(RepoKey::new("a/b", "c").is_err());
        assert!(RepoKey::new("a", "b/c").is_err());
        assert!(RepoKey::parse("a/b/c").is_err());
    }

    #[test]
    fn rejects_empty_and_traversal_segments() {
        assert!(RepoKey::new("", "repo").is_err());
        assert!(RepoKey::new("owner", "").is_err());
        assert!(RepoKey::new("..", "repo").is_err());
        assert!(RepoKey::new("owner", ".git").is_err());
        assert!(RepoKey::new("own\0er", "repo").is_err());
        assert!(RepoKey::new("owner", "re po").is_err());
    }

    #[test]
    fn rejects_overlong_segments() {
        let long = "x".repeat(MAX_SEGMENT_LEN + 1);
        let err = RepoKey::new(long, "repo").unwrap_err();
        assert_eq!(err.segment, "owner");
    }

    #[test]
    fn parse_requires_separator() {
        let err = RepoKey::parse("no-slash").unwrap_err();
        assert_eq!(err.segment, "key");
    }
}
