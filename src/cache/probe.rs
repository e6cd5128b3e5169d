//! Remote head probing.
//!
//! A probe lists the remote's advertised references and resolves the
//! default branch to a concrete commit without materializing anything
//! locally.  The cache compares that commit with the one it recorded to
//! decide whether an expired mirror is still current.

use thiserror::Error;

/// Why a probe could not produce a head commit.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// Network or transport failure while listing references.
    #[error("remote {url} unreachable: {source:#}")]
    RemoteUnreachable {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// The remote answered but advertised no resolvable default reference.
    #[error("remote {url} advertises no resolvable default branch")]
    NoDefaultRef { url: String },
}

/// Resolves a remote's current default-branch head.
#[async_trait::async_trait]
pub trait RemoteProber: Send + Sync {
    /// Return the commit id the remote's `HEAD` resolves to.
    ///
    /// Must be free of local side effects.
    async fn probe(&self, url: &str) -> Result<String, ProbeError>;
}

/// One line of a reference advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisedRef {
    /// `ref: <target>\t<name>`
    Symbolic { name: String, target: String },
    /// `<oid>\t<name>`
    Direct { name: String, oid: String },
}

/// Parse `git ls-remote --symref` output.
pub fn parse_advertisement(output: &str) -> Vec<AdvertisedRef> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let (lhs, name) = line.split_once('\t')?;
            let name = name.trim().to_string();
            match lhs.strip_prefix("ref: ") {
                Some(target) => Some(AdvertisedRef::Symbolic {
                    name,
                    target: target.trim().to_string(),
                }),
                None => Some(AdvertisedRef::Direct {
                    name,
                    oid: lhs.trim().to_string(),
                }),
            }
        })
        .collect()
}

/// Resolve `HEAD` in an advertisement to a commit id.
///
/// A symbolic `HEAD` is followed to its target; a server that only
/// advertises a detached `HEAD` id is accepted as-is.
pub fn resolve_default_head(refs: &[AdvertisedRef]) -> Option<String> {
    let target = refs.iter().find_map(|r| match r {
        AdvertisedRef::Symbolic { name, target } if name == "HEAD" => Some(target.as_str()),
        _ => None,
    });

    let direct = |wanted: &str| {
        refs.iter().find_map(|r| match r {
            AdvertisedRef::Direct { name, oid } if name == wanted && is_object_id(oid) => {
                Some(oid.clone())
            }
            _ => None,
        })
    };

    match target {
        Some(target) => direct(target).or_else(|| direct("HEAD")),
        None => direct("HEAD"),
    }
}

fn is_object_id(s: &str) -> bool {
    matches!(s.len(), 40 | 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = "1111111111111111111111111111111111111111";
    const DEV: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn parses_symref_and_direct_lines() {
        let out = format!("ref: refs/heads/main\tHEAD\n{MAIN}\tHEAD\n{MAIN}\trefs/heads/main\n");
        let refs = parse_advertisement(&out);
        assert_eq!(refs.len(), 3);
        assert_eq!(
            refs[0],
            AdvertisedRef::Symbolic {
                name: "HEAD".into(),
                target: "refs/heads/main".into()
            }
        );
    }

    #[test]
    fn follows_symbolic_head_to_its_target() {
        let out = format!(
            "ref: refs/heads/dev\tHEAD\n{MAIN}\trefs/heads/main\n{DEV}\trefs/heads/dev\n"
        );
        assert_eq!(
            resolve_default_head(&parse_advertisement(&out)).as_deref(),
            Some(DEV)
        );
    }

    #[test]
    fn falls_back_to_detached_head() {
        let out = format!("{MAIN}\tHEAD\n{DEV}\trefs/heads/dev\n");
        assert_eq!(
            resolve_default_head(&parse_advertisement(&out)).as_deref(),
            Some(MAIN)
        );
    }

    #[test]
    fn empty_repository_has_no_default_head() {
        assert_eq!(resolve_default_head(&parse_advertisement("")), None);
        let dangling = "ref: refs/heads/main\tHEAD\n";
        assert_eq!(resolve_default_head(&parse_advertisement(dangling)), None);
    }

    #[test]
    fn rejects_malformed_object_ids() {
        let out = "ref: refs/heads/main\tHEAD\nnot-a-sha\trefs/heads/main\n";
        assert_eq!(resolve_default_head(&parse_advertisement(out)), None);
    }
}
