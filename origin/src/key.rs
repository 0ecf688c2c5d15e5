//! Entity keys and their node-local paths.
//!
//! Every entity an origin stores lives under one bucket:
//!
//! | Key | Path |
//! |---|---|
//! | blob | `blobs/<alg>/<hex>` |
//! | manifest record | `manifests/<alg>/<hex>` |
//! | tag | `repositories/<repo>/_tags/<tag>` |
//! | repository marker | `repositories/<repo>/_repository` |

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::digest::{Algorithm, Digest};

const BLOBS: &str = "blobs";
const MANIFESTS: &str = "manifests";
const REPOSITORIES: &str = "repositories";
const TAGS: &str = "_tags";
const MARKER: &str = "_repository";

/// The identity of one stored entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// Raw content, including manifest bytes.
    Blob(Digest),
    /// A manifest's stored record (media type and references).
    Manifest(Digest),
    /// A tag pointer.
    Tag {
        /// Repository name.
        repository: String,
        /// Tag name.
        tag: String,
    },
    /// Marks a repository as known to the catalog.
    Repository(String),
}

impl Key {
    /// Key for a tag pointer.
    pub fn tag(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Key::Tag {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// The node-local storage path.
    pub fn path(&self) -> Utf8PathBuf {
        match self {
            Key::Blob(digest) => Utf8PathBuf::from(BLOBS)
                .join(digest.algorithm().as_str())
                .join(digest.hex()),
            Key::Manifest(digest) => Utf8PathBuf::from(MANIFESTS)
                .join(digest.algorithm().as_str())
                .join(digest.hex()),
            Key::Tag { repository, tag } => Utf8PathBuf::from(REPOSITORIES)
                .join(repository)
                .join(TAGS)
                .join(tag),
            Key::Repository(repository) => Utf8PathBuf::from(REPOSITORIES)
                .join(repository)
                .join(MARKER),
        }
    }

    /// Parse a storage path back into a key.
    pub fn from_path(path: &str) -> Option<Self> {
        let (root, rest) = path.split_once('/')?;
        match root {
            BLOBS | MANIFESTS => {
                let (algorithm, hex) = rest.split_once('/')?;
                let algorithm: Algorithm = algorithm.parse().ok()?;
                let digest = Digest::new(algorithm, hex).ok()?;
                Some(if root == BLOBS {
                    Key::Blob(digest)
                } else {
                    Key::Manifest(digest)
                })
            }
            REPOSITORIES => {
                if let Some((repository, tag)) = rest.rsplit_once(&format!("/{TAGS}/")) {
                    return (!repository.is_empty() && !tag.is_empty() && !tag.contains('/'))
                        .then(|| Key::tag(repository, tag));
                }
                let repository = rest.strip_suffix(MARKER)?.strip_suffix('/')?;
                (!repository.is_empty()).then(|| Key::Repository(repository.into()))
            }
            _ => None,
        }
    }

    /// Immutable keys are content-addressed and never change once written.
    /// Tags are the only mutable pointers.
    pub fn is_mutable(&self) -> bool {
        matches!(self, Key::Tag { .. })
    }

    /// The digest for content-addressed keys.
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Key::Blob(digest) | Key::Manifest(digest) => Some(digest),
            _ => None,
        }
    }

    /// The token hashed to choose this key's replica set.
    ///
    /// Content keys place by digest; repository-scoped keys place by
    /// repository so all tags of a repository share one replica set.
    pub fn placement(&self) -> String {
        match self {
            Key::Blob(digest) | Key::Manifest(digest) => digest.to_string(),
            Key::Tag { repository, .. } | Key::Repository(repository) => {
                repository_token(repository)
            }
        }
    }
}

fn repository_token(repository: &str) -> String {
    format!("repository:{repository}")
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

/// A set of keys that can be listed together.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Prefix {
    /// Every blob.
    Blobs,
    /// Every manifest record.
    Manifests,
    /// Every repository marker.
    Repositories,
    /// Tags, of one repository or of all of them.
    Tags {
        /// Restrict to this repository.
        repository: Option<String>,
    },
}

impl Prefix {
    /// Tags of one repository.
    pub fn tags(repository: impl Into<String>) -> Self {
        Prefix::Tags {
            repository: Some(repository.into()),
        }
    }

    /// The storage path to list under.
    pub fn path(&self) -> Utf8PathBuf {
        match self {
            Prefix::Blobs => BLOBS.into(),
            Prefix::Manifests => MANIFESTS.into(),
            Prefix::Repositories | Prefix::Tags { repository: None } => REPOSITORIES.into(),
            Prefix::Tags {
                repository: Some(repository),
            } => Utf8Path::new(REPOSITORIES).join(repository).join(TAGS),
        }
    }

    /// Whether `key` belongs to this set.
    pub fn matches(&self, key: &Key) -> bool {
        match (self, key) {
            (Prefix::Blobs, Key::Blob(_)) => true,
            (Prefix::Manifests, Key::Manifest(_)) => true,
            (Prefix::Repositories, Key::Repository(_)) => true,
            (Prefix::Tags { repository: None }, Key::Tag { .. }) => true,
            (
                Prefix::Tags {
                    repository: Some(wanted),
                },
                Key::Tag { repository, .. },
            ) => wanted == repository,
            _ => false,
        }
    }

    /// The placement token when every matching key shares one replica set.
    pub fn placement(&self) -> Option<String> {
        match self {
            Prefix::Tags {
                repository: Some(repository),
            } => Some(repository_token(repository)),
            _ => None,
        }
    }
}

/// The kind of a listing, as sent over the peer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrefixKind {
    /// See [`Prefix::Blobs`].
    Blobs,
    /// See [`Prefix::Manifests`].
    Manifests,
    /// See [`Prefix::Repositories`].
    Repositories,
    /// See [`Prefix::Tags`].
    Tags,
}

/// Query string form of a [`Prefix`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    /// Which kind of key.
    pub kind: PrefixKind,
    /// Repository restriction for tag listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
}

impl From<&Prefix> for ListQuery {
    fn from(prefix: &Prefix) -> Self {
        let (kind, repository) = match prefix {
            Prefix::Blobs => (PrefixKind::Blobs, None),
            Prefix::Manifests => (PrefixKind::Manifests, None),
            Prefix::Repositories => (PrefixKind::Repositories, None),
            Prefix::Tags { repository } => (PrefixKind::Tags, repository.clone()),
        };
        ListQuery { kind, repository }
    }
}

impl From<ListQuery> for Prefix {
    fn from(query: ListQuery) -> Self {
        match query.kind {
            PrefixKind::Blobs => Prefix::Blobs,
            PrefixKind::Manifests => Prefix::Manifests,
            PrefixKind::Repositories => Prefix::Repositories,
            PrefixKind::Tags => Prefix::Tags {
                repository: query.repository,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_parse_back_into_keys() {
        let digest = Digest::sha256(b"config");
        let keys = [
            Key::Blob(digest.clone()),
            Key::Manifest(digest),
            Key::tag("library/alpine", "3.20"),
            Key::tag("app", "_repository"),
            Key::Repository("library/alpine".into()),
        ];
        for key in keys {
            assert_eq!(Key::from_path(key.path().as_str()), Some(key));
        }
    }

    #[test]
    fn tag_path_layout() {
        let key = Key::tag("team/app", "latest");
        assert_eq!(key.path(), "repositories/team/app/_tags/latest");
        assert!(key.is_mutable());
        assert_eq!(key.placement(), "repository:team/app");
    }

    #[test]
    fn foreign_paths_are_ignored() {
        assert_eq!(Key::from_path("blobs/sha256/xyz"), None);
        assert_eq!(Key::from_path("uploads/abc"), None);
        assert_eq!(Key::from_path("repositories/_repository"), None);
    }

    #[test]
    fn prefixes_filter_keys() {
        let tag = Key::tag("app", "v1");
        let marker = Key::Repository("app".into());

        assert!(Prefix::tags("app").matches(&tag));
        assert!(!Prefix::tags("application").matches(&tag));
        assert!(!Prefix::Repositories.matches(&tag));
        assert!(Prefix::Repositories.matches(&marker));
        assert_eq!(Prefix::tags("app").path(), "repositories/app/_tags");
        assert_eq!(
            Prefix::tags("app").placement(),
            Some(marker.placement())
        );
    }

    #[test]
    fn list_query_converts_both_ways() {
        let prefix = Prefix::tags("app");
        let query = ListQuery::from(&prefix);
        assert_eq!(
            serde_urlencoded::to_string(&query).unwrap(),
            "kind=tags&repository=app"
        );
        assert_eq!(Prefix::from(query), prefix);
    }
}
