//! Parsing of `/v2/<name>/...` paths.
//!
//! Repository names contain slashes, so they cannot be matched by a router
//! segment. The tail after `/v2/` is split on the endpoint suffix instead,
//! searching from the right so a repository component may itself be called
//! `blobs` or `manifests`.

use origin::Digest;

use crate::error::{RegistryError, RegistryResult};

const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

/// A manifest reference: a tag or a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag.
    Tag(String),
    /// A content digest.
    Digest(Digest),
}

impl Reference {
    /// Parse a path reference. Anything containing `:` is a digest.
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            Ok(Reference::Digest(reference.parse()?))
        } else {
            validate_tag(reference)?;
            Ok(Reference::Tag(reference.to_owned()))
        }
    }
}

/// The endpoint a `/v2/` path addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// `/v2/<name>/manifests/<reference>`
    Manifest {
        /// Repository name.
        repository: String,
        /// Tag or digest.
        reference: Reference,
    },
    /// `/v2/<name>/blobs/<digest>`
    Blob {
        /// Repository name.
        repository: String,
        /// The blob digest.
        digest: Digest,
    },
    /// `/v2/<name>/blobs/uploads/`
    Uploads {
        /// Repository name.
        repository: String,
    },
    /// `/v2/<name>/blobs/uploads/<id>`
    Upload {
        /// Repository name.
        repository: String,
        /// Session id, as sent by the client.
        id: String,
    },
    /// `/v2/<name>/tags/list`
    Tags {
        /// Repository name.
        repository: String,
    },
}

impl Endpoint {
    /// Parse the path tail following `/v2/`.
    pub fn parse(tail: &str) -> RegistryResult<Self> {
        let tail = tail.trim_start_matches('/');

        if let Some(repository) = tail.strip_suffix("/tags/list") {
            return Ok(Endpoint::Tags {
                repository: repository_name(repository)?,
            });
        }

        if let Some((repository, reference)) = tail.rsplit_once("/manifests/") {
            if !reference.contains('/') && !reference.is_empty() {
                return Ok(Endpoint::Manifest {
                    repository: repository_name(repository)?,
                    reference: Reference::parse(reference)?,
                });
            }
        }

        if let Some(repository) = tail
            .strip_suffix("/blobs/uploads/")
            .or_else(|| tail.strip_suffix("/blobs/uploads"))
        {
            return Ok(Endpoint::Uploads {
                repository: repository_name(repository)?,
            });
        }

        if let Some((repository, id)) = tail.rsplit_once("/blobs/uploads/") {
            if !id.contains('/') {
                return Ok(Endpoint::Upload {
                    repository: repository_name(repository)?,
                    id: id.to_owned(),
                });
            }
        }

        if let Some((repository, digest)) = tail.rsplit_once("/blobs/") {
            if !digest.contains('/') && !digest.is_empty() {
                return Ok(Endpoint::Blob {
                    repository: repository_name(repository)?,
                    digest: digest.parse()?,
                });
            }
        }

        Err(RegistryError::UnknownEndpoint(format!("/v2/{tail}")))
    }

    /// The repository the endpoint belongs to.
    pub fn repository(&self) -> &str {
        match self {
            Endpoint::Manifest { repository, .. }
            | Endpoint::Blob { repository, .. }
            | Endpoint::Uploads { repository }
            | Endpoint::Upload { repository, .. }
            | Endpoint::Tags { repository } => repository,
        }
    }
}

fn repository_name(name: &str) -> RegistryResult<String> {
    validate_repository(name)?;
    Ok(name.to_owned())
}

/// Check a repository name against the distribution name grammar.
///
/// Names are `/`-separated components of lowercase alphanumerics, joined
/// inside a component by a single `.`, one or two `_`, or any run of `-`.
pub fn validate_repository(name: &str) -> RegistryResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NAME_LENGTH
        && name.split('/').all(valid_component);
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(name.to_owned()))
    }
}

fn valid_component(component: &str) -> bool {
    let alphanumeric = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let bytes = component.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    if !alphanumeric(*first as char) || !alphanumeric(*last as char) {
        return false;
    }

    component
        .split(alphanumeric)
        .filter(|separator| !separator.is_empty())
        .all(|separator| {
            matches!(separator, "." | "_" | "__") || separator.chars().all(|c| c == '-')
        })
}

/// Check a tag: `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> RegistryResult<()> {
    let mut chars = tag.chars();
    let valid = tag.len() <= MAX_TAG_LENGTH
        && chars
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTag(tag.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repository_grammar() {
        for name in ["app", "library/nginx", "a/b/c", "my-app", "my__app", "v1.2", "a--b"] {
            assert!(validate_repository(name).is_ok(), "{name} should be valid");
        }
        for name in ["", "App", "-app", "app-", "a//b", "a/", "a..b", "a___b", "a._b", "../x"] {
            assert!(validate_repository(name).is_err(), "{name} should be invalid");
        }
        assert!(validate_repository(&"a".repeat(256)).is_err());
    }

    #[test]
    fn tag_grammar() {
        for tag in ["latest", "v1.0.0", "_hidden", "A-b_c.d"] {
            assert!(validate_tag(tag).is_ok(), "{tag} should be valid");
        }
        for tag in ["", ".v1", "-v1", "a/b", "a:b"] {
            assert!(validate_tag(tag).is_err(), "{tag} should be invalid");
        }
        assert!(validate_tag(&"t".repeat(128)).is_ok());
        assert!(validate_tag(&"t".repeat(129)).is_err());
    }

    #[test]
    fn parses_endpoints() {
        let digest = Digest::sha256(b"blob");

        assert_eq!(
            Endpoint::parse("library/nginx/manifests/latest").unwrap(),
            Endpoint::Manifest {
                repository: "library/nginx".into(),
                reference: Reference::Tag("latest".into()),
            }
        );
        assert_eq!(
            Endpoint::parse(&format!("app/manifests/{digest}")).unwrap(),
            Endpoint::Manifest {
                repository: "app".into(),
                reference: Reference::Digest(digest.clone()),
            }
        );
        assert_eq!(
            Endpoint::parse(&format!("app/blobs/{digest}")).unwrap(),
            Endpoint::Blob {
                repository: "app".into(),
                digest,
            }
        );
        assert_eq!(
            Endpoint::parse("a/b/blobs/uploads/").unwrap(),
            Endpoint::Uploads {
                repository: "a/b".into()
            }
        );
        assert_eq!(
            Endpoint::parse("app/blobs/uploads/1234").unwrap(),
            Endpoint::Upload {
                repository: "app".into(),
                id: "1234".into(),
            }
        );
        assert_eq!(
            Endpoint::parse("app/tags/list").unwrap(),
            Endpoint::Tags {
                repository: "app".into()
            }
        );
    }

    #[test]
    fn repository_components_may_shadow_endpoints() {
        assert_eq!(
            Endpoint::parse("blobs/manifests/v1").unwrap().repository(),
            "blobs"
        );
        assert_eq!(
            Endpoint::parse("manifests/tags/list").unwrap().repository(),
            "manifests"
        );
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(matches!(
            Endpoint::parse("app/blobs/sha256:nothex"),
            Err(RegistryError::InvalidDigest(_))
        ));
        assert!(matches!(
            Endpoint::parse("App/manifests/latest"),
            Err(RegistryError::InvalidRepository(_))
        ));
        assert!(matches!(
            Endpoint::parse("app/manifests/.bad"),
            Err(RegistryError::InvalidTag(_))
        ));
        assert!(matches!(
            Endpoint::parse("app/unknown"),
            Err(RegistryError::UnknownEndpoint(_))
        ));
    }
}
