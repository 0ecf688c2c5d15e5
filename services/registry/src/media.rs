//! Manifest media types and `Accept` header negotiation.
//!
//! Docker and OCI describe the same two document shapes under different
//! names. A stored manifest can be served under its native type or the
//! equivalent type of the other vocabulary; only the `Content-Type` changes,
//! never the bytes. A list never becomes a leaf manifest or the reverse.

use std::{cmp::Ordering, fmt, str::FromStr};

use axum::http::{HeaderMap, header};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Whether a manifest describes one image or a set of platform images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    /// A single image: config plus layers.
    Leaf,
    /// A manifest list / image index.
    List,
}

/// Which specification a media type name comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vocabulary {
    /// Docker Registry V2.
    Docker,
    /// OCI image spec v1.
    Oci,
}

/// The four manifest media types the registry stores and serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// `application/vnd.docker.distribution.manifest.v2+json`
    DockerManifest,
    /// `application/vnd.docker.distribution.manifest.list.v2+json`
    DockerManifestList,
    /// `application/vnd.oci.image.manifest.v1+json`
    OciManifest,
    /// `application/vnd.oci.image.index.v1+json`
    OciIndex,
}

const TABLE: [(MediaType, &str, Shape, Vocabulary); 4] = [
    (
        MediaType::DockerManifest,
        "application/vnd.docker.distribution.manifest.v2+json",
        Shape::Leaf,
        Vocabulary::Docker,
    ),
    (
        MediaType::DockerManifestList,
        "application/vnd.docker.distribution.manifest.list.v2+json",
        Shape::List,
        Vocabulary::Docker,
    ),
    (
        MediaType::OciManifest,
        "application/vnd.oci.image.manifest.v1+json",
        Shape::Leaf,
        Vocabulary::Oci,
    ),
    (
        MediaType::OciIndex,
        "application/vnd.oci.image.index.v1+json",
        Shape::List,
        Vocabulary::Oci,
    ),
];

impl MediaType {
    /// Every supported manifest media type.
    pub const ALL: [MediaType; 4] = [
        MediaType::DockerManifest,
        MediaType::DockerManifestList,
        MediaType::OciManifest,
        MediaType::OciIndex,
    ];

    fn row(&self) -> &'static (MediaType, &'static str, Shape, Vocabulary) {
        // Every variant has a row.
        &TABLE[*self as usize]
    }

    /// The wire name.
    pub fn as_str(&self) -> &'static str {
        self.row().1
    }

    /// The document shape.
    pub fn shape(&self) -> Shape {
        self.row().2
    }

    /// The vocabulary the name comes from.
    pub fn vocabulary(&self) -> Vocabulary {
        self.row().3
    }

    /// The media type with this shape in this vocabulary.
    pub fn of(shape: Shape, vocabulary: Vocabulary) -> MediaType {
        TABLE
            .iter()
            .find(|row| row.2 == shape && row.3 == vocabulary)
            .map(|row| row.0)
            .unwrap_or(MediaType::OciManifest)
    }

    /// The same shape under the other vocabulary.
    pub fn equivalent(&self) -> MediaType {
        let other = match self.vocabulary() {
            Vocabulary::Docker => Vocabulary::Oci,
            Vocabulary::Oci => Vocabulary::Docker,
        };
        MediaType::of(self.shape(), other)
    }

    /// Types a manifest stored as `self` may be served as, native first.
    pub fn servable(&self) -> [MediaType; 2] {
        [*self, self.equivalent()]
    }
}

/// A media type string which is not one of the four manifest types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported manifest media type {0:?}")]
pub struct UnknownMediaType(pub String);

impl FromStr for MediaType {
    type Err = UnknownMediaType;

    /// Parameters (`; charset=...`) are ignored, as is case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = s.split(';').next().unwrap_or_default().trim();
        TABLE
            .iter()
            .find(|row| row.1.eq_ignore_ascii_case(essence))
            .map(|row| row.0)
            .ok_or_else(|| UnknownMediaType(s.to_owned()))
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MediaType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MediaType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Range {
    Exact(MediaType),
    /// `*/*` or `application/*`.
    Any,
    Other(String),
}

/// One entry of an `Accept` header.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    range: Range,
    /// Quality in thousandths, `q=1` is 1000.
    quality: u16,
    /// Position in the header, for ties.
    position: usize,
}

/// Higher quality first, then earlier in the header.
fn precedence(a: &Entry, b: &Entry) -> Ordering {
    b.quality
        .cmp(&a.quality)
        .then_with(|| a.position.cmp(&b.position))
}

fn quality(value: &str) -> Option<u16> {
    let q: f32 = value.trim().parse().ok()?;
    (0.0..=1.0).contains(&q).then(|| (q * 1000.0).round() as u16)
}

/// The media types a client asked for, in order of preference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptSet {
    entries: Vec<Entry>,
}

/// No representation of a manifest is acceptable to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotAcceptable {
    /// What the client asked for.
    pub requested: Vec<String>,
    /// What the manifest could have been served as.
    pub servable: Vec<MediaType>,
}

impl AcceptSet {
    /// Parse every `Accept` header in `headers`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let values: Vec<&str> = headers
            .get_all(header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        Self::parse(values)
    }

    /// Parse `Accept` header values.
    pub fn parse<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut entries = Vec::new();

        for item in values.into_iter().flat_map(|value| value.split(',')) {
            let mut parts = item.split(';');
            let essence = parts.next().unwrap_or_default().trim();
            if essence.is_empty() {
                continue;
            }

            let mut q = Some(1000);
            for param in parts {
                if let Some((name, value)) = param.split_once('=') {
                    if name.trim().eq_ignore_ascii_case("q") {
                        q = quality(value);
                    }
                }
            }
            let Some(quality) = q else {
                tracing::debug!(%item, "Ignoring Accept entry with invalid quality");
                continue;
            };

            let range = if essence == "*/*" || essence.eq_ignore_ascii_case("application/*") {
                Range::Any
            } else {
                match essence.parse() {
                    Ok(media_type) => Range::Exact(media_type),
                    Err(_) => Range::Other(essence.to_owned()),
                }
            };

            let position = entries.len();
            entries.push(Entry {
                range,
                quality,
                position,
            });
        }

        entries.sort_by(precedence);
        Self { entries }
    }

    /// No `Accept` header, or one with no usable entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `media_type` is acceptable.
    pub fn accepts(&self, media_type: MediaType) -> bool {
        self.is_empty()
            || self.entries.iter().any(|entry| {
                entry.quality > 0
                    && match &entry.range {
                        Range::Exact(t) => *t == media_type,
                        Range::Any => !self.excludes(media_type),
                        Range::Other(_) => false,
                    }
            })
    }

    fn excludes(&self, media_type: MediaType) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.quality == 0 && entry.range == Range::Exact(media_type))
    }

    /// Choose how to serve a manifest stored as `native`.
    ///
    /// An empty set takes the native type. Otherwise the most preferred
    /// requested type that the manifest can be served as wins; a wildcard
    /// selects the native type unless the client excluded it with `q=0`.
    pub fn negotiate(&self, native: MediaType) -> Result<MediaType, NotAcceptable> {
        if self.is_empty() {
            return Ok(native);
        }

        let servable = native.servable();
        for entry in self.entries.iter().filter(|entry| entry.quality > 0) {
            match &entry.range {
                Range::Exact(media_type) if servable.contains(media_type) => {
                    return Ok(*media_type);
                }
                Range::Any => {
                    if let Some(media_type) = servable.iter().find(|t| !self.excludes(**t)) {
                        return Ok(*media_type);
                    }
                }
                _ => {}
            }
        }

        Err(NotAcceptable {
            requested: self.requested(),
            servable: servable.to_vec(),
        })
    }

    fn requested(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| match &entry.range {
                Range::Exact(media_type) => media_type.as_str().to_owned(),
                Range::Any => "*/*".to_owned(),
                Range::Other(other) => other.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCKER: &str = "application/vnd.docker.distribution.manifest.v2+json";
    const DOCKER_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    const OCI: &str = "application/vnd.oci.image.manifest.v1+json";
    const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

    #[test]
    fn table_round_trips_names() {
        for media_type in MediaType::ALL {
            assert_eq!(media_type.as_str().parse::<MediaType>(), Ok(media_type));
            assert_eq!(media_type.equivalent().equivalent(), media_type);
            assert_eq!(media_type.equivalent().shape(), media_type.shape());
            assert_ne!(media_type.equivalent().vocabulary(), media_type.vocabulary());
        }
        assert_eq!(
            format!("{OCI}; charset=utf-8").parse::<MediaType>(),
            Ok(MediaType::OciManifest)
        );
    }

    #[test]
    fn missing_accept_serves_native_type() {
        let accept = AcceptSet::parse([]);
        assert!(accept.is_empty());
        assert_eq!(
            accept.negotiate(MediaType::DockerManifestList),
            Ok(MediaType::DockerManifestList)
        );
    }

    #[test]
    fn first_listed_servable_type_wins() {
        let accept = AcceptSet::parse([format!("{OCI}, {DOCKER}").as_str()]);
        assert_eq!(
            accept.negotiate(MediaType::DockerManifest),
            Ok(MediaType::OciManifest)
        );

        let accept = AcceptSet::parse([DOCKER, OCI]);
        assert_eq!(
            accept.negotiate(MediaType::OciManifest),
            Ok(MediaType::DockerManifest)
        );
    }

    #[test]
    fn quality_outranks_position() {
        let accept = AcceptSet::parse([format!("{OCI};q=0.5, {DOCKER}").as_str()]);
        assert_eq!(
            accept.negotiate(MediaType::OciManifest),
            Ok(MediaType::DockerManifest)
        );
    }

    #[test]
    fn shapes_never_cross() {
        let accept = AcceptSet::parse([OCI_INDEX]);
        let err = accept.negotiate(MediaType::DockerManifest).unwrap_err();
        assert_eq!(
            err.servable,
            vec![MediaType::DockerManifest, MediaType::OciManifest]
        );
        assert_eq!(err.requested, vec![OCI_INDEX.to_owned()]);

        let accept = AcceptSet::parse([DOCKER, OCI]);
        assert!(accept.negotiate(MediaType::OciIndex).is_err());

        let accept = AcceptSet::parse([OCI, DOCKER_LIST]);
        assert_eq!(
            accept.negotiate(MediaType::OciIndex),
            Ok(MediaType::DockerManifestList)
        );
    }

    #[test]
    fn wildcards_serve_native_unless_excluded() {
        let accept = AcceptSet::parse(["*/*"]);
        assert_eq!(
            accept.negotiate(MediaType::OciIndex),
            Ok(MediaType::OciIndex)
        );

        let accept = AcceptSet::parse([format!("{OCI_INDEX};q=0, */*;q=0.1").as_str()]);
        assert_eq!(
            accept.negotiate(MediaType::OciIndex),
            Ok(MediaType::DockerManifestList)
        );
        assert!(!accept.accepts(MediaType::OciIndex));
    }

    #[test]
    fn unsupported_types_alone_are_not_acceptable() {
        let accept = AcceptSet::parse(["application/json"]);
        assert!(!accept.is_empty());
        assert!(accept.negotiate(MediaType::OciManifest).is_err());
    }

    #[test]
    fn reads_every_accept_header() {
        let mut headers = HeaderMap::new();
        headers.append(header::ACCEPT, OCI.parse().unwrap());
        headers.append(header::ACCEPT, DOCKER.parse().unwrap());
        let accept = AcceptSet::from_headers(&headers);
        assert!(accept.accepts(MediaType::DockerManifest));
        assert!(accept.accepts(MediaType::OciManifest));
        assert!(!accept.accepts(MediaType::OciIndex));
    }
}
