//! Manifest documents.
//!
//! Only the fields the registry needs are decoded. The stored and served
//! bytes are always the raw upload, never a re-serialization.

use bytes::Bytes;
use origin::Digest;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, RegistryResult};
use crate::media::{MediaType, Shape};

/// A reference from a manifest to other content.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the referenced content.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Target platform, on manifest list entries.
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// The platform a manifest list entry is built for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture, e.g. `amd64`.
    pub architecture: String,
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    schema_version: Option<u32>,
    media_type: Option<String>,
    config: Option<Descriptor>,
    layers: Option<Vec<Descriptor>>,
    manifests: Option<Vec<Descriptor>>,
}

/// What a manifest points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum References {
    /// Blobs of a single image.
    Leaf {
        /// Image configuration blob.
        config: Descriptor,
        /// Layer blobs, in order.
        layers: Vec<Descriptor>,
    },
    /// Platform-specific child manifests.
    List {
        /// Child manifests, in order.
        children: Vec<Descriptor>,
    },
}

/// A validated manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Digest of the raw bytes.
    pub digest: Digest,
    /// The declared (native) media type.
    pub media_type: MediaType,
    /// The bytes as uploaded.
    pub raw: Bytes,
    /// Referenced content.
    pub references: References,
}

impl Manifest {
    /// Validate `raw` as a manifest uploaded with `content_type`.
    ///
    /// The declared type comes from `content_type`, falling back to the
    /// document's `mediaType` field. A document without either is read as
    /// OCI, whose `mediaType` field is optional.
    pub fn parse(raw: Bytes, content_type: Option<&str>) -> RegistryResult<Self> {
        let document: Document = serde_json::from_slice(&raw)
            .map_err(|err| RegistryError::InvalidManifest(err.to_string()))?;

        if document.schema_version != Some(2) {
            return Err(RegistryError::InvalidManifest(format!(
                "schemaVersion must be 2, found {}",
                document
                    .schema_version
                    .map_or_else(|| "none".to_owned(), |v| v.to_string())
            )));
        }

        let declared = content_type.map(parse_media_type).transpose()?;
        let embedded = document
            .media_type
            .as_deref()
            .map(parse_media_type)
            .transpose()?;

        let media_type = match (declared, embedded) {
            (Some(declared), Some(embedded)) if declared != embedded => {
                return Err(RegistryError::InvalidManifest(format!(
                    "mediaType {embedded} does not match Content-Type {declared}"
                )));
            }
            (Some(media_type), _) | (None, Some(media_type)) => media_type,
            (None, None) if document.manifests.is_some() => MediaType::OciIndex,
            (None, None) => MediaType::OciManifest,
        };

        let references = match media_type.shape() {
            Shape::Leaf => {
                if document.manifests.is_some() {
                    return Err(RegistryError::InvalidManifest(format!(
                        "{media_type} must not list manifests"
                    )));
                }
                let config = document.config.ok_or_else(|| {
                    RegistryError::InvalidManifest(format!("{media_type} requires a config"))
                })?;
                let layers = document.layers.ok_or_else(|| {
                    RegistryError::InvalidManifest(format!("{media_type} requires layers"))
                })?;
                References::Leaf { config, layers }
            }
            Shape::List => {
                if document.config.is_some() || document.layers.is_some() {
                    return Err(RegistryError::InvalidManifest(format!(
                        "{media_type} must not have a config or layers"
                    )));
                }
                let children = document.manifests.ok_or_else(|| {
                    RegistryError::InvalidManifest(format!("{media_type} requires manifests"))
                })?;
                References::List { children }
            }
        };

        Ok(Manifest {
            digest: Digest::sha256(&raw),
            media_type,
            raw,
            references,
        })
    }

    /// Digests of every referenced blob or child manifest, in document order.
    pub fn referenced_digests(&self) -> Vec<Digest> {
        match &self.references {
            References::Leaf { config, layers } => std::iter::once(config)
                .chain(layers)
                .map(|descriptor| descriptor.digest.clone())
                .collect(),
            References::List { children } => children
                .iter()
                .map(|descriptor| descriptor.digest.clone())
                .collect(),
        }
    }

    /// The record stored alongside the raw bytes.
    pub fn record(&self) -> ManifestRecord {
        let descriptors: Vec<&Descriptor> = match &self.references {
            References::Leaf { config, layers } => std::iter::once(config).chain(layers).collect(),
            References::List { children } => children.iter().collect(),
        };
        ManifestRecord {
            media_type: self.media_type,
            size: self.raw.len() as u64,
            references: descriptors
                .into_iter()
                .map(|descriptor| ReferenceRecord {
                    digest: descriptor.digest.clone(),
                    platform: descriptor.platform.clone(),
                })
                .collect(),
        }
    }
}

fn parse_media_type(value: &str) -> RegistryResult<MediaType> {
    value
        .parse()
        .map_err(|err: crate::media::UnknownMediaType| RegistryError::InvalidManifest(err.to_string()))
}

/// What the registry remembers about a stored manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRecord {
    /// Native media type.
    pub media_type: MediaType,
    /// Size of the raw bytes.
    pub size: u64,
    /// Referenced content, in document order.
    pub references: Vec<ReferenceRecord>,
}

impl ManifestRecord {
    /// Referenced digests, in document order.
    pub fn digests(&self) -> impl Iterator<Item = &Digest> {
        self.references.iter().map(|reference| &reference.digest)
    }
}

/// One entry of [`ManifestRecord::references`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    /// Digest of the blob or child manifest.
    pub digest: Digest,
    /// Target platform of a list entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}
