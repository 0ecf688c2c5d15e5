//! Tags, repositories and the catalog.

use std::sync::Arc;

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use origin::{Clock, Cluster, Digest, Key, NodeId, Prefix, TagRecord};
use serde::{Deserialize, Serialize};

use crate::api::{Params, Registry};
use crate::error::{RegistryError, RegistryResult};

/// Mutable tag pointers and the set of known repositories.
///
/// Tags are last-writer-wins records stamped by this coordinator's clock.
/// Concurrent writes through different coordinators converge on the record
/// with the latest timestamp.
#[derive(Debug, Clone)]
pub struct TagIndex {
    cluster: Cluster,
    coordinator: NodeId,
    clock: Arc<Clock>,
}

impl TagIndex {
    /// Index tags in `cluster`, stamping writes as `coordinator`.
    pub fn new(cluster: Cluster, coordinator: NodeId) -> Self {
        Self {
            cluster,
            coordinator,
            clock: Arc::new(Clock::new()),
        }
    }

    /// Point `repository:tag` at `digest`.
    #[tracing::instrument(skip(self))]
    pub async fn set_tag(&self, repository: &str, tag: &str, digest: &Digest) -> RegistryResult<()> {
        let record = TagRecord::new(digest.clone(), self.clock.now(), self.coordinator.clone());
        self.cluster
            .put_tag(&Key::tag(repository, tag), &record)
            .await?;
        Ok(())
    }

    /// The digest `repository:tag` points at.
    pub async fn resolve_tag(&self, repository: &str, tag: &str) -> RegistryResult<Digest> {
        let record = self.cluster.get_tag(&Key::tag(repository, tag)).await?;
        Ok(record.digest)
    }

    /// Record that `repository` exists.
    pub async fn add_repository(&self, repository: &str) -> RegistryResult<()> {
        let key = Key::Repository(repository.to_owned());
        if !self.cluster.exists(&key).await? {
            self.cluster.put(&key, Default::default()).await?;
            tracing::info!(%repository, "Registered repository");
        }
        Ok(())
    }

    /// Tags of `repository`, sorted.
    pub async fn list_tags(&self, repository: &str) -> RegistryResult<Vec<String>> {
        if !self
            .cluster
            .exists(&Key::Repository(repository.to_owned()))
            .await?
        {
            return Err(RegistryError::NameUnknown(repository.to_owned()));
        }

        let mut tags: Vec<String> = self
            .cluster
            .list(&Prefix::tags(repository))
            .await?
            .into_iter()
            .filter_map(|key| match key {
                Key::Tag { tag, .. } => Some(tag),
                _ => None,
            })
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    /// Every known repository, sorted.
    pub async fn list_repositories(&self) -> RegistryResult<Vec<String>> {
        let mut repositories: Vec<String> = self
            .cluster
            .list(&Prefix::Repositories)
            .await?
            .into_iter()
            .filter_map(|key| match key {
                Key::Repository(repository) => Some(repository),
                _ => None,
            })
            .collect();
        repositories.sort();
        repositories.dedup();
        Ok(repositories)
    }
}

/// One page of a sorted listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Entries on this page.
    pub items: Vec<String>,
    /// The `last` parameter for the next page, if there is one.
    pub next: Option<String>,
}

/// Entries after `last`, at most `n` of them.
pub fn paginate(items: Vec<String>, n: Option<usize>, last: Option<&str>) -> Page {
    let mut rest = items
        .into_iter()
        .skip_while(|item| last.is_some_and(|last| item.as_str() <= last));

    let Some(n) = n else {
        return Page {
            items: rest.collect(),
            next: None,
        };
    };

    let items: Vec<String> = rest.by_ref().take(n).collect();
    let next = if n > 0 && rest.next().is_some() {
        items.last().cloned()
    } else {
        None
    };
    Page { items, next }
}

fn link(path: &str, n: usize, last: &str) -> RegistryResult<String> {
    let query = serde_urlencoded::to_string([("n", n.to_string().as_str()), ("last", last)])
        .map_err(|err| RegistryError::Internal(err.to_string()))?;
    Ok(format!("<{path}?{query}>; rel=\"next\""))
}

fn page_response<T: Serialize>(
    path: &str,
    n: Option<usize>,
    next: Option<String>,
    body: T,
) -> RegistryResult<Response> {
    let mut response = (StatusCode::OK, Json(body)).into_response();
    if let (Some(n), Some(next)) = (n, next) {
        let value = link(path, n, &next)?
            .parse()
            .map_err(|_| RegistryError::Internal("unrepresentable Link header".to_owned()))?;
        response.headers_mut().insert(header::LINK, value);
    }
    Ok(response)
}

#[derive(Debug, Serialize, Deserialize)]
struct TagList {
    name: String,
    tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Catalog {
    repositories: Vec<String>,
}

/// `GET /v2/<name>/tags/list`
pub(crate) async fn list_tags(
    registry: &Registry,
    repository: &str,
    params: &Params,
) -> RegistryResult<Response> {
    let tags = registry.tags.list_tags(repository).await?;
    let page = paginate(tags, params.n, params.last.as_deref());
    page_response(
        &format!("/v2/{repository}/tags/list"),
        params.n,
        page.next,
        TagList {
            name: repository.to_owned(),
            tags: page.items,
        },
    )
}

/// `GET /v2/_catalog`
pub(crate) async fn catalog(registry: &Registry, params: &Params) -> RegistryResult<Response> {
    let repositories = registry.tags.list_repositories().await?;
    let page = paginate(repositories, params.n, params.last.as_deref());
    page_response(
        "/v2/_catalog",
        params.n,
        page.next,
        Catalog {
            repositories: page.items,
        },
    )
}
