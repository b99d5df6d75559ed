//! Docker registry lookups used to validate image references.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::{BackendError, BackendResult};

static REPOSITORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[a-zA-Z0-9.-]+(?::[0-9]+)?/)?[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$",
    )
    .expect("repository pattern is valid")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag pattern is valid"));

#[async_trait]
pub trait ImageRegistry: Send + Sync {
    async fn list_tags(&self, repository: &str) -> BackendResult<Vec<String>>;

    async fn has_tag(&self, repository: &str, tag: &str) -> BackendResult<bool> {
        Ok(self.list_tags(repository).await?.iter().any(|t| t == tag))
    }
}

/// Check the reference grammar, then ask the registry for the tag.
pub async fn validate_image(
    registry: &dyn ImageRegistry,
    repository: &str,
    tag: &str,
) -> BackendResult<()> {
    if !REPOSITORY_RE.is_match(repository) {
        return Err(BackendError::InvalidImage(format!("malformed repository {repository:?}")));
    }
    if !TAG_RE.is_match(tag) {
        return Err(BackendError::InvalidImage(format!("malformed tag {tag:?}")));
    }
    if !registry.has_tag(repository, tag).await? {
        return Err(BackendError::InvalidImage(format!(
            "tag {tag} not found in repository {repository}"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

/// Registry speaking the Docker registry v2 HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Repository path relative to this registry, dropping a host prefix.
    fn repository_path<'a>(&self, repository: &'a str) -> &'a str {
        match repository.split_once('/') {
            Some((host, rest)) if host.contains('.') || host.contains(':') => rest,
            _ => repository,
        }
    }
}

#[async_trait]
impl ImageRegistry for HttpRegistry {
    async fn list_tags(&self, repository: &str) -> BackendResult<Vec<String>> {
        let url = format!("{}/v2/{}/tags/list", self.base_url, self.repository_path(repository));
        debug!(%url, "listing image tags");

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(BackendError::Request(format!(
                "tag listing for {repository} returned {}",
                response.status()
            )));
        }
        let list: TagList = response.json().await?;
        Ok(list.tags.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn lists_tags_from_registry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/library/nginx/tags/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"name": "library/nginx", "tags": ["1.25", "latest"]})),
            )
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri());
        let tags = registry.list_tags("registry.local:5000/library/nginx").await.unwrap();
        assert_eq!(tags, vec!["1.25", "latest"]);
        assert!(registry.has_tag("library/nginx", "latest").await.unwrap());
    }

    #[tokio::test]
    async fn validate_rejects_missing_tag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/app/tags/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"name": "app", "tags": null})))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri());
        let err = validate_image(&registry, "app", "1.0").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn registry_errors_surface() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(&server.uri());
        assert!(matches!(
            registry.list_tags("missing").await,
            Err(BackendError::Request(_))
        ));
    }

    #[tokio::test]
    async fn validate_checks_reference_grammar() {
        let backend = crate::MemoryBackend::new();
        assert!(validate_image(&backend, "Bad Repo", "1").await.is_err());
        assert!(validate_image(&backend, "nginx", "-bad").await.is_err());
        assert!(validate_image(&backend, "registry.local:5000/team/app", "1.0.0").await.is_ok());
    }
}
