//! Catalog client for the Danbooru posts API
//!
//! This module provides functionality for:
//! 1. Issuing one paginated search request per call
//! 2. Normalizing raw posts into candidate records
//! 3. Filtering candidates against required/excluded tags, score and extension
//! 4. Looking up tag categories in the catalog's tag taxonomy

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Proxy, StatusCode};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::danbooru::config_loader::AppConfig;

/// Default posts endpoint.
pub const POSTS_URL: &str = "https://danbooru.donmai.us/posts.json";

/// Default tag taxonomy endpoint.
pub const TAGS_URL: &str = "https://danbooru.donmai.us/tags.json";

/// Error types for catalog queries
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Service returned {0}")]
    Service(StatusCode),

    #[error("Malformed response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Post object as returned by the posts endpoint. Only the fields the pipeline needs.
#[derive(Debug, Deserialize, Clone)]
pub struct RawPost {
    pub id: Option<u64>,
    pub file_url: Option<String>,
    #[serde(default)]
    pub tag_string: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub file_ext: String,
}

/// A catalog entry that matched the search, not yet downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRecord {
    pub id: u64,
    pub file_url: String,
    pub tag_string: String,
    pub score: i64,
    pub file_ext: String,
}

impl CandidateRecord {
    /// Builds a record from a raw post, or `None` if it has no id or no asset URL.
    pub fn from_raw(post: RawPost) -> Option<Self> {
        let id = post.id?;
        let file_url = post.file_url.filter(|url| !url.trim().is_empty())?;

        Some(Self {
            id,
            file_url,
            tag_string: post.tag_string,
            score: post.score,
            file_ext: post.file_ext.trim().to_lowercase(),
        })
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tag_string.split_whitespace()
    }

    /// Sidecar file contents: the tag tokens rejoined with commas.
    pub fn sidecar_tags(&self) -> String {
        self.tags().collect::<Vec<_>>().join(",")
    }
}

/// Inclusion/exclusion/score/extension criteria for a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub required_tags: Vec<String>,
    pub excluded_tags: HashSet<String>,
    pub min_score: i64,
    pub allowed_extensions: HashSet<String>,
}

impl FilterCriteria {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            required_tags: config.query.tags.clone(),
            excluded_tags: config.query.exclude_tags.iter().cloned().collect(),
            min_score: config.query.score_threshold,
            allowed_extensions: config
                .files
                .allowed_extensions
                .iter()
                .map(|ext| ext.to_lowercase())
                .collect(),
        }
    }

    /// Pure validity predicate over a candidate.
    pub fn is_valid(&self, record: &CandidateRecord) -> bool {
        let tags: HashSet<&str> = record.tags().collect();

        let has_required = self.required_tags.iter().all(|tag| tags.contains(tag.as_str()));
        let has_excluded = self.excluded_tags.iter().any(|tag| tags.contains(tag.as_str()));
        let extension_ok = self.allowed_extensions.contains(&record.file_ext.to_lowercase());

        has_required && !has_excluded && record.score >= self.min_score && extension_ok
    }

    /// Value of the `tags` query parameter.
    pub fn query_tags(&self) -> String {
        self.required_tags.join(" ")
    }
}

/// One page of filtered results.
#[derive(Debug, Clone, Default)]
pub struct CatalogPage {
    pub candidates: Vec<CandidateRecord>,
    /// Number of posts the service returned before filtering.
    pub fetched: usize,
}

/// Anything that can answer a paginated catalog search.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn search(&self, criteria: &FilterCriteria, page_size: usize, page: u32) -> CatalogResult<CatalogPage>;
}

/// Anything that can resolve a tag name to its taxonomy category.
#[async_trait]
pub trait TagCategorySource: Send + Sync {
    async fn tag_category(&self, tag: &str) -> CatalogResult<Option<i64>>;
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    category: Option<i64>,
}

/// HTTP client for the catalog service
#[derive(Clone)]
pub struct CatalogClient {
    client: Client,
    posts_url: String,
    tags_url: String,
    username: String,
    api_key: String,
}

impl CatalogClient {
    /// Builds a client from a configuration snapshot, routing through the proxy if set.
    pub fn from_config(config: &AppConfig) -> CatalogResult<Self> {
        let mut builder = Client::builder()
            .user_agent(&config.network.user_agent)
            .timeout(Duration::from_secs(config.network.timeout_secs))
            .gzip(true);

        // Only the configured proxy is used; environment proxies are ignored.
        builder = match config.proxy_url() {
            Some(proxy_url) => {
                debug!("Routing catalog requests through proxy {}", proxy_url);
                builder.proxy(Proxy::all(&proxy_url)?)
            }
            None => builder.no_proxy(),
        };

        Ok(Self {
            client: builder.build()?,
            posts_url: POSTS_URL.to_string(),
            tags_url: TAGS_URL.to_string(),
            username: config.auth.username.clone(),
            api_key: config.auth.api_key.clone(),
        })
    }

    /// Points the client at a different host, e.g. a mirror.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        self.posts_url = format!("{}/posts.json", base);
        self.tags_url = format!("{}/tags.json", base);
        self
    }

    fn search_params(&self, criteria: &FilterCriteria, page_size: usize, page: u32) -> Vec<(&'static str, String)> {
        let mut params = Vec::with_capacity(6);

        if !self.api_key.is_empty() {
            params.push(("login", self.username.clone()));
            params.push(("api_key", self.api_key.clone()));
        }

        params.push(("tags", criteria.query_tags()));
        params.push(("limit", page_size.to_string()));
        params.push(("page", page.to_string()));

        if criteria.min_score > 0 {
            params.push(("score", criteria.min_score.to_string()));
        }

        params
    }
}

/// Normalizes and filters a decoded page.
pub fn filter_posts(posts: Vec<RawPost>, criteria: &FilterCriteria) -> CatalogPage {
    let fetched = posts.len();
    let candidates = posts
        .into_iter()
        .filter_map(CandidateRecord::from_raw)
        .filter(|record| criteria.is_valid(record))
        .collect();

    CatalogPage { candidates, fetched }
}

#[async_trait]
impl CatalogSource for CatalogClient {
    #[instrument(skip(self, criteria), fields(tags = %criteria.query_tags()))]
    async fn search(&self, criteria: &FilterCriteria, page_size: usize, page: u32) -> CatalogResult<CatalogPage> {
        let params = self.search_params(criteria, page_size, page);

        let response = self.client.get(&self.posts_url).query(&params).send().await?;

        let status = response.status();
        if status != StatusCode::OK {
            error!("Failed to fetch posts: {}", status);
            return Err(CatalogError::Service(status));
        }

        let body = response.bytes().await?;
        let posts: Vec<RawPost> = serde_json::from_slice(&body)?;
        let result = filter_posts(posts, criteria);

        info!(
            "Fetched {} valid posts from page {}. Total posts fetched: {}",
            result.candidates.len(),
            page,
            result.fetched
        );

        Ok(result)
    }
}

#[async_trait]
impl TagCategorySource for CatalogClient {
    async fn tag_category(&self, tag: &str) -> CatalogResult<Option<i64>> {
        let response = self
            .client
            .get(&self.tags_url)
            .query(&[("search[name]", tag), ("limit", "1")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Service(status));
        }

        let body = response.bytes().await?;
        let entries: Vec<TagEntry> = serde_json::from_slice(&body)?;

        match entries.into_iter().next() {
            Some(entry) => Ok(entry.category),
            None => {
                warn!("No tag found for '{}'", tag);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CatalogClient {
        let mut config = AppConfig::default();
        config.auth.username = "alice".to_string();
        config.auth.api_key = "secret".to_string();
        CatalogClient::from_config(&config).unwrap().with_base_url(&server.uri())
    }

    fn criteria(required: &[&str], excluded: &[&str], min_score: i64) -> FilterCriteria {
        FilterCriteria {
            required_tags: required.iter().map(|s| s.to_string()).collect(),
            excluded_tags: excluded.iter().map(|s| s.to_string()).collect(),
            min_score,
            allowed_extensions: ["jpg", "jpeg", "png", "gif"].iter().map(|s| s.to_string()).collect(),
        }
    }

    fn record(tags: &str, score: i64, ext: &str) -> CandidateRecord {
        CandidateRecord {
            id: 1,
            file_url: "https://cdn.example/1.jpg".to_string(),
            tag_string: tags.to_string(),
            score,
            file_ext: ext.to_string(),
        }
    }

    #[test]
    fn test_required_and_excluded_tags() {
        let filter = criteria(&["solo"], &["comic"], 0);

        assert!(filter.is_valid(&record("1girl solo long_hair", 5, "jpg")));
        assert!(!filter.is_valid(&record("1girl long_hair", 5, "jpg")));
        assert!(!filter.is_valid(&record("solo comic", 5, "jpg")));
    }

    #[test]
    fn test_score_and_extension() {
        let filter = criteria(&[], &[], 10);

        assert!(filter.is_valid(&record("solo", 10, "png")));
        assert!(!filter.is_valid(&record("solo", 9, "png")));
        assert!(!filter.is_valid(&record("solo", 50, "mp4")));
        assert!(!filter.is_valid(&record("solo", 50, "zip")));
    }

    #[test]
    fn test_validity_is_deterministic() {
        let filter = criteria(&["solo"], &["sketch"], 3);
        let candidate = record("solo smile", 4, "gif");

        let first = filter.is_valid(&candidate);
        for _ in 0..10 {
            assert_eq!(filter.is_valid(&candidate), first);
        }
    }

    #[test]
    fn test_sidecar_tags_join_with_commas() {
        let candidate = record("1girl solo long_hair", 0, "jpg");
        assert_eq!(candidate.sidecar_tags(), "1girl,solo,long_hair");
    }

    #[test]
    fn test_filter_posts_drops_unresolvable_records() {
        let body = r#"[
            {"id": 1, "file_url": "https://cdn.example/1.jpg", "tag_string": "solo", "score": 5, "file_ext": "jpg", "md5": "d41d8cd9"},
            {"id": 2, "tag_string": "solo", "score": 5, "file_ext": "jpg"},
            {"id": 3, "file_url": "https://cdn.example/3.png", "tag_string": "solo comic", "score": 5, "file_ext": "PNG"},
            {"file_url": "https://cdn.example/4.png", "tag_string": "solo", "score": 5, "file_ext": "png"}
        ]"#;
        let posts: Vec<RawPost> = serde_json::from_str(body).unwrap();

        let page = filter_posts(posts, &criteria(&["solo"], &["comic"], 0));

        assert_eq!(page.fetched, 4);
        assert_eq!(page.candidates.len(), 1);
        assert_eq!(page.candidates[0].id, 1);
    }

    #[test]
    fn test_search_params() {
        let mut config = AppConfig::default();
        config.auth.api_key = "secret".to_string();
        let client = CatalogClient::from_config(&config).unwrap();

        let params = client.search_params(&criteria(&["1girl", "solo"], &[], 7), 200, 3);

        assert!(params.contains(&("tags", "1girl solo".to_string())));
        assert!(params.contains(&("page", "3".to_string())));
        assert!(params.contains(&("limit", "200".to_string())));
        assert!(params.contains(&("score", "7".to_string())));
        assert!(params.contains(&("api_key", "secret".to_string())));
    }

    #[tokio::test]
    async fn test_search_sends_query_and_filters_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .and(query_param("login", "alice"))
            .and(query_param("api_key", "secret"))
            .and(query_param("tags", "1girl solo"))
            .and(query_param("limit", "200"))
            .and(query_param("page", "2"))
            .and(query_param("score", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": 11, "file_url": "https://cdn.example/11.png", "tag_string": "1girl solo", "score": 9, "file_ext": "png"},
                {"id": 12, "file_url": "https://cdn.example/12.png", "tag_string": "1girl solo", "score": 2, "file_ext": "png"},
                {"id": 13, "tag_string": "1girl solo", "score": 9, "file_ext": "png"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let page = client
            .search(&criteria(&["1girl", "solo"], &[], 7), 200, 2)
            .await
            .unwrap();

        assert_eq!(page.fetched, 3);
        assert_eq!(page.candidates.len(), 1);
        assert_eq!(page.candidates[0].id, 11);
    }

    #[tokio::test]
    async fn test_search_non_success_status_is_service_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = client_for(&server).search(&criteria(&[], &[], 0), 200, 1).await;

        assert!(matches!(result, Err(CatalogError::Service(status)) if status == StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_search_malformed_body_is_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/posts.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let result = client_for(&server).search(&criteria(&[], &[], 0), 200, 1).await;

        assert!(matches!(result, Err(CatalogError::Decode(_))));
    }

    #[tokio::test]
    async fn test_tag_category_lookup() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tags.json"))
            .and(query_param("search[name]", "somebody"))
            .and(query_param("limit", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"name": "somebody", "category": 1}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/tags.json"))
            .and(query_param("search[name]", "nobody"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let client = client_for(&server);

        assert_eq!(client.tag_category("somebody").await.unwrap(), Some(1));
        assert_eq!(client.tag_category("nobody").await.unwrap(), None);
    }
}
