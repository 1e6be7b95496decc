//! Paged queries against an HTTP search service
//!
//! The service takes `page_size` and `page_num` (1-based) query parameters,
//! returns a JSON body holding the page's results, and reports the total
//! number of matches in a response header (`CMR-Hits` by default).

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::{debug, instrument};

use super::PageFetcher;
use crate::error::{CoordinatorError, Result};
use crate::types::Page;

pub const DEFAULT_HITS_HEADER: &str = "CMR-Hits";
pub const DEFAULT_RESULTS_POINTER: &str = "/items";

/// Position in a paged search: next page number and results seen so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchCursor {
    pub page_num: u32,
    pub seen: u64,
}

pub struct SearchFetcher<T> {
    client: reqwest::Client,
    url: String,
    query: Vec<(String, String)>,
    page_size: u32,
    hits_header: String,
    results_pointer: String,
    _item: PhantomData<fn() -> T>,
}

impl<T> SearchFetcher<T> {
    pub fn new(client: reqwest::Client, url: impl Into<String>, page_size: u32) -> Self {
        Self {
            client,
            url: url.into(),
            query: Vec::new(),
            page_size: page_size.max(1),
            hits_header: DEFAULT_HITS_HEADER.to_string(),
            results_pointer: DEFAULT_RESULTS_POINTER.to_string(),
            _item: PhantomData,
        }
    }

    /// Add a search parameter sent with every page request
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_hits_header(mut self, header: impl Into<String>) -> Self {
        self.hits_header = header.into();
        self
    }

    /// JSON pointer locating the results array in the response body
    pub fn with_results_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.results_pointer = pointer.into();
        self
    }
}

#[async_trait]
impl<T> PageFetcher for SearchFetcher<T>
where
    T: DeserializeOwned + Send,
{
    type Item = T;
    type Cursor = SearchCursor;

    #[instrument(skip(self), fields(url = %self.url))]
    async fn fetch_page(&self, cursor: Option<&SearchCursor>) -> Result<Page<T, SearchCursor>> {
        let position = cursor.copied().unwrap_or(SearchCursor {
            page_num: 1,
            seen: 0,
        });

        let response = self
            .client
            .get(&self.url)
            .query(&self.query)
            .query(&[
                ("page_size", self.page_size.to_string()),
                ("page_num", position.page_num.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordinatorError::Search(format!(
                "{} returned {}: {}",
                self.url, status, body
            )));
        }

        let hits = response
            .headers()
            .get(self.hits_header.as_str())
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let mut body: Value = response.json().await?;
        let results = body
            .pointer_mut(&self.results_pointer)
            .map(Value::take)
            .ok_or_else(|| {
                CoordinatorError::Search(format!(
                    "response from {} has no results at '{}'",
                    self.url, self.results_pointer
                ))
            })?;
        let records: Vec<T> = serde_json::from_value(results)?;

        let seen = position.seen + records.len() as u64;
        // An empty page ends the query even if the hit count says otherwise,
        // otherwise a shrinking result set would be polled forever
        let has_more = !records.is_empty()
            && match hits {
                Some(total) => seen < total,
                None => records.len() as u32 >= self.page_size,
            };

        debug!(
            page_num = position.page_num,
            returned = records.len(),
            seen,
            hits = ?hits,
            has_more,
            "Fetched search page"
        );

        Ok(Page {
            records,
            cursor: Some(SearchCursor {
                page_num: position.page_num + 1,
                seen,
            }),
            has_more,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::paged::PagedResultQueue;
    use serde::Deserialize;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    #[derive(Debug, Deserialize, PartialEq)]
    struct Granule {
        id: String,
    }

    fn page_body(ids: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "items": ids.iter().map(|id| serde_json::json!({ "id": id })).collect::<Vec<_>>()
        })
    }

    #[tokio::test]
    async fn test_walks_pages_until_hit_count() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/search/granules"))
            .and(query_param("collection", "MOD09GQ"))
            .and(query_param("page_num", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("CMR-Hits", "3")
                    .set_body_json(page_body(&["g1", "g2"])),
            )
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/search/granules"))
            .and(query_param("page_num", "2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("CMR-Hits", "3")
                    .set_body_json(page_body(&["g3"])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let fetcher: SearchFetcher<Granule> = SearchFetcher::new(
            reqwest::Client::new(),
            format!("{}/search/granules", server.uri()),
            2,
        )
        .with_query("collection", "MOD09GQ");
        let mut queue = PagedResultQueue::new(fetcher);

        let mut ids = Vec::new();
        while let Some(granule) = queue.shift().await.unwrap() {
            ids.push(granule.id);
        }

        assert_eq!(ids, vec!["g1", "g2", "g3"]);
        assert_eq!(queue.pages_fetched(), 2);
        assert!(queue.shift().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_without_hits_header_stops_on_short_page() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(query_param("page_num", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["a", "b"])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(query_param("page_num", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["c"])))
            .mount(&server)
            .await;

        let fetcher: SearchFetcher<Granule> =
            SearchFetcher::new(reqwest::Client::new(), server.uri(), 2);
        let mut queue = PagedResultQueue::new(fetcher);

        let mut count = 0;
        while queue.shift().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert_eq!(queue.pages_fetched(), 2);
    }

    #[tokio::test]
    async fn test_custom_pointer_and_header() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Total-Count", "1")
                    .set_body_json(serde_json::json!({ "feed": { "entry": [{ "id": "only" }] } })),
            )
            .mount(&server)
            .await;

        let fetcher: SearchFetcher<Granule> =
            SearchFetcher::new(reqwest::Client::new(), server.uri(), 10)
                .with_hits_header("X-Total-Count")
                .with_results_pointer("/feed/entry");
        let mut queue = PagedResultQueue::new(fetcher);

        assert_eq!(
            queue.peek().await.unwrap(),
            Some(&Granule {
                id: "only".to_string()
            })
        );
        assert!(queue.shift().await.unwrap().is_some());
        assert!(queue.shift().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_propagates() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let fetcher: SearchFetcher<Granule> =
            SearchFetcher::new(reqwest::Client::new(), server.uri(), 10);
        let mut queue = PagedResultQueue::new(fetcher);

        let err = queue.shift().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Search(ref msg) if msg.contains("503")));
        assert!(!queue.is_finished());
    }

    #[tokio::test]
    async fn test_missing_results_field() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let fetcher: SearchFetcher<Granule> =
            SearchFetcher::new(reqwest::Client::new(), server.uri(), 10);
        let mut queue = PagedResultQueue::new(fetcher);

        assert!(queue.shift().await.is_err());
    }
}
