use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::RawPosting;

/// One request against the external scrape source: a search term scoped to a
/// target company, run against a set of job boards in one location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeQuery {
    pub company: String,
    pub search_term: String,
    pub sites: Vec<String>,
    pub location: String,
    pub max_results: usize,
    /// Freshness window: only postings published within this many hours.
    pub hours_old: i64,
}

/// The external job-board collaborator. The scheduler only needs "a batch of
/// raw postings arrives for this query"; everything site-specific lives
/// behind this trait.
#[async_trait]
pub trait ScrapeSource: Send + Sync {
    async fn fetch(&self, query: &ScrapeQuery) -> Result<Vec<RawPosting>>;
}

/// Scrape source backed by an HTTP scraper service: POSTs the query as JSON
/// and expects a JSON array of raw postings back.
pub struct HttpScrapeSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpScrapeSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl ScrapeSource for HttpScrapeSource {
    async fn fetch(&self, query: &ScrapeQuery) -> Result<Vec<RawPosting>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(query)
            .send()
            .await
            .map_err(|e| Error::Source(e.to_string()))?;

        let response = response
            .error_for_status()
            .map_err(|e| Error::Source(e.to_string()))?;

        response
            .json::<Vec<RawPosting>>()
            .await
            .map_err(|e| Error::Source(e.to_string()))
    }
}
