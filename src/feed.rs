//! Feed client: one poll of the upstream vehicle-position feed.

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::fetch::{HttpClient, fetch_bytes};
use crate::parser::parse_positions;
use crate::record::PositionRecord;

/// A source of vehicle positions. Stateless across calls.
///
/// An empty vector is a valid outcome, distinct from an error.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn poll(&self) -> Result<Vec<PositionRecord>, FeedError>;
}

/// Polls a JSON endpoint over HTTP.
pub struct HttpFeed<C> {
    client: C,
    url: String,
}

impl<C: HttpClient> HttpFeed<C> {
    pub fn new(client: C, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl<C: HttpClient> FeedSource for HttpFeed<C> {
    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn poll(&self) -> Result<Vec<PositionRecord>, FeedError> {
        let capture_time = Utc::now();
        let bytes = fetch_bytes(&self.client, &self.url).await?;
        debug!(bytes = bytes.len(), "Feed bytes received, parsing");

        let parsed = parse_positions(&bytes, capture_time)?;
        if parsed.dropped > 0 {
            warn!(
                dropped = parsed.dropped,
                kept = parsed.records.len(),
                "Dropped vehicles missing identifiers or coordinates"
            );
        }
        Ok(parsed.records)
    }
}
