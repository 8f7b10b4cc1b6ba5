mod client;
mod basic;

pub use client::HttpClient;
pub use basic::BasicClient;

use crate::error::FeedError;
use reqwest::header::{HeaderValue, USER_AGENT};

const AGENT: &str = concat!("brt-pipeline/", env!("CARGO_PKG_VERSION"));

/// Issues a GET for `url` and returns the body of a 2xx response.
///
/// Transport errors, timeouts and non-success statuses all map to
/// [`FeedError::Fetch`].
pub async fn fetch_bytes<C: HttpClient>(
    client: &C,
    url: &str,
) -> Result<Vec<u8>, FeedError> {
    let mut req = reqwest::Request::new(
        reqwest::Method::GET,
        url.parse()
            .map_err(|e| FeedError::Fetch(format!("invalid url {url}: {e}")))?,
    );
    req.headers_mut()
        .insert(USER_AGENT, HeaderValue::from_static(AGENT));

    let resp = client.execute(req).await.map_err(describe)?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(FeedError::Fetch(format!(
            "{url} returned status {status}: {}",
            body.chars().take(200).collect::<String>()
        )));
    }

    Ok(resp.bytes().await.map_err(describe)?.to_vec())
}

fn describe(e: reqwest::Error) -> FeedError {
    if e.is_timeout() {
        FeedError::Fetch(format!("request timed out: {e}"))
    } else {
        FeedError::Fetch(e.to_string())
    }
}
