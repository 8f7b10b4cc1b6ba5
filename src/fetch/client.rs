use async_trait::async_trait;
use reqwest::{Request, Response};

/// Transport seam for feed polling. One request, one response, no retries;
/// retrying is the orchestrator's job.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: Request) -> reqwest::Result<Response>;
}
