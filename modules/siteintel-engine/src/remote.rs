//! Adapter for tools that expose an HTTP endpoint.
//!
//! POSTs `{session_id, execution_id, domain, urls, config}` and expects a
//! tagged `BatchResult` JSON body back. Transport failures become typed
//! adapter failures; nothing here returns an error to the engine.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::adapter::{BatchResult, FailureKind, ProgressReporter, ScrapeRequest, ScraperAdapter};

pub struct RemoteScraperAdapter {
    client: reqwest::Client,
    endpoint: url::Url,
    timeout: Duration,
}

impl RemoteScraperAdapter {
    pub fn new(client: reqwest::Client, endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = url::Url::parse(endpoint)
            .with_context(|| format!("Invalid scraper endpoint: {endpoint}"))?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    fn classify_status(status: StatusCode) -> FailureKind {
        match status {
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS => FailureKind::Blocked,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => FailureKind::Timeout,
            _ => FailureKind::Error,
        }
    }
}

#[async_trait]
impl ScraperAdapter for RemoteScraperAdapter {
    async fn execute(&self, request: &ScrapeRequest, progress: &ProgressReporter) -> BatchResult {
        let timeout = request
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.timeout);

        progress.progress(5, format!("dispatching {} urls", request.urls.len()));
        debug!(endpoint = %self.endpoint, urls = request.urls.len(), "Calling remote scraper");

        let resp = match self
            .client
            .post(self.endpoint.clone())
            .timeout(timeout)
            .json(request)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!(endpoint = %self.endpoint, timeout_secs = timeout.as_secs(), "Remote scraper timed out");
                return BatchResult::failure(
                    FailureKind::Timeout,
                    format!("no response within {}s", timeout.as_secs()),
                );
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Remote scraper unreachable");
                return BatchResult::failure(FailureKind::Error, e.to_string());
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(endpoint = %self.endpoint, status = status.as_u16(), "Remote scraper returned error status");
            return BatchResult::failure(
                Self::classify_status(status),
                format!("HTTP {}: {}", status.as_u16(), message.trim()),
            );
        }

        match resp.json::<BatchResult>().await {
            Ok(result) => {
                progress.progress(80, "results received");
                result
            }
            Err(e) if e.is_timeout() => {
                BatchResult::failure(FailureKind::Timeout, "timed out reading response body")
            }
            Err(e) => BatchResult::failure(FailureKind::Error, format!("undecodable response: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ScrapeBatch, ScrapedPage, ScraperConfig};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::post;
    use axum::{Json, Router};
    use uuid::Uuid;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/run")
    }

    fn request(timeout_secs: Option<u64>) -> ScrapeRequest {
        ScrapeRequest {
            session_id: Uuid::new_v4(),
            execution_id: "exec-1".into(),
            domain: "acme.com".into(),
            urls: vec!["https://acme.com/".into()],
            config: ScraperConfig {
                timeout_secs,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn decodes_success_body() {
        let endpoint = serve(Router::new().route(
            "/run",
            post(|Json(req): Json<ScrapeRequest>| async move {
                Json(BatchResult::Success(ScrapeBatch {
                    pages: req
                        .urls
                        .iter()
                        .map(|u| ScrapedPage {
                            url: u.clone(),
                            content: "About Acme".into(),
                        })
                        .collect(),
                    cost_cents: 7,
                    ..Default::default()
                }))
            }),
        ))
        .await;

        let adapter =
            RemoteScraperAdapter::new(reqwest::Client::new(), &endpoint, Duration::from_secs(5)).unwrap();
        let (progress, _rx) = ProgressReporter::channel("exec-1");
        let result = adapter.execute(&request(None), &progress).await;
        assert_eq!(result.cost_cents(), 7);
        assert_eq!(result.batch().unwrap().pages[0].url, "https://acme.com/");
    }

    #[tokio::test]
    async fn rate_limit_maps_to_blocked() {
        let endpoint = serve(Router::new().route(
            "/run",
            post(|| async { (AxumStatus::TOO_MANY_REQUESTS, "slow down") }),
        ))
        .await;

        let adapter =
            RemoteScraperAdapter::new(reqwest::Client::new(), &endpoint, Duration::from_secs(5)).unwrap();
        let (progress, _rx) = ProgressReporter::channel("exec-1");
        match adapter.execute(&request(None), &progress).await {
            BatchResult::Failure(f) => {
                assert_eq!(f.kind, FailureKind::Blocked);
                assert!(f.message.contains("429"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_tool_maps_to_timeout() {
        let endpoint = serve(Router::new().route(
            "/run",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        ))
        .await;

        let adapter =
            RemoteScraperAdapter::new(reqwest::Client::new(), &endpoint, Duration::from_secs(30)).unwrap();
        let (progress, _rx) = ProgressReporter::channel("exec-1");
        match adapter.execute(&request(Some(1)), &progress).await {
            BatchResult::Failure(f) => assert_eq!(f.kind, FailureKind::Timeout),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn rejects_malformed_endpoint() {
        assert!(RemoteScraperAdapter::new(reqwest::Client::new(), "not a url", Duration::from_secs(1)).is_err());
    }
}
