use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio::time::Instant;
use tracing::warn;

use crate::metrics::{Metrics, RequestOutcome};

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
}

/// The work a single VU repeats for as long as it is active.
#[async_trait]
pub trait Scenario: Send + Sync {
    async fn iteration(&self, vu: usize, metrics: &Metrics) -> Result<(), ScenarioError>;
}

/// One GET against a fixed url per iteration.
#[derive(Clone)]
pub struct HttpGet {
    client: Client,
    url: Url,
}

impl HttpGet {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("vuramp/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Scenario for HttpGet {
    async fn iteration(&self, vu: usize, metrics: &Metrics) -> Result<(), ScenarioError> {
        let started = Instant::now();

        let response = match self.client.get(self.url.clone()).send().await {
            Ok(response) => response,
            Err(source) => {
                metrics.record_request(started.elapsed(), RequestOutcome::TransportError);
                warn!(vu, url = %self.url, error = %source, "request failed");
                return Err(ScenarioError::Request {
                    url: self.url.clone(),
                    source,
                });
            }
        };

        let status = response.status();
        // Timing covers the whole body, not just the headers.
        if let Err(source) = response.bytes().await {
            metrics.record_request(started.elapsed(), RequestOutcome::BodyError(status));
            warn!(
                vu,
                url = %self.url,
                %status,
                error = %source,
                "reading response body failed"
            );
            return Err(ScenarioError::Request {
                url: self.url.clone(),
                source,
            });
        }

        metrics.record_request(started.elapsed(), RequestOutcome::Response(status));
        Ok(())
    }
}
