use std::{collections::HashMap, time::Duration};

use anyhow::{anyhow, Context, Error};
use async_trait::async_trait;
use reqwest::Client;

use crate::domain::{metrics::parse_request_counters, port::RequestCounterSource};

/// Scrapes the reverse proxy's text exposition endpoint.
pub struct HttpRequestCounterSource {
    client: Client,
    url: String,
    metric: String,
}

impl HttpRequestCounterSource {
    pub fn new(url: &str, metric: &str, timeout: Duration) -> Result<Self, Error> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Can't build proxy metrics client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            metric: metric.to_string(),
        })
    }
}

#[async_trait]
impl RequestCounterSource for HttpRequestCounterSource {
    async fn fetch_counters(&self) -> Result<HashMap<String, f64>, Error> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Can't reach proxy metrics at {}", self.url))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "Proxy metrics at {} answered {}",
                self.url,
                response.status()
            ));
        }
        let body = response.text().await?;
        Ok(parse_request_counters(&body, &self.metric))
    }
}
