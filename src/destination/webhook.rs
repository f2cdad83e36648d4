//! Webhook destination: one JSON `POST` per accepted result.

use super::{Destination, DestinationError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::time::Duration;

pub const KIND: &str = "webhook";

#[derive(Debug, Clone)]
pub struct WebhookDestination {
    client: Client,
    endpoint: String,
    timeout: Duration,
}

impl WebhookDestination {
    pub fn new(client: Client, endpoint: &str, timeout: Duration) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    fn url(&self) -> Result<Url, DestinationError> {
        if self.endpoint.trim().is_empty() {
            return Err(DestinationError::Invalid(
                "webhook endpoint cannot be empty".to_string(),
            ));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|e| DestinationError::Invalid(format!("{}: {e}", self.endpoint)))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(DestinationError::Invalid(format!(
                "unsupported webhook scheme: {scheme}"
            ))),
        }
    }
}

#[async_trait]
impl Destination for WebhookDestination {
    fn kind(&self) -> &str {
        KIND
    }

    fn validate(&self) -> Result<(), DestinationError> {
        self.url().map(|_| ())
    }

    async fn deliver(
        &self,
        payload: Bytes,
        headers: &HashMap<String, String>,
    ) -> Result<(), DestinationError> {
        let mut request = self
            .client
            .post(self.url()?)
            .header(CONTENT_TYPE, "application/json")
            .body(payload);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DestinationError::Timeout(self.timeout)
            } else {
                DestinationError::Transport(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DestinationError::Status(status));
        }
        Ok(())
    }
}
